//! Parameter environment for type inference in parameterized statements.
//!
//! Declared types from the Parse message seed the environment; placeholders
//! that appear next to a typed column pick up that column's type. Anything
//! still unresolved after analysis is typed as `text`.

use ember_common::error::SqlError;
use ember_common::types::{DataType, UNSPECIFIED_OID};

/// Highest `$n` a statement may reference, matching the 16-bit parameter
/// count of the Bind message.
pub const MAX_PARAMS: usize = 65535;

/// Tracks parameter types during analysis. Parameters are 1-indexed.
#[derive(Debug, Clone, Default)]
pub struct ParamEnv {
    param_types: Vec<Option<DataType>>,
}

impl ParamEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from client-declared OIDs. OID 0 means "infer".
    pub fn from_declared_oids(oids: &[i32]) -> Result<Self, SqlError> {
        let param_types = oids
            .iter()
            .map(|&oid| {
                if oid == UNSPECIFIED_OID {
                    Ok(None)
                } else {
                    DataType::from_pg_oid(oid)
                        .map(Some)
                        .ok_or(SqlError::UnknownParamType(oid))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { param_types })
    }

    fn slot(&mut self, index: usize) -> &mut Option<DataType> {
        debug_assert!(index >= 1, "Parameter index must be >= 1");
        let idx = index - 1;
        if idx >= self.param_types.len() {
            self.param_types.resize(idx + 1, None);
        }
        &mut self.param_types[idx]
    }

    /// Record a reference to `$index`, adopting `expected` when the
    /// parameter has no type yet. Declared types always win.
    pub fn unify(&mut self, index: usize, expected: Option<DataType>) {
        let slot = self.slot(index);
        if slot.is_none() {
            *slot = expected;
        }
    }

    pub fn get(&self, index: usize) -> Option<DataType> {
        index
            .checked_sub(1)
            .and_then(|i| self.param_types.get(i).copied().flatten())
    }

    pub fn len(&self) -> usize {
        self.param_types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.param_types.is_empty()
    }

    /// Freeze inferred types; unresolved parameters default to text.
    pub fn finalize(self) -> Vec<DataType> {
        self.param_types
            .into_iter()
            .map(|t| t.unwrap_or(DataType::Text))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_types_win() {
        let mut env = ParamEnv::from_declared_oids(&[20]).unwrap();
        env.unify(1, Some(DataType::Int32));
        assert_eq!(env.get(1), Some(DataType::Int64));
    }

    #[test]
    fn test_gaps_default_to_text() {
        let mut env = ParamEnv::from_declared_oids(&[0]).unwrap();
        env.unify(3, Some(DataType::Boolean));
        assert_eq!(
            env.finalize(),
            vec![DataType::Text, DataType::Text, DataType::Boolean]
        );
    }

    #[test]
    fn test_unknown_oid_rejected() {
        assert!(matches!(
            ParamEnv::from_declared_oids(&[23, 99999]),
            Err(SqlError::UnknownParamType(99999))
        ));
    }
}
