//! Bind parameter decoding and result-format resolution.

use ember_common::datum::{Datum, OwnedRow};
use ember_common::error::{EmberResult, ExecutionError, ProtocolError};
use ember_common::types::{DataType, FormatCode};

use crate::codec::RawValue;

/// One Bind's worth of raw parameters, as received.
#[derive(Debug, Clone, Copy)]
pub struct ParameterSet<'a> {
    pub values: &'a [RawValue],
    pub formats: &'a [i16],
}

impl<'a> ParameterSet<'a> {
    pub fn new(values: &'a [RawValue], formats: &'a [i16]) -> Self {
        Self { values, formats }
    }

    /// Decode against the statement's parameter types.
    ///
    /// Format arity is checked before parameter count, then each value is
    /// run through its type's text or binary input function.
    pub fn decode(&self, types: &[DataType], statement: &str) -> EmberResult<Vec<Datum>> {
        if self.formats.len() > 1 && self.formats.len() != self.values.len() {
            return Err(ProtocolError::FormatCountMismatch {
                codes: self.formats.len(),
                params: self.values.len(),
            }
            .into());
        }
        let formats = expand_formats(self.formats, self.values.len())?;
        if self.values.len() != types.len() {
            return Err(ProtocolError::ParamCountMismatch {
                supplied: self.values.len(),
                required: types.len(),
                statement: statement.to_string(),
            }
            .into());
        }
        self.values
            .iter()
            .zip(types)
            .zip(formats)
            .enumerate()
            .map(|(idx, ((raw, ty), format))| decode_value(raw.as_deref(), *ty, format, idx + 1))
            .collect()
    }
}

fn decode_value(
    raw: Option<&[u8]>,
    ty: DataType,
    format: FormatCode,
    param_index: usize,
) -> EmberResult<Datum> {
    let Some(bytes) = raw else {
        return Ok(Datum::Null);
    };
    let datum = match format {
        FormatCode::Text => {
            let text = std::str::from_utf8(bytes).map_err(|_| ExecutionError::InvalidEncoding)?;
            Datum::from_pg_text(ty, text)?
        }
        FormatCode::Binary => Datum::from_pg_binary(ty, bytes, param_index)?,
    };
    Ok(datum)
}

/// Expand a format-code list to `n` entries: empty means all text, one
/// code applies to every column, otherwise there must be exactly `n`.
fn expand_formats(codes: &[i16], n: usize) -> EmberResult<Vec<FormatCode>> {
    let decode = |c: i16| FormatCode::from_i16(c).ok_or(ProtocolError::UnsupportedFormatCode(c));
    match codes {
        [] => Ok(vec![FormatCode::Text; n]),
        [one] => Ok(vec![decode(*one)?; n]),
        many if many.len() == n => Ok(many
            .iter()
            .map(|c| decode(*c))
            .collect::<Result<Vec<_>, _>>()?),
        _ => Err(ProtocolError::InvalidMessage(format!(
            "{} format codes for {n} values",
            codes.len()
        ))
        .into()),
    }
}

/// Resolve Bind's result-format codes against the statement's columns.
pub fn resolve_result_formats(codes: &[i16], columns: usize) -> EmberResult<Vec<FormatCode>> {
    if codes.len() > 1 && codes.len() != columns {
        return Err(ProtocolError::ResultFormatCountMismatch {
            codes: codes.len(),
            columns,
        }
        .into());
    }
    expand_formats(codes, columns)
}

/// Encode a result row for DataRow. Missing formats default to text.
pub fn encode_row(row: &OwnedRow, formats: &[FormatCode]) -> Vec<RawValue> {
    row.values
        .iter()
        .enumerate()
        .map(|(i, d)| match formats.get(i).copied().unwrap_or_default() {
            FormatCode::Text => d.to_pg_text().map(String::into_bytes),
            FormatCode::Binary => d.to_pg_binary(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> RawValue {
        Some(s.as_bytes().to_vec())
    }

    #[test]
    fn test_text_and_binary_mix() {
        let values = vec![text("42"), Some(7i64.to_be_bytes().to_vec()), None];
        let set = ParameterSet::new(&values, &[0, 1, 0]);
        let out = set
            .decode(&[DataType::Int32, DataType::Int64, DataType::Text], "s")
            .unwrap();
        assert_eq!(out, vec![Datum::Int32(42), Datum::Int64(7), Datum::Null]);
    }

    #[test]
    fn test_count_mismatch_is_protocol_violation() {
        for (supplied, required) in [(0usize, 1usize), (2, 1), (1, 3)] {
            let values = vec![text("1"); supplied];
            let types = vec![DataType::Int32; required];
            let err = ParameterSet::new(&values, &[]).decode(&types, "s1").unwrap_err();
            assert_eq!(err.pg_sqlstate(), "08P01", "{supplied} vs {required}");
        }
    }

    #[test]
    fn test_format_arity() {
        let values = vec![text("1"), text("2")];
        let err = ParameterSet::new(&values, &[0, 0, 0])
            .decode(&[DataType::Int32, DataType::Int32], "")
            .unwrap_err();
        assert!(err.to_string().contains("3 parameter formats but 2 parameters"));
        let err = ParameterSet::new(&values, &[2])
            .decode(&[DataType::Int32, DataType::Int32], "")
            .unwrap_err();
        assert_eq!(err.pg_sqlstate(), "08P01");
    }

    #[test]
    fn test_binary_must_consume_whole_buffer() {
        let values = vec![Some(vec![0, 0, 0, 1, 9])];
        let err = ParameterSet::new(&values, &[1])
            .decode(&[DataType::Int32], "")
            .unwrap_err();
        assert_eq!(err.pg_sqlstate(), "22P03");
    }

    #[test]
    fn test_text_requires_utf8() {
        let values = vec![Some(vec![0xc3, 0x28])];
        let err = ParameterSet::new(&values, &[])
            .decode(&[DataType::Text], "")
            .unwrap_err();
        assert_eq!(err.pg_sqlstate(), "22021");
    }

    #[test]
    fn test_result_formats() {
        assert_eq!(
            resolve_result_formats(&[1], 2).unwrap(),
            vec![FormatCode::Binary, FormatCode::Binary]
        );
        assert_eq!(resolve_result_formats(&[], 0).unwrap(), vec![]);
        assert!(resolve_result_formats(&[0, 1, 0], 2).is_err());
    }

    #[test]
    fn test_encode_row_formats() {
        let row = OwnedRow::new(vec![Datum::Int32(5), Datum::Null]);
        assert_eq!(
            encode_row(&row, &[FormatCode::Binary]),
            vec![Some(5i32.to_be_bytes().to_vec()), None]
        );
        assert_eq!(encode_row(&row, &[]), vec![Some(b"5".to_vec()), None]);
    }
}
