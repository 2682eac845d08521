use ember_common::datum::{Datum, OwnedRow};
use ember_common::error::{EmberResult, ExecutionError};
use ember_common::schema::TableSchema;
use ember_sql_frontend::types::{Filter, ScalarExpr};

/// Evaluate a scalar expression. `row` is required for column references.
pub fn eval_scalar(expr: &ScalarExpr, row: Option<&OwnedRow>, params: &[Datum]) -> EmberResult<Datum> {
    match expr {
        ScalarExpr::Literal(d) => Ok(d.clone()),
        ScalarExpr::Param { index } => index
            .checked_sub(1)
            .and_then(|i| params.get(i))
            .cloned()
            .ok_or_else(|| ExecutionError::ParamMissing(*index).into()),
        ScalarExpr::Column(idx) => row
            .and_then(|r| r.get(*idx))
            .cloned()
            .ok_or_else(|| ExecutionError::ColumnOutOfBounds(*idx).into()),
    }
}

/// Evaluate a row of coordinator-side expressions.
pub fn eval_values(exprs: &[ScalarExpr], params: &[Datum]) -> EmberResult<OwnedRow> {
    let values = exprs
        .iter()
        .map(|e| eval_scalar(e, None, params))
        .collect::<EmberResult<Vec<_>>>()?;
    Ok(OwnedRow::new(values))
}

/// Resolve every conjunct's value, coerced to its column's type.
pub(crate) fn resolve_filter(
    filter: &Filter,
    schema: &TableSchema,
    params: &[Datum],
) -> EmberResult<Vec<(usize, Datum)>> {
    filter
        .conjuncts
        .iter()
        .map(|p| {
            let value = eval_scalar(&p.value, None, params)?;
            let value = match schema.column_type(p.column) {
                Some(ty) => value.coerce_to(ty)?,
                None => return Err(ExecutionError::ColumnOutOfBounds(p.column).into()),
            };
            Ok((p.column, value))
        })
        .collect()
}

pub(crate) fn row_matches(row: &OwnedRow, resolved: &[(usize, Datum)]) -> bool {
    resolved
        .iter()
        .all(|(col, value)| row.get(*col).is_some_and(|d| d.sql_eq(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_sql_frontend::types::EqPredicate;
    use ember_common::schema::{ColumnDef, Distribution};
    use ember_common::types::{DataType, TableId};

    #[test]
    fn test_missing_param() {
        let err = eval_scalar(&ScalarExpr::Param { index: 2 }, None, &[Datum::Int32(1)]).unwrap_err();
        assert_eq!(err.pg_sqlstate(), "08P01");
    }

    #[test]
    fn test_filter_coerces_params_to_column_type() {
        let schema = TableSchema {
            id: TableId(1),
            name: "t".into(),
            columns: vec![ColumnDef::new("k", DataType::Int64)],
            distribution: Distribution::Hash { key_column: 0 },
        };
        let filter = Filter {
            conjuncts: vec![EqPredicate {
                column: 0,
                value: ScalarExpr::Param { index: 1 },
            }],
        };
        let resolved = resolve_filter(&filter, &schema, &[Datum::Int32(9)]).unwrap();
        assert_eq!(resolved, vec![(0, Datum::Int64(9))]);
        assert!(row_matches(&OwnedRow::new(vec![Datum::Int64(9)]), &resolved));
        assert!(!row_matches(&OwnedRow::new(vec![Datum::Null]), &resolved));
    }
}
