use std::sync::Arc;

use ember_common::catalog::Catalog;
use ember_common::datum::Datum;
use ember_common::error::{EmberResult, SqlError};
use ember_common::schema::{ColumnDef, TableSchema};
use ember_common::types::DataType;
use sqlparser::ast::{
    self, BinaryOperator, Expr, ObjectName, ObjectType, SelectItem, SetExpr, Statement,
    TableFactor, UnaryOperator, Value,
};

use crate::param_env::{ParamEnv, MAX_PARAMS};
use crate::types::*;

/// Classify a raw statement without touching the catalog.
pub fn classify(stmt: &Statement) -> StatementKind {
    match stmt {
        Statement::Query(_) => StatementKind::Select,
        Statement::Insert(_) => StatementKind::Insert,
        Statement::Update { .. } => StatementKind::Update,
        Statement::Delete(_) => StatementKind::Delete,
        Statement::Merge { .. } => StatementKind::Merge,
        Statement::StartTransaction { .. } => StatementKind::Transaction(TxnControl::Begin),
        Statement::Commit { .. } => StatementKind::Transaction(TxnControl::Commit),
        Statement::Rollback {
            savepoint: Some(name),
            ..
        } => StatementKind::Transaction(TxnControl::RollbackTo(name.value.clone())),
        Statement::Rollback { .. } => StatementKind::Transaction(TxnControl::Rollback),
        Statement::Savepoint { name } => {
            StatementKind::Transaction(TxnControl::Savepoint(name.value.clone()))
        }
        Statement::ReleaseSavepoint { name } => {
            StatementKind::Transaction(TxnControl::Release(name.value.clone()))
        }
        Statement::CreateTable(_) => StatementKind::CreateTable,
        Statement::Drop {
            object_type: ObjectType::Table,
            ..
        } => StatementKind::DropTable,
        _ => StatementKind::Other,
    }
}

/// Resolve `stmt` against the catalog. `declared_oids` are the parameter
/// types from the Parse message (0 = infer).
pub fn analyze(
    catalog: &Catalog,
    stmt: &Statement,
    declared_oids: &[i32],
) -> EmberResult<AnalyzedStatement> {
    let catalog_generation = catalog.generation();
    let mut analyzer = Analyzer {
        catalog,
        env: ParamEnv::from_declared_oids(declared_oids)?,
    };
    let kind = classify(stmt);
    let (body, result_columns) = analyzer.analyze_body(stmt, &kind)?;
    let param_types = analyzer.env.finalize();
    tracing::trace!(?kind, params = param_types.len(), "analyzed statement");
    Ok(AnalyzedStatement {
        kind,
        body,
        param_types,
        result_columns,
        catalog_generation,
    })
}

struct Analyzer<'a> {
    catalog: &'a Catalog,
    env: ParamEnv,
}

type Analyzed = (StatementBody, Vec<ResultColumn>);

impl Analyzer<'_> {
    fn analyze_body(&mut self, stmt: &Statement, kind: &StatementKind) -> EmberResult<Analyzed> {
        match stmt {
            Statement::Query(query) => self.analyze_query(query),
            Statement::Insert(insert) => self.analyze_insert(insert),
            Statement::Update {
                table,
                assignments,
                from,
                selection,
                returning,
                ..
            } => {
                if from.is_some() {
                    return Err(SqlError::Unsupported("UPDATE ... FROM".into()).into());
                }
                if returning.is_some() {
                    return Err(SqlError::Unsupported("RETURNING".into()).into());
                }
                self.analyze_update(table, assignments, selection.as_ref())
            }
            Statement::Delete(delete) => self.analyze_delete(delete),
            Statement::Merge { .. } => Err(SqlError::Unsupported("MERGE".into()).into()),
            Statement::CreateTable(create) => self.analyze_create_table(create),
            Statement::Drop {
                object_type: ObjectType::Table,
                if_exists,
                names,
                ..
            } => Ok((
                StatementBody::DropTable {
                    names: names.iter().map(object_name).collect(),
                    if_exists: *if_exists,
                },
                Vec::new(),
            )),
            _ => match kind {
                StatementKind::Transaction(ctl) => {
                    Ok((StatementBody::Transaction(ctl.clone()), Vec::new()))
                }
                _ => Err(SqlError::Unsupported(format!("statement \"{stmt}\"")).into()),
            },
        }
    }

    fn analyze_query(&mut self, query: &ast::Query) -> EmberResult<Analyzed> {
        let select = match query.body.as_ref() {
            SetExpr::Select(select) => select,
            _ => return Err(SqlError::Unsupported("set operations".into()).into()),
        };

        if select.from.is_empty() {
            let mut exprs = Vec::with_capacity(select.projection.len());
            let mut columns = Vec::with_capacity(select.projection.len());
            for item in &select.projection {
                let (expr, alias) = match item {
                    SelectItem::UnnamedExpr(expr) => (expr, None),
                    SelectItem::ExprWithAlias { expr, alias } => (expr, Some(alias.value.clone())),
                    _ => {
                        return Err(SqlError::Unsupported("SELECT * without FROM".into()).into())
                    }
                };
                let scalar = self.scalar(expr, None)?;
                let data_type = match &scalar {
                    ScalarExpr::Literal(d) => d.data_type().unwrap_or(DataType::Text),
                    ScalarExpr::Param { index } => self.env.get(*index).unwrap_or(DataType::Text),
                    ScalarExpr::Column(_) => DataType::Text,
                };
                columns.push(ResultColumn {
                    name: alias.unwrap_or_else(|| "?column?".into()),
                    data_type,
                });
                exprs.push(scalar);
            }
            return Ok((StatementBody::Values { exprs }, columns));
        }

        if select.from.len() != 1 || !select.from[0].joins.is_empty() {
            return Err(SqlError::Unsupported("joins".into()).into());
        }
        let table = self.table_from_factor(&select.from[0].relation)?;
        let mut projection = Vec::new();
        let mut columns = Vec::new();
        for item in &select.projection {
            match item {
                SelectItem::Wildcard(_) => {
                    for (idx, col) in table.columns.iter().enumerate() {
                        projection.push(idx);
                        columns.push(ResultColumn {
                            name: col.name.clone(),
                            data_type: col.data_type,
                        });
                    }
                }
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                    let name = column_ref(expr).ok_or_else(|| {
                        SqlError::Unsupported("expressions in a select list over a table".into())
                    })?;
                    let idx = table
                        .find_column(&name)
                        .ok_or_else(|| SqlError::UnknownColumn(name.clone()))?;
                    let label = match item {
                        SelectItem::ExprWithAlias { alias, .. } => alias.value.clone(),
                        _ => table.columns[idx].name.clone(),
                    };
                    projection.push(idx);
                    columns.push(ResultColumn {
                        name: label,
                        data_type: table.columns[idx].data_type,
                    });
                }
                _ => return Err(SqlError::Unsupported("qualified wildcards".into()).into()),
            }
        }
        let filter = self.filter(select.selection.as_ref(), &table)?;
        Ok((
            StatementBody::Select {
                table,
                projection,
                filter,
            },
            columns,
        ))
    }

    fn analyze_insert(&mut self, insert: &ast::Insert) -> EmberResult<Analyzed> {
        let table = self.table(&object_name(&insert.table_name))?;
        if insert.returning.is_some() {
            return Err(SqlError::Unsupported("RETURNING".into()).into());
        }
        let columns: Vec<usize> = if insert.columns.is_empty() {
            (0..table.columns.len()).collect()
        } else {
            insert
                .columns
                .iter()
                .map(|c| {
                    table
                        .find_column(&c.value)
                        .ok_or_else(|| SqlError::UnknownColumn(c.value.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        let source = insert
            .source
            .as_ref()
            .ok_or_else(|| SqlError::Unsupported("INSERT without VALUES".into()))?;
        let values = match source.body.as_ref() {
            SetExpr::Values(values) => values,
            _ => return Err(SqlError::Unsupported("INSERT ... SELECT".into()).into()),
        };
        let mut rows = Vec::with_capacity(values.rows.len());
        for row in &values.rows {
            if row.len() != columns.len() {
                return Err(SqlError::InvalidExpression(format!(
                    "INSERT has {} target columns but {} expressions",
                    columns.len(),
                    row.len()
                ))
                .into());
            }
            let exprs = row
                .iter()
                .zip(&columns)
                .map(|(expr, &col)| self.scalar(expr, table.column_type(col)))
                .collect::<EmberResult<Vec<_>>>()?;
            rows.push(exprs);
        }
        Ok((
            StatementBody::Insert {
                table,
                columns,
                rows,
            },
            Vec::new(),
        ))
    }

    fn analyze_update(
        &mut self,
        target: &ast::TableWithJoins,
        assignments: &[ast::Assignment],
        selection: Option<&Expr>,
    ) -> EmberResult<Analyzed> {
        let table = self.table_from_factor(&target.relation)?;
        let mut bound = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let name = match &assignment.target {
                ast::AssignmentTarget::ColumnName(name) => object_name(name),
                ast::AssignmentTarget::Tuple(_) => {
                    return Err(SqlError::Unsupported("tuple assignment".into()).into())
                }
            };
            let idx = table
                .find_column(&name)
                .ok_or_else(|| SqlError::UnknownColumn(name.clone()))?;
            let value = self.scalar(&assignment.value, table.column_type(idx))?;
            bound.push((idx, value));
        }
        let filter = self.filter(selection, &table)?;
        Ok((
            StatementBody::Update {
                table,
                assignments: bound,
                filter,
            },
            Vec::new(),
        ))
    }

    fn analyze_delete(&mut self, delete: &ast::Delete) -> EmberResult<Analyzed> {
        if delete.using.is_some() {
            return Err(SqlError::Unsupported("DELETE ... USING".into()).into());
        }
        let from_tables = match &delete.from {
            ast::FromTable::WithFromKeyword(tables) => tables,
            ast::FromTable::WithoutKeyword(tables) => tables,
        };
        let from = match from_tables.as_slice() {
            [single] if single.joins.is_empty() => single,
            _ => return Err(SqlError::Unsupported("multi-table DELETE".into()).into()),
        };
        let table = self.table_from_factor(&from.relation)?;
        let filter = self.filter(delete.selection.as_ref(), &table)?;
        Ok((StatementBody::Delete { table, filter }, Vec::new()))
    }

    fn analyze_create_table(&mut self, create: &ast::CreateTable) -> EmberResult<Analyzed> {
        let name = object_name(&create.name);
        if create.columns.is_empty() {
            return Err(SqlError::InvalidExpression(
                "a distributed table needs at least one column".into(),
            )
            .into());
        }
        let mut columns = Vec::with_capacity(create.columns.len());
        let mut primary_key = None;
        for (idx, col) in create.columns.iter().enumerate() {
            let type_name = col.data_type.to_string();
            let data_type = DataType::from_sql_name(&type_name)
                .ok_or_else(|| SqlError::Unsupported(format!("type {type_name}")))?;
            let is_pk = col.options.iter().any(|opt| {
                matches!(
                    opt.option,
                    ast::ColumnOption::Unique {
                        is_primary: true,
                        ..
                    }
                )
            });
            if is_pk && primary_key.is_none() {
                primary_key = Some(idx);
            }
            columns.push(ColumnDef::new(col.name.value.to_ascii_lowercase(), data_type));
        }
        for constraint in &create.constraints {
            if let ast::TableConstraint::PrimaryKey { columns: pk, .. } = constraint {
                if let Some(first) = pk.first() {
                    let idx = columns
                        .iter()
                        .position(|c| c.name.eq_ignore_ascii_case(&first.value))
                        .ok_or_else(|| SqlError::UnknownColumn(first.value.clone()))?;
                    primary_key.get_or_insert(idx);
                }
            }
        }
        Ok((
            StatementBody::CreateTable {
                name,
                columns,
                key_column: primary_key,
                if_not_exists: create.if_not_exists,
            },
            Vec::new(),
        ))
    }

    fn filter(&mut self, selection: Option<&Expr>, table: &TableSchema) -> EmberResult<Filter> {
        let mut filter = Filter::default();
        if let Some(expr) = selection {
            self.collect_conjuncts(expr, table, &mut filter.conjuncts)?;
        }
        Ok(filter)
    }

    fn collect_conjuncts(
        &mut self,
        expr: &Expr,
        table: &TableSchema,
        out: &mut Vec<EqPredicate>,
    ) -> EmberResult<()> {
        match expr {
            Expr::Nested(inner) => self.collect_conjuncts(inner, table, out),
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                self.collect_conjuncts(left, table, out)?;
                self.collect_conjuncts(right, table, out)
            }
            Expr::BinaryOp {
                left,
                op: BinaryOperator::Eq,
                right,
            } => {
                let (name, value_expr) = match (column_ref(left), column_ref(right)) {
                    (Some(name), None) => (name, right.as_ref()),
                    (None, Some(name)) => (name, left.as_ref()),
                    _ => {
                        return Err(SqlError::Unsupported(
                            "comparisons that are not column = value".into(),
                        )
                        .into())
                    }
                };
                let column = table
                    .find_column(&name)
                    .ok_or_else(|| SqlError::UnknownColumn(name.clone()))?;
                let value = self.scalar(value_expr, table.column_type(column))?;
                out.push(EqPredicate { column, value });
                Ok(())
            }
            _ => Err(SqlError::Unsupported(
                "WHERE clauses other than ANDed equality predicates".into(),
            )
            .into()),
        }
    }

    fn scalar(&mut self, expr: &Expr, expected: Option<DataType>) -> EmberResult<ScalarExpr> {
        match expr {
            Expr::Nested(inner) => self.scalar(inner, expected),
            Expr::Value(Value::Placeholder(p)) => {
                let index = parse_placeholder(p)?;
                self.env.unify(index, expected);
                Ok(ScalarExpr::Param { index })
            }
            Expr::Value(value) => {
                let datum = literal(value)?;
                Ok(ScalarExpr::Literal(coerce_literal(datum, expected)?))
            }
            Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr: inner,
            } => match inner.as_ref() {
                Expr::Value(Value::Number(n, _)) => {
                    let datum = parse_number(&format!("-{n}"))?;
                    Ok(ScalarExpr::Literal(coerce_literal(datum, expected)?))
                }
                other => Err(SqlError::Unsupported(format!("expression -{other}")).into()),
            },
            Expr::Identifier(_) | Expr::CompoundIdentifier(_) => Err(SqlError::Unsupported(
                "column references in this position".into(),
            )
            .into()),
            other => Err(SqlError::Unsupported(format!("expression {other}")).into()),
        }
    }

    fn table(&self, name: &str) -> Result<Arc<TableSchema>, SqlError> {
        self.catalog
            .get_table(name)
            .ok_or_else(|| SqlError::UnknownTable(name.to_string()))
    }

    fn table_from_factor(&self, factor: &TableFactor) -> Result<Arc<TableSchema>, SqlError> {
        match factor {
            TableFactor::Table { name, .. } => self.table(&object_name(name)),
            _ => Err(SqlError::Unsupported("subqueries in FROM".into())),
        }
    }
}

fn object_name(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.to_ascii_lowercase())
        .unwrap_or_default()
}

fn column_ref(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.clone()),
        Expr::Nested(inner) => column_ref(inner),
        _ => None,
    }
}

fn parse_placeholder(p: &str) -> Result<usize, SqlError> {
    let index = p
        .strip_prefix('$')
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|&n| n >= 1)
        .ok_or_else(|| SqlError::InvalidExpression(format!("invalid parameter reference {p}")))?;
    if index > MAX_PARAMS {
        return Err(SqlError::UndefinedParameter(index));
    }
    Ok(index)
}

fn literal(value: &Value) -> Result<Datum, SqlError> {
    match value {
        Value::Number(n, _) => parse_number(n),
        Value::SingleQuotedString(s) => Ok(Datum::Text(s.clone())),
        Value::Boolean(b) => Ok(Datum::Boolean(*b)),
        Value::Null => Ok(Datum::Null),
        other => Err(SqlError::Unsupported(format!("literal {other}"))),
    }
}

fn parse_number(n: &str) -> Result<Datum, SqlError> {
    if let Ok(v) = n.parse::<i32>() {
        Ok(Datum::Int32(v))
    } else if let Ok(v) = n.parse::<i64>() {
        Ok(Datum::Int64(v))
    } else {
        n.parse::<f64>()
            .map(Datum::Float64)
            .map_err(|_| SqlError::InvalidExpression(format!("invalid number {n}")))
    }
}

fn coerce_literal(datum: Datum, expected: Option<DataType>) -> EmberResult<Datum> {
    match expected {
        Some(target) => Ok(datum.coerce_to(target)?),
        None => Ok(datum),
    }
}
