use std::sync::Arc;

use ember_common::datum::Datum;
use ember_common::error::EmberResult;
use ember_common::schema::{Distribution, TableSchema};
use ember_sql_frontend::types::{AnalyzedStatement, StatementBody};

use crate::plan::{ExecTarget, PhysicalPlan, PlannedStatement};

/// Turns analyzed statements into physical plans.
#[derive(Debug, Default, Clone, Copy)]
pub struct Planner;

impl Planner {
    pub fn new() -> Self {
        Self
    }

    /// Build the generic plan. Parameters stay symbolic.
    pub fn plan(&self, analyzed: &AnalyzedStatement) -> EmberResult<PlannedStatement> {
        let (plan, target) = match &analyzed.body {
            StatementBody::Empty => (PhysicalPlan::Empty, ExecTarget::Coordinator),
            StatementBody::Values { exprs } => (
                PhysicalPlan::Values {
                    exprs: exprs.clone(),
                },
                ExecTarget::Coordinator,
            ),
            StatementBody::Select {
                table,
                projection,
                filter,
            } => (
                PhysicalPlan::SeqScan {
                    schema: table.clone(),
                    projection: projection.clone(),
                    filter: filter.clone(),
                },
                read_target(table),
            ),
            StatementBody::Insert {
                table,
                columns,
                rows,
            } => (
                PhysicalPlan::Insert {
                    schema: table.clone(),
                    columns: columns.clone(),
                    rows: rows.clone(),
                },
                write_target(table),
            ),
            StatementBody::Update {
                table,
                assignments,
                filter,
            } => (
                PhysicalPlan::Update {
                    schema: table.clone(),
                    assignments: assignments.clone(),
                    filter: filter.clone(),
                },
                write_target(table),
            ),
            StatementBody::Delete { table, filter } => (
                PhysicalPlan::Delete {
                    schema: table.clone(),
                    filter: filter.clone(),
                },
                write_target(table),
            ),
            StatementBody::Transaction(ctl) => {
                (PhysicalPlan::Transaction(ctl.clone()), ExecTarget::Coordinator)
            }
            StatementBody::CreateTable {
                name,
                columns,
                key_column,
                if_not_exists,
            } => (
                PhysicalPlan::CreateTable {
                    name: name.clone(),
                    columns: columns.clone(),
                    distribution: match key_column {
                        Some(key_column) => Distribution::Hash {
                            key_column: *key_column,
                        },
                        None => Distribution::Replicated,
                    },
                    if_not_exists: *if_not_exists,
                },
                ExecTarget::Coordinator,
            ),
            StatementBody::DropTable { names, if_exists } => (
                PhysicalPlan::DropTable {
                    names: names.clone(),
                    if_exists: *if_exists,
                },
                ExecTarget::Coordinator,
            ),
        };
        tracing::trace!(kind = ?analyzed.kind, ?target, "planned statement");
        Ok(PlannedStatement {
            plan: Arc::new(plan),
            kind: analyzed.kind.clone(),
            target,
            param_types: analyzed.param_types.clone(),
            result_columns: analyzed.result_columns.clone(),
            catalog_generation: analyzed.catalog_generation,
            is_custom: false,
        })
    }

    /// Fold constant parameter values into a copy of the generic plan.
    pub fn custom_plan(&self, generic: &PlannedStatement, params: &[Datum]) -> PlannedStatement {
        if params.is_empty() {
            return generic.clone();
        }
        PlannedStatement {
            plan: Arc::new(generic.plan.substitute_params(params)),
            is_custom: true,
            ..generic.clone()
        }
    }
}

fn read_target(table: &TableSchema) -> ExecTarget {
    if table.is_replicated() {
        ExecTarget::AnyReplica
    } else {
        ExecTarget::AllShards
    }
}

fn write_target(table: &TableSchema) -> ExecTarget {
    if table.is_replicated() {
        ExecTarget::AllReplicas
    } else {
        ExecTarget::AllShards
    }
}
