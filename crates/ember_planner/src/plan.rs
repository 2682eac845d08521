use std::sync::Arc;

use ember_common::datum::Datum;
use ember_common::schema::{ColumnDef, Distribution, TableSchema};
use ember_common::types::DataType;
use ember_sql_frontend::types::*;

/// Physical execution plan.
/// Near 1:1 mapping from the analyzed statement; shards run the table
/// operators, the coordinator runs everything else.
#[derive(Debug, Clone)]
pub enum PhysicalPlan {
    Empty,
    /// Single row of scalar expressions, evaluated on the coordinator.
    Values { exprs: Vec<ScalarExpr> },
    SeqScan {
        schema: Arc<TableSchema>,
        projection: Vec<usize>,
        filter: Filter,
    },
    Insert {
        schema: Arc<TableSchema>,
        columns: Vec<usize>,
        rows: Vec<Vec<ScalarExpr>>,
    },
    Update {
        schema: Arc<TableSchema>,
        assignments: Vec<(usize, ScalarExpr)>,
        filter: Filter,
    },
    Delete {
        schema: Arc<TableSchema>,
        filter: Filter,
    },
    Transaction(TxnControl),
    CreateTable {
        name: String,
        columns: Vec<ColumnDef>,
        distribution: Distribution,
        if_not_exists: bool,
    },
    DropTable {
        names: Vec<String>,
        if_exists: bool,
    },
}

impl PhysicalPlan {
    /// Relation touched by a table operator.
    pub fn table(&self) -> Option<&Arc<TableSchema>> {
        match self {
            PhysicalPlan::SeqScan { schema, .. }
            | PhysicalPlan::Insert { schema, .. }
            | PhysicalPlan::Update { schema, .. }
            | PhysicalPlan::Delete { schema, .. } => Some(schema),
            _ => None,
        }
    }

    /// Replace parameter references with the bound values. References past
    /// the end of `params` are left in place.
    pub fn substitute_params(&self, params: &[Datum]) -> PhysicalPlan {
        let sub = |e: &ScalarExpr| substitute_expr(e, params);
        let sub_filter = |f: &Filter| Filter {
            conjuncts: f
                .conjuncts
                .iter()
                .map(|p| EqPredicate {
                    column: p.column,
                    value: sub(&p.value),
                })
                .collect(),
        };
        match self {
            PhysicalPlan::Values { exprs } => PhysicalPlan::Values {
                exprs: exprs.iter().map(sub).collect(),
            },
            PhysicalPlan::SeqScan {
                schema,
                projection,
                filter,
            } => PhysicalPlan::SeqScan {
                schema: schema.clone(),
                projection: projection.clone(),
                filter: sub_filter(filter),
            },
            PhysicalPlan::Insert {
                schema,
                columns,
                rows,
            } => PhysicalPlan::Insert {
                schema: schema.clone(),
                columns: columns.clone(),
                rows: rows.iter().map(|r| r.iter().map(sub).collect()).collect(),
            },
            PhysicalPlan::Update {
                schema,
                assignments,
                filter,
            } => PhysicalPlan::Update {
                schema: schema.clone(),
                assignments: assignments.iter().map(|(c, e)| (*c, sub(e))).collect(),
                filter: sub_filter(filter),
            },
            PhysicalPlan::Delete { schema, filter } => PhysicalPlan::Delete {
                schema: schema.clone(),
                filter: sub_filter(filter),
            },
            other => other.clone(),
        }
    }
}

fn substitute_expr(expr: &ScalarExpr, params: &[Datum]) -> ScalarExpr {
    match expr {
        ScalarExpr::Param { index } => match index.checked_sub(1).and_then(|i| params.get(i)) {
            Some(value) => ScalarExpr::Literal(value.clone()),
            None => expr.clone(),
        },
        other => other.clone(),
    }
}

/// Where a plan runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecTarget {
    /// Evaluated by the session without contacting shards.
    Coordinator,
    /// Hash-distributed relation: every shard works on its own rows.
    AllShards,
    /// Read of a replicated relation: any single copy answers.
    AnyReplica,
    /// Write to a replicated relation: every copy applies it.
    AllReplicas,
}

/// A plan plus everything the protocol layer needs to describe and run it.
#[derive(Debug, Clone)]
pub struct PlannedStatement {
    pub plan: Arc<PhysicalPlan>,
    pub kind: StatementKind,
    pub target: ExecTarget,
    pub param_types: Vec<DataType>,
    pub result_columns: Vec<ResultColumn>,
    /// Catalog generation the plan was built against.
    pub catalog_generation: u64,
    /// True when parameter values have been folded into the plan.
    pub is_custom: bool,
}

impl PlannedStatement {
    pub fn returns_rows(&self) -> bool {
        !self.result_columns.is_empty()
    }
}
