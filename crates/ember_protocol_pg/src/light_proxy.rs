//! Single-shard fast path ("light proxy").
//!
//! A statement whose rows are pinned to one shard by an equality on the
//! distribution key can skip scatter/gather and be shipped straight to that
//! shard. Eligibility is decided once per prepared statement; a decision
//! keyed on a parameter is re-resolved for every Bind.

use ember_cluster::sharding::shard_for_key;
use ember_cluster::ShardMap;
use ember_common::datum::Datum;
use ember_common::types::{DataType, ShardId};
use ember_planner::{PhysicalPlan, PlannedStatement};
use ember_sql_frontend::types::{ScalarExpr, StatementKind};

/// Why a statement cannot take the fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IneligibleReason {
    Disabled,
    NotSingleStatement,
    UnsupportedKind,
    NoRelation,
    ReplicatedRelation,
    NoDistributionKeyPredicate,
    UnsupportedKeyExpression,
    MultiRowInsert,
    UpdatesDistributionKey,
}

impl IneligibleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IneligibleReason::Disabled => "disabled",
            IneligibleReason::NotSingleStatement => "not_single_statement",
            IneligibleReason::UnsupportedKind => "unsupported_kind",
            IneligibleReason::NoRelation => "no_relation",
            IneligibleReason::ReplicatedRelation => "replicated_relation",
            IneligibleReason::NoDistributionKeyPredicate => "no_distribution_key_predicate",
            IneligibleReason::UnsupportedKeyExpression => "unsupported_key_expression",
            IneligibleReason::MultiRowInsert => "multi_row_insert",
            IneligibleReason::UpdatesDistributionKey => "updates_distribution_key",
        }
    }
}

/// Cached routing decision for a prepared statement.
#[derive(Debug, Clone, PartialEq)]
pub enum FastPathDecision {
    NotEligible(IneligibleReason),
    /// The key is a constant; the shard never changes.
    Static { shard: ShardId },
    /// The key is `$param`; hash the bound value, coerced to `key_type`.
    Keyed { param: usize, key_type: DataType },
}

impl FastPathDecision {
    pub fn is_eligible(&self) -> bool {
        !matches!(self, FastPathDecision::NotEligible(_))
    }

    /// Shard for one set of bound parameters. `None` means the parameters do
    /// not pin a single shard and this execution takes the full path.
    pub fn resolve(&self, params: &[Datum], shard_map: &ShardMap) -> Option<ShardId> {
        match self {
            FastPathDecision::NotEligible(_) => None,
            FastPathDecision::Static { shard } => Some(*shard),
            FastPathDecision::Keyed { param, key_type } => {
                let value = params.get(param.checked_sub(1)?)?;
                let key = value.coerce_to(*key_type).ok()?;
                Some(shard_for_key(&key, shard_map))
            }
        }
    }
}

/// Decide whether `planned` can be routed to a single shard.
/// `statement_count` is the number of statements in the source text.
pub fn decide(
    planned: &PlannedStatement,
    statement_count: usize,
    enabled: bool,
    shard_map: &ShardMap,
) -> FastPathDecision {
    use FastPathDecision::NotEligible;
    use IneligibleReason::*;

    if !enabled {
        return NotEligible(Disabled);
    }
    if statement_count != 1 {
        return NotEligible(NotSingleStatement);
    }
    if !matches!(
        planned.kind,
        StatementKind::Select | StatementKind::Insert | StatementKind::Update | StatementKind::Delete
    ) {
        return NotEligible(UnsupportedKind);
    }
    let Some(table) = planned.plan.table() else {
        return NotEligible(NoRelation);
    };
    let Some(key_column) = table.distribution_key() else {
        return NotEligible(ReplicatedRelation);
    };
    let Some(key_type) = table.column_type(key_column) else {
        return NotEligible(UnsupportedKeyExpression);
    };

    let key_expr = match planned.plan.as_ref() {
        PhysicalPlan::Insert { columns, rows, .. } => {
            let [row] = rows.as_slice() else {
                return NotEligible(MultiRowInsert);
            };
            match columns.iter().position(|c| *c == key_column) {
                Some(pos) => row.get(pos).cloned(),
                // The key column defaults to NULL.
                None => Some(ScalarExpr::Literal(Datum::Null)),
            }
        }
        PhysicalPlan::Update {
            assignments,
            filter,
            ..
        } => {
            if assignments.iter().any(|(c, _)| *c == key_column) {
                return NotEligible(UpdatesDistributionKey);
            }
            filter.pinned_value(key_column).cloned()
        }
        PhysicalPlan::SeqScan { filter, .. } | PhysicalPlan::Delete { filter, .. } => {
            filter.pinned_value(key_column).cloned()
        }
        _ => return NotEligible(UnsupportedKind),
    };

    match key_expr {
        None => NotEligible(NoDistributionKeyPredicate),
        Some(ScalarExpr::Literal(value)) => match value.coerce_to(key_type) {
            Ok(key) => FastPathDecision::Static {
                shard: shard_for_key(&key, shard_map),
            },
            Err(_) => NotEligible(UnsupportedKeyExpression),
        },
        Some(ScalarExpr::Param { index }) => FastPathDecision::Keyed {
            param: index,
            key_type,
        },
        Some(ScalarExpr::Column(_)) => NotEligible(UnsupportedKeyExpression),
    }
}
