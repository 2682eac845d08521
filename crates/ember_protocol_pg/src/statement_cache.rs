//! Prepared statements of one session.

use std::collections::HashMap;
use std::sync::Arc;

use ember_cluster::ShardMap;
use ember_common::catalog::Catalog;
use ember_common::error::{EmberResult, ExecutionError, SqlError};
use ember_common::types::DataType;
use ember_planner::{PlannedStatement, Planner};
use ember_sql_frontend::types::{AnalyzedStatement, ResultColumn, StatementKind};
use ember_sql_frontend::{analyze, classify, ParamEnv};
use parking_lot::Mutex;
use sqlparser::ast::Statement;

use crate::light_proxy::{self, FastPathDecision};

/// Plan and routing decision, replaced together when the catalog moves on.
#[derive(Debug, Clone)]
pub struct CachedPlan {
    pub planned: Arc<PlannedStatement>,
    pub decision: FastPathDecision,
}

impl CachedPlan {
    pub fn generation(&self) -> u64 {
        self.planned.catalog_generation
    }
}

/// What the planner needs to (re)build a cached plan.
pub struct PlanContext<'a> {
    pub catalog: &'a Catalog,
    pub planner: &'a Planner,
    pub shard_map: &'a ShardMap,
    pub light_proxy: bool,
}

#[derive(Debug)]
pub struct PreparedStatement {
    pub name: String,
    pub source: String,
    /// `None` for an empty query string.
    pub raw: Option<Statement>,
    pub kind: StatementKind,
    pub param_types: Vec<DataType>,
    pub result_columns: Vec<ResultColumn>,
    plan: Mutex<CachedPlan>,
}

impl PreparedStatement {
    /// Analyze and plan `raw`. `declared_oids` come from the Parse message.
    pub fn prepare(
        name: &str,
        source: &str,
        raw: Option<Statement>,
        declared_oids: &[i32],
        ctx: &PlanContext<'_>,
    ) -> EmberResult<Self> {
        let analyzed = match &raw {
            Some(stmt) => analyze(ctx.catalog, stmt, declared_oids)?,
            None => AnalyzedStatement::empty(
                ParamEnv::from_declared_oids(declared_oids)?.finalize(),
                ctx.catalog.generation(),
            ),
        };
        let cached = build_plan(&analyzed, ctx)?;
        if let FastPathDecision::NotEligible(reason) = &cached.decision {
            tracing::debug!(statement = %name, reason = reason.as_str(), "fast path not eligible");
            ember_observability::record_light_proxy_fallback(reason.as_str());
        }
        Ok(Self {
            name: name.to_string(),
            source: source.to_string(),
            kind: raw.as_ref().map(classify).unwrap_or(StatementKind::Empty),
            raw,
            param_types: analyzed.param_types,
            result_columns: analyzed.result_columns,
            plan: Mutex::new(cached),
        })
    }

    pub fn is_empty_query(&self) -> bool {
        self.raw.is_none()
    }

    pub fn returns_rows(&self) -> bool {
        !self.result_columns.is_empty()
    }

    pub fn param_oids(&self) -> Vec<i32> {
        self.param_types.iter().map(|t| t.pg_oid()).collect()
    }

    /// Current plan without revalidation.
    pub fn cached_plan(&self) -> CachedPlan {
        self.plan.lock().clone()
    }

    /// Return a plan valid for the current catalog, re-analyzing if DDL has
    /// happened since the plan was built. Parameter types stay fixed; the
    /// result shape may not change.
    pub fn revalidate(&self, ctx: &PlanContext<'_>) -> EmberResult<CachedPlan> {
        let mut plan = self.plan.lock();
        let current = ctx.catalog.generation();
        let Some(raw) = &self.raw else {
            return Ok(plan.clone());
        };
        if plan.generation() == current {
            return Ok(plan.clone());
        }
        tracing::debug!(
            statement = %self.name,
            from = plan.generation(),
            to = current,
            "replanning prepared statement"
        );
        let analyzed = analyze(ctx.catalog, raw, &self.param_oids())?;
        if analyzed.result_columns != self.result_columns {
            return Err(SqlError::ResultTypeChanged.into());
        }
        *plan = build_plan(&analyzed, ctx)?;
        Ok(plan.clone())
    }
}

fn build_plan(analyzed: &AnalyzedStatement, ctx: &PlanContext<'_>) -> EmberResult<CachedPlan> {
    let planned = ctx.planner.plan(analyzed)?;
    let decision = light_proxy::decide(&planned, 1, ctx.light_proxy, ctx.shard_map);
    Ok(CachedPlan {
        planned: Arc::new(planned),
        decision,
    })
}

/// Named statements plus the single unnamed one.
#[derive(Debug, Default)]
pub struct StatementCache {
    named: HashMap<String, Arc<PreparedStatement>>,
    unnamed: Option<Arc<PreparedStatement>>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> EmberResult<Arc<PreparedStatement>> {
        let found = if name.is_empty() {
            self.unnamed.clone()
        } else {
            self.named.get(name).cloned()
        };
        found.ok_or_else(|| ExecutionError::UndefinedStatement(name.to_string()).into())
    }

    pub fn contains(&self, name: &str) -> bool {
        if name.is_empty() {
            self.unnamed.is_some()
        } else {
            self.named.contains_key(name)
        }
    }

    /// Store a fully built statement. The unnamed slot is replaced; a named
    /// statement may not shadow an existing one.
    pub fn insert(&mut self, stmt: PreparedStatement) -> EmberResult<Arc<PreparedStatement>> {
        let stmt = Arc::new(stmt);
        if stmt.name.is_empty() {
            self.unnamed = Some(stmt.clone());
        } else {
            if self.named.contains_key(&stmt.name) {
                return Err(ExecutionError::DuplicateStatement(stmt.name.clone()).into());
            }
            self.named.insert(stmt.name.clone(), stmt.clone());
        }
        Ok(stmt)
    }

    /// Close a statement. Portals already bound to it keep it alive.
    pub fn close(&mut self, name: &str) -> EmberResult<()> {
        if name.is_empty() {
            self.drop_unnamed();
            return Ok(());
        }
        self.named
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ExecutionError::UndefinedStatement(name.to_string()).into())
    }

    pub fn drop_unnamed(&mut self) {
        self.unnamed = None;
    }

    /// Named statements only.
    pub fn len(&self) -> usize {
        self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.named.is_empty() && self.unnamed.is_none()
    }

    pub fn clear(&mut self) {
        self.named.clear();
        self.unnamed = None;
    }
}
