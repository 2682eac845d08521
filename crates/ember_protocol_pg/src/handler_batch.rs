//! Batch bind-execute ('U'): one statement, many parameter sets.
//!
//! When every set routes to a single shard the sets are grouped per shard
//! and each group travels as one request. Otherwise the sets run one after
//! another on the full path.

use std::collections::BTreeMap;
use std::sync::Arc;

use ember_common::datum::Datum;
use ember_common::error::{EmberResult, ExecutionError, ProtocolError};
use ember_common::types::{FormatCode, ShardId};
use ember_executor::ExecutionResult;
use ember_observability::{
    record_batch_dispatch, record_light_proxy_fallback, record_prepared_stmt_op, record_shard_dispatch,
};

use crate::codec::{BackendMessage, BatchBindMessage, BindMessage};
use crate::handler::Backend;
use crate::param::{encode_row, resolve_result_formats, ParameterSet};
use crate::statement_cache::{CachedPlan, PreparedStatement};

impl Backend {
    pub(crate) fn exec_batch_bind_execute(&mut self, batch: &BatchBindMessage) -> EmberResult<()> {
        self.start_command()?;
        if batch.max_rows != 0 {
            return Err(ProtocolError::BatchRowLimit(batch.max_rows).into());
        }
        let stmt = self.session.statements.get(&batch.statement)?;
        if !stmt.kind.supports_batch() {
            return self.exec_batch_one_by_one(batch);
        }
        if self.session.bracket.is_aborted() {
            return Err(ExecutionError::InFailedTransaction.into());
        }

        let param_sets = batch
            .param_sets
            .iter()
            .map(|values| {
                ParameterSet::new(values, &batch.param_formats).decode(&stmt.param_types, &stmt.name)
            })
            .collect::<EmberResult<Vec<_>>>()?;
        let result_formats = resolve_result_formats(&batch.result_formats, stmt.result_columns.len())?;
        let cached = stmt.revalidate(&self.plan_ctx())?;

        self.send(BackendMessage::BindComplete);
        if let Some((kind, _)) = &batch.describe {
            self.describe_batch(*kind, &stmt, &result_formats)?;
        }

        let result = match self.route_batch(&cached, &param_sets) {
            Some(groups) => match self.dispatch_batch_groups(&cached, groups, &param_sets)? {
                Some(result) => result,
                None => self.run_batch_sequential(&cached, &param_sets)?,
            },
            None => self.run_batch_sequential(&cached, &param_sets)?,
        };

        let count = if stmt.returns_rows() {
            for row in &result.rows {
                self.send(BackendMessage::DataRow {
                    values: encode_row(row, &result_formats),
                });
            }
            result.rows.len() as u64
        } else {
            result.rows_affected
        };
        self.send(BackendMessage::CommandComplete {
            tag: stmt.kind.command_tag(count),
        });
        record_prepared_stmt_op("execute", "batch");
        Ok(())
    }

    fn describe_batch(
        &mut self,
        kind: u8,
        stmt: &PreparedStatement,
        result_formats: &[FormatCode],
    ) -> EmberResult<()> {
        match kind {
            b'S' => {
                self.send(BackendMessage::ParameterDescription {
                    type_oids: stmt.param_oids(),
                });
                let formats = vec![FormatCode::Text; stmt.result_columns.len()];
                self.describe_rows(stmt, &formats);
            }
            b'P' => self.describe_rows(stmt, result_formats),
            other => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "invalid DESCRIBE message subtype {other}"
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Group parameter-set indexes by shard. `None` unless the fast path is
    /// on and every set resolves to exactly one shard.
    fn route_batch(
        &self,
        cached: &CachedPlan,
        param_sets: &[Vec<Datum>],
    ) -> Option<BTreeMap<ShardId, Vec<usize>>> {
        let config = &self.session.config;
        if !(config.enable_light_proxy && config.enable_batch_fast_path) {
            return None;
        }
        if !cached.decision.is_eligible() {
            return None;
        }
        let mut groups: BTreeMap<ShardId, Vec<usize>> = BTreeMap::new();
        for (idx, params) in param_sets.iter().enumerate() {
            let shard = cached.decision.resolve(params, &self.cluster.shard_map)?;
            groups.entry(shard).or_default().push(idx);
        }
        Some(groups)
    }

    /// One request per shard. `Ok(None)` means the first link could not be
    /// used and nothing was sent, so the caller may fall back.
    fn dispatch_batch_groups(
        &mut self,
        cached: &CachedPlan,
        groups: BTreeMap<ShardId, Vec<usize>>,
        param_sets: &[Vec<Datum>],
    ) -> EmberResult<Option<ExecutionResult>> {
        let txn = self.session.bracket.txn_id()?;
        let interrupts = Arc::clone(&self.session.interrupts);
        let mut total = ExecutionResult::default();
        let mut messages = 0;
        for (shard, indexes) in groups {
            let sets: Vec<Vec<Datum>> = indexes.iter().map(|i| param_sets[*i].clone()).collect();
            match self.cluster.executor.dispatch_routed(
                shard,
                cached.planned.plan.clone(),
                sets,
                txn,
                self.session.resources.leases_mut(),
                interrupts.as_ref(),
            ) {
                Ok(part) => {
                    record_shard_dispatch("batch");
                    total.merge(part);
                    messages += 1;
                }
                Err(e) if e.is_pre_send_failure() && messages == 0 => {
                    tracing::debug!(shard = shard.0, error = %e, "batch fast path unavailable");
                    record_light_proxy_fallback("dispatch_unavailable");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
        tracing::debug!(sets = param_sets.len(), messages, "batch dispatched by shard");
        record_batch_dispatch(param_sets.len(), messages);
        Ok(Some(total))
    }

    fn run_batch_sequential(
        &mut self,
        cached: &CachedPlan,
        param_sets: &[Vec<Datum>],
    ) -> EmberResult<ExecutionResult> {
        let mut total = ExecutionResult::default();
        for params in param_sets {
            let planned = self.planner.custom_plan(&cached.planned, params);
            total.merge(self.execute_plan(&planned, params, None)?);
        }
        Ok(total)
    }

    /// Statements the batch path cannot handle run as Bind/Describe/Execute
    /// per parameter set.
    fn exec_batch_one_by_one(&mut self, batch: &BatchBindMessage) -> EmberResult<()> {
        tracing::debug!(statement = %batch.statement, "statement kind not batchable, running sets one by one");
        for (i, values) in batch.param_sets.iter().enumerate() {
            if i > 0 {
                // The previous set's portal is done; the next Bind reuses its name.
                self.session.portals.close(&batch.portal);
            }
            self.exec_bind(&BindMessage {
                portal: batch.portal.clone(),
                statement: batch.statement.clone(),
                param_formats: batch.param_formats.clone(),
                param_values: values.clone(),
                result_formats: batch.result_formats.clone(),
            })?;
            if i == 0 {
                if let Some((kind, name)) = &batch.describe {
                    self.exec_describe(*kind, name)?;
                }
            }
            self.exec_execute(&batch.execute_portal, 0)?;
        }
        Ok(())
    }
}
