//! Extended-query messages: Parse, Bind, Describe, Execute, Close.

use std::sync::Arc;
use std::time::Instant;

use ember_common::datum::Datum;
use ember_common::error::{EmberResult, ExecutionError, ProtocolError, SqlError};
use ember_common::types::FormatCode;
use ember_observability::{
    record_light_proxy_fallback, record_prepared_stmt_active, record_prepared_stmt_execute_duration_us,
    record_prepared_stmt_op, record_prepared_stmt_param_count, record_prepared_stmt_parse_duration_us,
    record_prepared_stmt_portals_active, record_shard_dispatch,
};
use ember_sql_frontend::types::StatementKind;
use ember_sql_frontend::{classify, parse_sql};

use crate::codec::{BackendMessage, BindMessage};
use crate::handler::{row_description, Backend};
use crate::param::{encode_row, resolve_result_formats, ParameterSet};
use crate::portal::{LightBinding, Portal, PortalEntry, RowCursor};
use crate::statement_cache::{CachedPlan, PreparedStatement};

impl Backend {
    pub(crate) fn exec_parse(&mut self, name: &str, query: &str, param_oids: &[i32]) -> EmberResult<()> {
        let started = Instant::now();
        let result = self.parse_statement(name, query, param_oids);
        record_prepared_stmt_parse_duration_us(started.elapsed().as_micros() as u64, result.is_ok());
        result
    }

    fn parse_statement(&mut self, name: &str, query: &str, param_oids: &[i32]) -> EmberResult<()> {
        tracing::debug!(session_id = self.session.id.0, statement = %name, query, "parse");
        self.start_command()?;

        let mut stmts = parse_sql(query)?;
        if stmts.len() > 1 {
            return Err(SqlError::MultipleStatements.into());
        }
        let raw = stmts.pop();

        if !name.is_empty() && self.session.statements.contains(name) {
            if raw.is_none() {
                self.send(BackendMessage::ParseComplete);
                return Ok(());
            }
            return Err(ExecutionError::DuplicateStatement(name.to_string()).into());
        }

        if self.session.bracket.is_aborted() {
            let exit = raw.as_ref().map(classify).is_some_and(|k| k.is_transaction_exit());
            if !exit {
                return Err(ExecutionError::InFailedTransaction.into());
            }
        }

        let prepared = PreparedStatement::prepare(name, query, raw, param_oids, &self.plan_ctx())?;
        self.session.statements.insert(prepared)?;
        self.send(BackendMessage::ParseComplete);
        record_prepared_stmt_op("parse", "plan");
        record_prepared_stmt_active(self.session.statements.len());
        Ok(())
    }

    pub(crate) fn exec_bind(&mut self, bind: &BindMessage) -> EmberResult<()> {
        self.start_command()?;
        let stmt = self.session.statements.get(&bind.statement)?;
        if self.session.bracket.is_aborted()
            && !(stmt.kind.is_transaction_exit() && bind.param_values.is_empty())
        {
            return Err(ExecutionError::InFailedTransaction.into());
        }
        self.session.portals.prepare_slot(&bind.portal)?;

        let params = ParameterSet::new(&bind.param_values, &bind.param_formats)
            .decode(&stmt.param_types, &stmt.name)?;
        record_prepared_stmt_param_count(params.len());
        let result_formats = resolve_result_formats(&bind.result_formats, stmt.result_columns.len())?;
        let cached = stmt.revalidate(&self.plan_ctx())?;

        let path = self.bind_portal(bind.portal.clone(), stmt, cached, params, result_formats);
        self.send(BackendMessage::BindComplete);
        record_prepared_stmt_op("bind", path);
        record_prepared_stmt_portals_active(self.session.portals.len());
        Ok(())
    }

    /// Store the bound portal, as a light binding when the parameters pin a
    /// single shard. Returns the path label.
    fn bind_portal(
        &mut self,
        name: String,
        statement: Arc<PreparedStatement>,
        cached: CachedPlan,
        params: Vec<Datum>,
        result_formats: Vec<FormatCode>,
    ) -> &'static str {
        match cached.decision.resolve(&params, &self.cluster.shard_map) {
            Some(shard) => {
                tracing::trace!(portal = %name, shard = shard.0, "bound to single shard");
                self.session.portals.insert_light(LightBinding {
                    name,
                    statement,
                    planned: cached.planned,
                    shard,
                    params,
                    result_formats,
                });
                return "light_proxy";
            }
            None if cached.decision.is_eligible() => {
                tracing::debug!(portal = %name, "bound key does not pin a shard");
                record_light_proxy_fallback("indeterminate_key");
            }
            None => {}
        }
        let planned = Arc::new(self.planner.custom_plan(&cached.planned, &params));
        self.session.portals.insert(Portal {
            name,
            statement,
            planned,
            params,
            result_formats,
            cursor: RowCursor::NotStarted,
        });
        "plan"
    }

    pub(crate) fn exec_describe(&mut self, kind: u8, name: &str) -> EmberResult<()> {
        self.start_command()?;
        match kind {
            b'S' => {
                let stmt = self.session.statements.get(name)?;
                self.check_describable(&stmt)?;
                self.send(BackendMessage::ParameterDescription {
                    type_oids: stmt.param_oids(),
                });
                let formats = vec![FormatCode::Text; stmt.result_columns.len()];
                self.describe_rows(&stmt, &formats);
            }
            b'P' => {
                let (stmt, formats) = self.session.portals.describe(name)?;
                self.check_describable(&stmt)?;
                self.describe_rows(&stmt, &formats);
            }
            other => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "invalid DESCRIBE message subtype {other}"
                ))
                .into());
            }
        }
        record_prepared_stmt_op("describe", "plan");
        Ok(())
    }

    /// A failed transaction cannot describe anything that returns rows.
    fn check_describable(&self, stmt: &PreparedStatement) -> EmberResult<()> {
        if self.session.bracket.is_aborted() && stmt.returns_rows() {
            return Err(ExecutionError::InFailedTransaction.into());
        }
        Ok(())
    }

    pub(crate) fn describe_rows(&mut self, stmt: &PreparedStatement, formats: &[FormatCode]) {
        if stmt.returns_rows() {
            self.send(row_description(&stmt.result_columns, formats));
        } else {
            self.send(BackendMessage::NoData);
        }
    }

    pub(crate) fn exec_execute(&mut self, portal: &str, max_rows: i32) -> EmberResult<()> {
        let started = Instant::now();
        let result = self
            .start_command()
            .and_then(|()| self.execute_portal(portal, max_rows));
        record_prepared_stmt_execute_duration_us(started.elapsed().as_micros() as u64, result.is_ok());
        result
    }

    fn execute_portal(&mut self, name: &str, max_rows: i32) -> EmberResult<()> {
        let mut portal = match self.session.portals.take(name)? {
            PortalEntry::Conventional(portal) => portal,
            PortalEntry::Light(binding) => {
                if self.session.bracket.is_aborted() && !binding.statement.kind.is_transaction_exit() {
                    self.session.portals.insert_light(binding);
                    return Err(ExecutionError::InFailedTransaction.into());
                }
                self.start_light_binding(binding)?
            }
        };

        if portal.statement.is_empty_query() {
            self.send(BackendMessage::EmptyQueryResponse);
            self.session.portals.insert(portal);
            return Ok(());
        }
        if self.session.bracket.is_aborted() && !portal.statement.kind.is_transaction_exit() {
            self.session.portals.insert(portal);
            return Err(ExecutionError::InFailedTransaction.into());
        }

        match self.drive_portal(&mut portal, max_rows) {
            Ok(txn_ended) => {
                if !txn_ended {
                    self.session.portals.insert(portal);
                }
                Ok(())
            }
            Err(e) => {
                portal.cursor = RowCursor::Failed;
                self.session.portals.insert(portal);
                Err(e)
            }
        }
    }

    /// First Execute of a light binding: send it to its shard. When the
    /// shard cannot be reached, or DDL has moved the catalog on since Bind,
    /// the binding becomes a conventional portal that has not run yet.
    fn start_light_binding(&mut self, binding: LightBinding) -> EmberResult<Portal> {
        if binding.planned.catalog_generation != self.cluster.catalog.generation() {
            tracing::debug!(portal = %binding.name, "catalog changed since bind, replanning");
            record_light_proxy_fallback("metadata_drift");
            let cached = match binding.statement.revalidate(&self.plan_ctx()) {
                Ok(cached) => cached,
                Err(e) => {
                    let mut portal = binding.into_portal();
                    portal.cursor = RowCursor::Failed;
                    self.session.portals.insert(portal);
                    return Err(e);
                }
            };
            let planned = Arc::new(self.planner.custom_plan(&cached.planned, &binding.params));
            let mut portal = binding.into_portal();
            portal.planned = planned;
            return Ok(portal);
        }

        let txn = self.session.bracket.txn_id()?;
        let interrupts = Arc::clone(&self.session.interrupts);
        match self.cluster.executor.dispatch_routed(
            binding.shard,
            binding.planned.plan.clone(),
            vec![binding.params.clone()],
            txn,
            self.session.resources.leases_mut(),
            interrupts.as_ref(),
        ) {
            Ok(result) => {
                record_shard_dispatch("light_proxy");
                record_prepared_stmt_op("execute", "light_proxy");
                let mut portal = binding.into_portal();
                portal.cursor = RowCursor::Running {
                    rows: result.rows.into(),
                    rows_affected: result.rows_affected,
                };
                Ok(portal)
            }
            Err(e) if e.is_pre_send_failure() => {
                tracing::debug!(
                    portal = %binding.name,
                    shard = binding.shard.0,
                    error = %e,
                    "fast path unavailable, using full path"
                );
                record_light_proxy_fallback("dispatch_unavailable");
                Ok(binding.into_portal())
            }
            Err(e) => {
                let mut portal = binding.into_portal();
                portal.cursor = RowCursor::Failed;
                self.session.portals.insert(portal);
                Err(e)
            }
        }
    }

    /// Run or continue a portal, emitting at most `max_rows` rows. Returns
    /// true when the statement ended the transaction.
    fn drive_portal(&mut self, portal: &mut Portal, max_rows: i32) -> EmberResult<bool> {
        let kind = portal.statement.kind.clone();
        match &kind {
            StatementKind::Transaction(ctl) => {
                let (tag, ended) = self.run_transaction_control(ctl)?;
                portal.cursor = RowCursor::Exhausted;
                self.send(BackendMessage::CommandComplete { tag });
                let committed = self.finish_command()?;
                return Ok(ended || committed);
            }
            StatementKind::CreateTable | StatementKind::DropTable => {
                if !portal.is_started() {
                    self.cluster.executor.execute_ddl(&portal.planned.plan)?;
                    portal.cursor = RowCursor::Exhausted;
                }
                self.send(BackendMessage::CommandComplete {
                    tag: kind.command_tag(0),
                });
                return Ok(false);
            }
            _ => {}
        }

        if !portal.is_started() {
            let planned = portal.planned.clone();
            let result = self.execute_plan(&planned, &portal.params, None)?;
            record_prepared_stmt_op("execute", "plan");
            portal.cursor = RowCursor::Running {
                rows: result.rows.into(),
                rows_affected: result.rows_affected,
            };
        }

        let fetch = portal.fetch(max_rows)?;
        for row in &fetch.rows {
            self.send(BackendMessage::DataRow {
                values: encode_row(row, &portal.result_formats),
            });
        }
        if fetch.completed {
            let count = if portal.planned.returns_rows() {
                fetch.rows.len() as u64
            } else {
                fetch.rows_affected
            };
            self.send(BackendMessage::CommandComplete {
                tag: kind.command_tag(count),
            });
        } else {
            self.send(BackendMessage::PortalSuspended);
        }
        Ok(false)
    }

    pub(crate) fn exec_close(&mut self, kind: u8, name: &str) -> EmberResult<()> {
        self.start_command()?;
        match kind {
            b'S' => {
                self.session.statements.close(name)?;
                record_prepared_stmt_active(self.session.statements.len());
            }
            b'P' => {
                self.session.portals.close(name);
                record_prepared_stmt_portals_active(self.session.portals.len());
            }
            other => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "invalid CLOSE message subtype {other}"
                ))
                .into());
            }
        }
        self.send(BackendMessage::CloseComplete);
        Ok(())
    }
}
