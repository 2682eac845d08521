//! Message dispatch for one session.
//!
//! [`Backend`] owns a [`Session`] plus the outbound message queue. The
//! server feeds it decoded frontend messages one at a time and writes out
//! whatever accumulated once a read batch has been handled.

use std::sync::Arc;

use ember_cluster::LocalCluster;
use ember_common::datum::Datum;
use ember_common::error::{EmberError, EmberResult, ExecutionError, ProtocolError};
use ember_common::interrupt::InterruptCheck;
use ember_common::types::{FormatCode, ShardId};
use ember_executor::ExecutionResult;
use ember_observability::{record_error, record_light_proxy_fallback, record_shard_dispatch};
use ember_planner::{PlannedStatement, Planner};
use ember_sql_frontend::types::{ResultColumn, StatementKind, TxnControl};
use ember_sql_frontend::{analyze, classify, parse_sql};
use sqlparser::ast::Statement;

use crate::codec::{BackendMessage, FieldDescription, FrontendMessage};
use crate::light_proxy::{self, FastPathDecision};
use crate::param::encode_row;
use crate::session::Session;
use crate::statement_cache::PlanContext;

/// What the connection loop should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Terminate,
}

pub struct Backend {
    pub(crate) cluster: Arc<LocalCluster>,
    pub(crate) planner: Planner,
    pub session: Session,
    pub(crate) out: Vec<BackendMessage>,
}

impl Backend {
    pub fn new(cluster: Arc<LocalCluster>, session: Session) -> Self {
        Self {
            cluster,
            planner: Planner::new(),
            session,
            out: Vec::new(),
        }
    }

    /// Messages produced since the last call.
    pub fn take_output(&mut self) -> Vec<BackendMessage> {
        std::mem::take(&mut self.out)
    }

    /// Queue ReadyForQuery with the current transaction status.
    pub fn ready_for_query(&mut self) {
        let txn_status = self.session.txn_status_byte();
        self.send(BackendMessage::ReadyForQuery { txn_status });
    }

    /// Run a sequence of messages and return everything they produced.
    pub fn run_messages(
        &mut self,
        msgs: impl IntoIterator<Item = FrontendMessage>,
    ) -> Vec<BackendMessage> {
        for msg in msgs {
            if self.handle_message(msg) == Flow::Terminate {
                break;
            }
        }
        self.take_output()
    }

    /// Process one frontend message.
    pub fn handle_message(&mut self, msg: FrontendMessage) -> Flow {
        let tag = msg.tag();
        let protocol = &mut self.session.protocol;
        self.session.interrupts.on_message_read(protocol.skip_till_sync);
        match tag {
            b'Q' | b'X' => protocol.doing_extended_query = false,
            b'S' => {
                protocol.doing_extended_query = false;
                protocol.skip_till_sync = false;
            }
            _ => protocol.doing_extended_query = true,
        }
        if protocol.skip_till_sync && tag != b'X' {
            tracing::trace!(
                session_id = self.session.id.0,
                tag = %char::from(tag),
                "discarding message until Sync"
            );
            return Flow::Continue;
        }

        let flow = match self.dispatch(msg) {
            Ok(flow) => flow,
            Err(e) => self.recover(e),
        };
        if flow == Flow::Continue && self.session.protocol.send_ready_for_query {
            self.session.protocol.send_ready_for_query = false;
            self.ready_for_query();
        }
        flow
    }

    fn dispatch(&mut self, msg: FrontendMessage) -> EmberResult<Flow> {
        match msg {
            FrontendMessage::Query(sql) => self.exec_simple_query(&sql)?,
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            } => self.exec_parse(&name, &query, &param_types)?,
            FrontendMessage::Bind(bind) => self.exec_bind(&bind)?,
            FrontendMessage::Describe { kind, name } => self.exec_describe(kind, &name)?,
            FrontendMessage::Execute { portal, max_rows } => self.exec_execute(&portal, max_rows)?,
            FrontendMessage::Close { kind, name } => self.exec_close(kind, &name)?,
            FrontendMessage::Flush => {}
            FrontendMessage::Sync => self.exec_sync()?,
            FrontendMessage::BatchBindExecute(batch) => self.exec_batch_bind_execute(&batch)?,
            FrontendMessage::Terminate => {
                tracing::debug!(session_id = self.session.id.0, "client terminated session");
                self.terminate();
                return Ok(Flow::Terminate);
            }
            FrontendMessage::Invalid { tag, reason } => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "invalid {} message: {reason}",
                    char::from(tag)
                ))
                .into());
            }
            FrontendMessage::Startup { .. }
            | FrontendMessage::SslRequest
            | FrontendMessage::CancelRequest { .. } => {
                return Err(ProtocolError::InvalidMessage(
                    "startup packet received after startup".into(),
                )
                .into());
            }
        }
        Ok(Flow::Continue)
    }

    /// Report a connection-fatal error and drop all session state.
    pub fn fatal(&mut self, err: EmberError) {
        let sqlstate = err.pg_sqlstate();
        tracing::error!(
            session_id = self.session.id.0,
            sqlstate,
            error = %err,
            "terminating connection"
        );
        record_error(sqlstate);
        self.send(BackendMessage::ErrorResponse {
            severity: "FATAL".into(),
            code: sqlstate.into(),
            message: err.pg_message(),
        });
        self.terminate();
    }

    /// Connection is going away: roll back and release everything.
    pub fn terminate(&mut self) {
        self.session.teardown();
    }

    pub(crate) fn send(&mut self, msg: BackendMessage) {
        self.out.push(msg);
    }

    pub(crate) fn plan_ctx(&self) -> PlanContext<'_> {
        PlanContext {
            catalog: &self.cluster.catalog,
            planner: &self.planner,
            shard_map: &self.cluster.shard_map,
            light_proxy: self.session.config.enable_light_proxy,
        }
    }

    /// Open the transaction command, take an admission slot and deliver any
    /// pending interrupt.
    pub(crate) fn start_command(&mut self) -> EmberResult<()> {
        let session = &mut self.session;
        session
            .bracket
            .start_xact_command(&session.interrupts, session.config.statement_timeout_ms);
        session.resources.reserve(&self.cluster.admission)?;
        session.interrupts.check_for_interrupts()
    }

    /// Close the transaction command and return its resources. True when a
    /// transaction ended, in which case its portals are gone too.
    pub(crate) fn finish_command(&mut self) -> EmberResult<bool> {
        let session = &mut self.session;
        let result = session.bracket.finish_xact_command(&session.interrupts);
        session.resources.release_all();
        if matches!(result, Ok(true)) {
            session.portals.clear();
        }
        result
    }

    pub(crate) fn exec_sync(&mut self) -> EmberResult<()> {
        self.finish_command()?;
        self.session.protocol.send_ready_for_query = true;
        Ok(())
    }

    fn exec_simple_query(&mut self, sql: &str) -> EmberResult<()> {
        tracing::debug!(session_id = self.session.id.0, sql, "simple query");
        self.session.statements.drop_unnamed();
        self.start_command()?;

        let stmts = parse_sql(sql)?;
        if stmts.is_empty() {
            self.send(BackendMessage::EmptyQueryResponse);
            self.finish_command()?;
            self.session.protocol.send_ready_for_query = true;
            return Ok(());
        }

        let count = stmts.len();
        for (i, stmt) in stmts.iter().enumerate() {
            let kind = classify(stmt);
            if self.session.bracket.is_aborted() && !kind.is_transaction_exit() {
                return Err(ExecutionError::InFailedTransaction.into());
            }
            self.start_command()?;
            let tag = self.run_simple_statement(stmt, &kind, count)?;
            self.send(BackendMessage::CommandComplete { tag });
            if i + 1 == count || kind.is_transaction_control() {
                self.finish_command()?;
            }
        }
        self.session.protocol.send_ready_for_query = true;
        Ok(())
    }

    fn run_simple_statement(
        &mut self,
        stmt: &Statement,
        kind: &StatementKind,
        statement_count: usize,
    ) -> EmberResult<String> {
        if let StatementKind::Transaction(ctl) = kind {
            let (tag, _) = self.run_transaction_control(ctl)?;
            return Ok(tag);
        }

        let analyzed = analyze(&self.cluster.catalog, stmt, &[])?;
        let planned = self.planner.plan(&analyzed)?;
        if matches!(kind, StatementKind::CreateTable | StatementKind::DropTable) {
            self.cluster.executor.execute_ddl(&planned.plan)?;
            return Ok(kind.command_tag(0));
        }

        let decision = light_proxy::decide(
            &planned,
            statement_count,
            self.session.config.enable_light_proxy,
            &self.cluster.shard_map,
        );
        if let FastPathDecision::NotEligible(reason) = &decision {
            tracing::trace!(reason = reason.as_str(), "simple query takes the full path");
        }
        let route = decision.resolve(&[], &self.cluster.shard_map);
        let result = self.execute_plan(&planned, &[], route)?;

        if planned.returns_rows() {
            let formats = vec![FormatCode::Text; planned.result_columns.len()];
            self.send(row_description(&planned.result_columns, &formats));
            let rows = result.rows.len() as u64;
            for row in &result.rows {
                self.send(BackendMessage::DataRow {
                    values: encode_row(row, &formats),
                });
            }
            Ok(kind.command_tag(rows))
        } else {
            Ok(kind.command_tag(result.rows_affected))
        }
    }

    /// Run BEGIN/COMMIT/ROLLBACK/SAVEPOINT. Returns the command tag and
    /// whether the transaction ended.
    pub(crate) fn run_transaction_control(
        &mut self,
        ctl: &TxnControl,
    ) -> EmberResult<(String, bool)> {
        let bracket = &mut self.session.bracket;
        let outcome = match ctl {
            TxnControl::Begin => bracket.begin(),
            TxnControl::Commit => bracket.commit()?,
            TxnControl::Rollback => bracket.rollback(),
            TxnControl::Savepoint(name) => bracket.savepoint(name)?,
            TxnControl::Release(name) => bracket.release(name)?,
            TxnControl::RollbackTo(name) => bracket.rollback_to(name)?,
        };
        if let Some(warning) = outcome.warning {
            self.send(BackendMessage::NoticeResponse {
                severity: "WARNING".into(),
                code: warning.sqlstate().into(),
                message: warning.message().into(),
            });
        }
        if outcome.ended {
            self.session.portals.clear();
        }
        Ok((outcome.tag.to_string(), outcome.ended))
    }

    /// Execute a planned statement in the current transaction. With a
    /// `route` the statement is first tried as a single request to that
    /// shard; a link failure before anything was sent drops back to the
    /// full path.
    pub(crate) fn execute_plan(
        &mut self,
        planned: &PlannedStatement,
        params: &[Datum],
        route: Option<ShardId>,
    ) -> EmberResult<ExecutionResult> {
        let txn = self.session.bracket.txn_id()?;
        let interrupts = Arc::clone(&self.session.interrupts);
        if let Some(shard) = route {
            match self.cluster.executor.dispatch_routed(
                shard,
                planned.plan.clone(),
                vec![params.to_vec()],
                txn,
                self.session.resources.leases_mut(),
                interrupts.as_ref(),
            ) {
                Ok(result) => {
                    record_shard_dispatch("light_proxy");
                    return Ok(result);
                }
                Err(e) if e.is_pre_send_failure() => {
                    tracing::debug!(shard = shard.0, error = %e, "fast path unavailable, using full path");
                    record_light_proxy_fallback("dispatch_unavailable");
                }
                Err(e) => return Err(e),
            }
        }
        record_shard_dispatch("plan");
        self.cluster.executor.execute(
            planned,
            params,
            txn,
            self.session.resources.leases_mut(),
            interrupts.as_ref(),
        )
    }
}

pub(crate) fn row_description(columns: &[ResultColumn], formats: &[FormatCode]) -> BackendMessage {
    BackendMessage::RowDescription {
        fields: columns
            .iter()
            .enumerate()
            .map(|(i, col)| FieldDescription {
                name: col.name.clone(),
                table_oid: 0,
                column_attr: 0,
                type_oid: col.data_type.pg_oid(),
                type_len: col.data_type.type_len(),
                type_modifier: -1,
                format_code: formats.get(i).copied().unwrap_or_default().as_i16(),
            })
            .collect(),
    }
}
