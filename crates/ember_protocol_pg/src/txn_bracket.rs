//! Transaction bracket around every command.
//!
//! Each command runs inside a "transaction command" opened by
//! [`TxnBracket::start_xact_command`] and closed by
//! [`TxnBracket::finish_xact_command`]. Outside an explicit block the
//! command gets an implicit transaction which commits when the command
//! closes.

use std::sync::Arc;

use ember_cluster::{TxnHandle, TxnManager};
use ember_common::error::{EmberError, EmberResult, TxnError};
use ember_common::types::TxnId;
use ember_observability::record_txn_metrics;

use crate::interrupts::InterruptState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// No transaction.
    Default,
    /// Implicit transaction for a single command.
    Started,
    /// Inside BEGIN ... COMMIT.
    InProgress,
    /// An error occurred inside a block; only exit statements are accepted.
    Failed,
}

/// Non-error complaint raised by a misplaced transaction statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnWarning {
    AlreadyInProgress,
    NoTransaction,
}

impl TxnWarning {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            TxnWarning::AlreadyInProgress => "25001", // active_sql_transaction
            TxnWarning::NoTransaction => "25P01",     // no_active_sql_transaction
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            TxnWarning::AlreadyInProgress => "there is already a transaction in progress",
            TxnWarning::NoTransaction => "there is no transaction in progress",
        }
    }
}

/// Result of a transaction-control statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnControlOutcome {
    pub tag: &'static str,
    pub warning: Option<TxnWarning>,
    /// The transaction ended; portals belonging to it must go.
    pub ended: bool,
}

impl TxnControlOutcome {
    fn new(tag: &'static str) -> Self {
        Self {
            tag,
            warning: None,
            ended: false,
        }
    }
}

pub struct TxnBracket {
    txn_manager: Arc<TxnManager>,
    state: BlockState,
    txn: Option<TxnHandle>,
    savepoints: Vec<String>,
    xact_started: bool,
}

impl TxnBracket {
    pub fn new(txn_manager: Arc<TxnManager>) -> Self {
        Self {
            txn_manager,
            state: BlockState::Default,
            txn: None,
            savepoints: Vec::new(),
            xact_started: false,
        }
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn is_aborted(&self) -> bool {
        self.state == BlockState::Failed
    }

    pub fn xact_started(&self) -> bool {
        self.xact_started
    }

    /// True while any transaction (implicit or explicit) is open.
    pub fn transaction_open(&self) -> bool {
        self.state != BlockState::Default
    }

    /// ReadyForQuery status byte.
    pub fn status_byte(&self) -> u8 {
        match self.state {
            BlockState::Default | BlockState::Started => b'I',
            BlockState::InProgress => b'T',
            BlockState::Failed => b'E',
        }
    }

    /// Open the transaction command if it is not already open.
    pub fn start_xact_command(&mut self, interrupts: &InterruptState, timeout_ms: u64) {
        if self.xact_started {
            return;
        }
        self.xact_started = true;
        interrupts.arm_timeout(timeout_ms);
        if self.state == BlockState::Default {
            let txn = self.txn_manager.begin();
            tracing::trace!(txn = %txn.id, "implicit transaction started");
            self.txn = Some(txn);
            self.state = BlockState::Started;
        }
    }

    /// Close the transaction command. Commits an implicit transaction.
    /// Returns true when a transaction ended.
    pub fn finish_xact_command(&mut self, interrupts: &InterruptState) -> EmberResult<bool> {
        if !self.xact_started {
            return Ok(false);
        }
        self.xact_started = false;
        interrupts.disarm_timeout();
        if self.state != BlockState::Started {
            return Ok(false);
        }
        self.state = BlockState::Default;
        match self.txn.take() {
            Some(txn) => {
                self.commit_handle(&txn)?;
                Ok(true)
            }
            None => Ok(true),
        }
    }

    /// Id of the open transaction.
    pub fn txn_id(&self) -> EmberResult<TxnId> {
        self.txn
            .as_ref()
            .map(|t| t.id)
            .ok_or_else(|| EmberError::Internal("no transaction is open".into()))
    }

    pub fn begin(&mut self) -> TxnControlOutcome {
        let mut outcome = TxnControlOutcome::new("BEGIN");
        match self.state {
            BlockState::Started => {
                self.state = BlockState::InProgress;
                record_txn_metrics("begin");
            }
            BlockState::Default => {
                self.txn = Some(self.txn_manager.begin());
                self.state = BlockState::InProgress;
                record_txn_metrics("begin");
            }
            BlockState::InProgress | BlockState::Failed => {
                outcome.warning = Some(TxnWarning::AlreadyInProgress);
            }
        }
        outcome
    }

    pub fn commit(&mut self) -> EmberResult<TxnControlOutcome> {
        match self.state {
            BlockState::InProgress => {
                let mut outcome = TxnControlOutcome::new("COMMIT");
                outcome.ended = true;
                self.reset_block();
                if let Some(txn) = self.txn.take() {
                    self.commit_handle(&txn)?;
                }
                Ok(outcome)
            }
            BlockState::Failed => {
                let mut outcome = TxnControlOutcome::new("ROLLBACK");
                outcome.ended = true;
                self.reset_block();
                self.abort_handle();
                Ok(outcome)
            }
            BlockState::Default | BlockState::Started => {
                let mut outcome = TxnControlOutcome::new("COMMIT");
                outcome.warning = Some(TxnWarning::NoTransaction);
                Ok(outcome)
            }
        }
    }

    pub fn rollback(&mut self) -> TxnControlOutcome {
        let mut outcome = TxnControlOutcome::new("ROLLBACK");
        match self.state {
            BlockState::InProgress | BlockState::Failed => {
                outcome.ended = true;
                self.reset_block();
                self.abort_handle();
            }
            BlockState::Default | BlockState::Started => {
                outcome.warning = Some(TxnWarning::NoTransaction);
            }
        }
        outcome
    }

    pub fn savepoint(&mut self, name: &str) -> EmberResult<TxnControlOutcome> {
        if self.state != BlockState::InProgress {
            return Err(TxnError::NoTransactionBlock("SAVEPOINT").into());
        }
        let txn = self.handle()?;
        self.txn_manager.savepoint(txn, name)?;
        self.savepoints.push(name.to_string());
        Ok(TxnControlOutcome::new("SAVEPOINT"))
    }

    pub fn release(&mut self, name: &str) -> EmberResult<TxnControlOutcome> {
        if self.state != BlockState::InProgress {
            return Err(TxnError::NoTransactionBlock("RELEASE SAVEPOINT").into());
        }
        let pos = self.find_savepoint(name)?;
        let txn = self.handle()?;
        self.txn_manager.release(txn, name)?;
        self.savepoints.truncate(pos);
        Ok(TxnControlOutcome::new("RELEASE"))
    }

    /// Undo work back to `name` and leave the failed state.
    pub fn rollback_to(&mut self, name: &str) -> EmberResult<TxnControlOutcome> {
        if !matches!(self.state, BlockState::InProgress | BlockState::Failed) {
            return Err(TxnError::NoTransactionBlock("ROLLBACK TO SAVEPOINT").into());
        }
        let pos = self.find_savepoint(name)?;
        let txn = self.handle()?;
        self.txn_manager.rollback_to(txn, name)?;
        self.savepoints.truncate(pos + 1);
        self.state = BlockState::InProgress;
        Ok(TxnControlOutcome::new("ROLLBACK"))
    }

    /// Abort after an error. Inside a block the block becomes `Failed`; the
    /// shard transaction survives only if a savepoint can still bring it
    /// back. Returns true when the transaction ended.
    pub fn abort_current(&mut self, interrupts: &InterruptState) -> bool {
        self.xact_started = false;
        interrupts.disarm_timeout();
        match self.state {
            BlockState::Default => false,
            BlockState::Started => {
                self.state = BlockState::Default;
                self.abort_handle();
                true
            }
            BlockState::InProgress | BlockState::Failed => {
                self.state = BlockState::Failed;
                if self.savepoints.is_empty() {
                    let had_txn = self.txn.is_some();
                    self.abort_handle();
                    had_txn
                } else {
                    false
                }
            }
        }
    }

    /// Roll back whatever is open; used at session end.
    pub fn teardown(&mut self) {
        if self.txn.is_some() {
            tracing::debug!("rolling back open transaction at session end");
        }
        self.reset_block();
        self.state = BlockState::Default;
        self.xact_started = false;
        self.abort_handle();
    }

    fn handle(&self) -> EmberResult<&TxnHandle> {
        self.txn
            .as_ref()
            .ok_or_else(|| EmberError::Internal("no transaction is open".into()))
    }

    fn find_savepoint(&self, name: &str) -> EmberResult<usize> {
        self.savepoints
            .iter()
            .rposition(|s| s.eq_ignore_ascii_case(name))
            .ok_or_else(|| TxnError::SavepointNotFound(name.to_string()).into())
    }

    fn reset_block(&mut self) {
        self.state = BlockState::Default;
        self.savepoints.clear();
    }

    fn commit_handle(&self, txn: &TxnHandle) -> EmberResult<()> {
        match self.txn_manager.commit(txn) {
            Ok(()) => {
                record_txn_metrics("commit");
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self.txn_manager.abort(txn) {
                    tracing::error!(txn = %txn.id, error = %abort_err, "abort after failed commit");
                }
                record_txn_metrics("abort");
                Err(e)
            }
        }
    }

    fn abort_handle(&mut self) {
        if let Some(txn) = self.txn.take() {
            if let Err(e) = self.txn_manager.abort(&txn) {
                tracing::error!(txn = %txn.id, error = %e, "transaction abort failed");
            }
            record_txn_metrics("abort");
        }
    }
}

impl Drop for TxnBracket {
    fn drop(&mut self) {
        if self.txn.is_some() {
            tracing::debug!("rolling back transaction left open by a dropped session");
            self.abort_handle();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_cluster::LocalCluster;

    fn setup_bracket() -> (TxnBracket, Arc<InterruptState>) {
        let cluster = LocalCluster::with_shards(2);
        (
            TxnBracket::new(cluster.txn_manager.clone()),
            InterruptState::new(),
        )
    }

    #[test]
    fn test_implicit_transaction_commits_at_finish() {
        let (mut b, irq) = setup_bracket();
        b.start_xact_command(&irq, 0);
        assert_eq!(b.state(), BlockState::Started);
        assert_eq!(b.status_byte(), b'I');
        assert!(b.txn_id().is_ok());
        assert!(b.finish_xact_command(&irq).unwrap());
        assert_eq!(b.state(), BlockState::Default);
        assert!(b.txn_id().is_err());
        assert!(!b.finish_xact_command(&irq).unwrap());
    }

    #[test]
    fn test_block_survives_finish() {
        let (mut b, irq) = setup_bracket();
        b.start_xact_command(&irq, 0);
        assert!(b.begin().warning.is_none());
        assert!(!b.finish_xact_command(&irq).unwrap());
        assert_eq!(b.status_byte(), b'T');
        assert_eq!(b.begin().warning, Some(TxnWarning::AlreadyInProgress));
        let out = b.commit().unwrap();
        assert_eq!(out.tag, "COMMIT");
        assert!(out.ended);
        assert_eq!(b.status_byte(), b'I');
    }

    #[test]
    fn test_commit_of_failed_block_reports_rollback() {
        let (mut b, irq) = setup_bracket();
        b.start_xact_command(&irq, 0);
        b.begin();
        assert!(b.abort_current(&irq), "no savepoint: shard txn is gone");
        assert_eq!(b.status_byte(), b'E');
        let out = b.commit().unwrap();
        assert_eq!(out.tag, "ROLLBACK");
        assert_eq!(b.state(), BlockState::Default);
    }

    #[test]
    fn test_rollback_to_leaves_failed_state() {
        let (mut b, irq) = setup_bracket();
        b.start_xact_command(&irq, 0);
        b.begin();
        b.savepoint("a").unwrap();
        assert!(!b.abort_current(&irq));
        assert!(b.is_aborted());
        b.rollback_to("a").unwrap();
        assert_eq!(b.state(), BlockState::InProgress);
        assert_eq!(
            b.rollback_to("missing").unwrap_err().pg_sqlstate(),
            "3B001"
        );
        b.release("a").unwrap();
        assert_eq!(b.release("a").unwrap_err().pg_sqlstate(), "3B001");
    }

    #[test]
    fn test_savepoint_requires_block() {
        let (mut b, irq) = setup_bracket();
        b.start_xact_command(&irq, 0);
        assert_eq!(b.savepoint("x").unwrap_err().pg_sqlstate(), "25P01");
        assert_eq!(b.rollback().warning, Some(TxnWarning::NoTransaction));
    }

    #[test]
    fn test_timeout_armed_for_command_only() {
        let (mut b, irq) = setup_bracket();
        b.start_xact_command(&irq, 10_000);
        assert!(irq.timeout_armed());
        b.finish_xact_command(&irq).unwrap();
        assert!(!irq.timeout_armed());
        b.start_xact_command(&irq, 10_000);
        b.abort_current(&irq);
        assert!(!irq.timeout_armed());
    }
}
