//! Coordinator-side transaction manager.
//!
//! A coordinator transaction is an id shared by every shard it touches.
//! Commit, abort and savepoint operations are broadcast to all shards; a
//! shard that never saw the id treats them as no-ops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ember_common::error::{EmberResult, TxnError};
use ember_common::types::TxnId;

use crate::transport::{ShardControl, ShardTransport};

#[derive(Debug, Clone)]
pub struct TxnHandle {
    pub id: TxnId,
    pub started_at: Instant,
}

pub struct TxnManager {
    next_txn_id: AtomicU64,
    transport: Arc<dyn ShardTransport>,
}

impl TxnManager {
    pub fn new(transport: Arc<dyn ShardTransport>) -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
            transport,
        }
    }

    pub fn begin(&self) -> TxnHandle {
        let id = TxnId(self.next_txn_id.fetch_add(1, Ordering::Relaxed));
        tracing::trace!(txn = %id, "txn begin");
        TxnHandle {
            id,
            started_at: Instant::now(),
        }
    }

    pub fn commit(&self, txn: &TxnHandle) -> EmberResult<()> {
        self.broadcast(txn.id, &ShardControl::Commit)
            .map_err(|e| TxnError::CommitFailed(txn.id, e.to_string()))?;
        tracing::debug!(
            txn = %txn.id,
            elapsed_us = txn.started_at.elapsed().as_micros() as u64,
            "txn committed"
        );
        Ok(())
    }

    /// Abort on every shard. All shards are attempted even when one fails;
    /// the first failure is reported.
    pub fn abort(&self, txn: &TxnHandle) -> EmberResult<()> {
        let mut first_err = None;
        for shard in self.transport.shard_ids() {
            if let Err(e) = self.transport.control(shard, txn.id, &ShardControl::Abort) {
                tracing::warn!(txn = %txn.id, %shard, error = %e, "shard abort failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(TxnError::AbortFailed(txn.id, e.to_string()).into()),
            None => {
                tracing::debug!(txn = %txn.id, "txn aborted");
                Ok(())
            }
        }
    }

    pub fn savepoint(&self, txn: &TxnHandle, name: &str) -> EmberResult<()> {
        self.broadcast(txn.id, &ShardControl::Savepoint(name.to_string()))
    }

    pub fn rollback_to(&self, txn: &TxnHandle, name: &str) -> EmberResult<()> {
        self.broadcast(txn.id, &ShardControl::RollbackTo(name.to_string()))
    }

    pub fn release(&self, txn: &TxnHandle, name: &str) -> EmberResult<()> {
        self.broadcast(txn.id, &ShardControl::Release(name.to_string()))
    }

    fn broadcast(&self, txn: TxnId, control: &ShardControl) -> EmberResult<()> {
        for shard in self.transport.shard_ids() {
            self.transport.control(shard, txn, control)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_transport::LocalTransport;
    use crate::shard_map::ShardMap;

    fn setup_manager() -> TxnManager {
        let transport = Arc::new(LocalTransport::new(Arc::new(ShardMap::uniform(3))));
        TxnManager::new(transport)
    }

    #[test]
    fn test_ids_are_unique() {
        let mgr = setup_manager();
        let a = mgr.begin();
        let b = mgr.begin();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_unknown_savepoint_is_reported() {
        let mgr = setup_manager();
        let txn = mgr.begin();
        mgr.savepoint(&txn, "a").unwrap();
        mgr.rollback_to(&txn, "a").unwrap();
        let err = mgr.rollback_to(&txn, "nope").unwrap_err();
        assert_eq!(err.pg_sqlstate(), "3B001");
        mgr.release(&txn, "a").unwrap();
        mgr.commit(&txn).unwrap();
    }

    #[test]
    fn test_abort_of_untouched_txn_is_ok() {
        let mgr = setup_manager();
        let txn = mgr.begin();
        mgr.abort(&txn).unwrap();
    }
}
