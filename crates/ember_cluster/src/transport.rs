use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ember_common::datum::Datum;
use ember_common::error::EmberResult;
use ember_common::interrupt::InterruptCheck;
use ember_common::schema::TableSchema;
use ember_common::types::{ShardId, TableId, TxnId};
use ember_executor::{DispatchMode, ExecutionResult};
use ember_planner::PhysicalPlan;

/// One sub-message to a shard: a plan plus one or more parameter sets.
#[derive(Debug, Clone)]
pub struct ShardRequest {
    pub txn: TxnId,
    pub plan: Arc<PhysicalPlan>,
    pub param_sets: Vec<Vec<Datum>>,
    pub mode: DispatchMode,
}

/// Transaction-level instructions broadcast to shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardControl {
    Commit,
    Abort,
    Savepoint(String),
    RollbackTo(String),
    Release(String),
}

#[derive(Debug, Clone)]
pub enum ShardDdl {
    CreateTable(Arc<TableSchema>),
    DropTable(TableId),
}

/// Lease on a shard link, held for the duration of one command.
///
/// Dropping the lease returns the link.
#[derive(Debug)]
pub struct ShardLink {
    shard: ShardId,
    in_use: Arc<AtomicUsize>,
}

impl ShardLink {
    pub fn new(shard: ShardId, in_use: Arc<AtomicUsize>) -> Self {
        in_use.fetch_add(1, Ordering::AcqRel);
        Self { shard, in_use }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }
}

impl Drop for ShardLink {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Coordinator-to-shard messaging.
///
/// `dispatch` reports transport failures as `ClusterError::LinkFailed`, with
/// `sent` telling whether the shard may have seen the request. Errors raised
/// by the shard while executing are passed through unchanged.
pub trait ShardTransport: Send + Sync {
    fn shard_ids(&self) -> Vec<ShardId>;

    fn acquire_link(&self, shard: ShardId) -> EmberResult<ShardLink>;

    fn dispatch(
        &self,
        link: &ShardLink,
        request: &ShardRequest,
        interrupts: &dyn InterruptCheck,
    ) -> EmberResult<ExecutionResult>;

    fn control(&self, shard: ShardId, txn: TxnId, control: &ShardControl) -> EmberResult<()>;

    fn apply_ddl(&self, shard: ShardId, ddl: &ShardDdl) -> EmberResult<()>;

    /// Drop any cached connection state for `shard` after a failure.
    fn reset_link(&self, shard: ShardId);
}
