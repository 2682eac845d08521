use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ember_common::error::{ClusterError, EmberResult};
use ember_common::interrupt::InterruptCheck;
use ember_common::types::{ShardId, TxnId};
use ember_executor::{ExecutionResult, ShardStore};
use parking_lot::Mutex;

use crate::fault_injection::{LinkFault, LinkFaultInjector};
use crate::shard_map::ShardMap;
use crate::sharding::HashOwnership;
use crate::transport::{ShardControl, ShardDdl, ShardLink, ShardRequest, ShardTransport};

#[derive(Debug, Default)]
struct LinkCounters {
    dispatches: AtomicU64,
    resets: AtomicU64,
}

/// In-process transport: every shard is a `ShardStore` behind a mutex.
pub struct LocalTransport {
    shard_map: Arc<ShardMap>,
    shards: Vec<Mutex<ShardStore>>,
    counters: Vec<LinkCounters>,
    links_in_use: Arc<AtomicUsize>,
    faults: LinkFaultInjector,
}

impl LocalTransport {
    pub fn new(shard_map: Arc<ShardMap>) -> Self {
        let shards = shard_map
            .shard_ids()
            .into_iter()
            .map(|id| Mutex::new(ShardStore::new(id)))
            .collect();
        let counters = shard_map
            .shard_ids()
            .iter()
            .map(|_| LinkCounters::default())
            .collect();
        Self {
            shard_map,
            shards,
            counters,
            links_in_use: Arc::new(AtomicUsize::new(0)),
            faults: LinkFaultInjector::new(),
        }
    }

    pub fn faults(&self) -> &LinkFaultInjector {
        &self.faults
    }

    /// Number of request sub-messages delivered to `shard`.
    pub fn dispatch_count(&self, shard: ShardId) -> u64 {
        self.counter(shard)
            .map(|c| c.dispatches.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn total_dispatches(&self) -> u64 {
        self.counters
            .iter()
            .map(|c| c.dispatches.load(Ordering::Relaxed))
            .sum()
    }

    pub fn reset_count(&self, shard: ShardId) -> u64 {
        self.counter(shard)
            .map(|c| c.resets.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Link leases currently outstanding across all sessions.
    pub fn links_in_use(&self) -> usize {
        self.links_in_use.load(Ordering::Acquire)
    }

    /// Run `f` against one shard's store. Test and diagnostics hook.
    pub fn with_store<R>(&self, shard: ShardId, f: impl FnOnce(&ShardStore) -> R) -> Option<R> {
        self.store(shard).map(|s| f(&s.lock()))
    }

    fn store(&self, shard: ShardId) -> Option<&Mutex<ShardStore>> {
        self.shards.get(usize::try_from(shard.0).ok()?)
    }

    fn counter(&self, shard: ShardId) -> Option<&LinkCounters> {
        self.counters.get(usize::try_from(shard.0).ok()?)
    }

    fn store_or_err(&self, shard: ShardId) -> EmberResult<&Mutex<ShardStore>> {
        self.store(shard)
            .ok_or_else(|| ClusterError::ShardNotFound(shard.0).into())
    }
}

impl ShardTransport for LocalTransport {
    fn shard_ids(&self) -> Vec<ShardId> {
        self.shard_map.shard_ids()
    }

    fn acquire_link(&self, shard: ShardId) -> EmberResult<ShardLink> {
        self.store_or_err(shard)?;
        Ok(ShardLink::new(shard, self.links_in_use.clone()))
    }

    fn dispatch(
        &self,
        link: &ShardLink,
        request: &ShardRequest,
        interrupts: &dyn InterruptCheck,
    ) -> EmberResult<ExecutionResult> {
        let shard = link.shard();
        let store = self.store_or_err(shard)?;
        let fault = self.faults.take(shard);
        if fault == Some(LinkFault::BeforeSend) {
            return Err(ClusterError::LinkFailed {
                shard: shard.0,
                reason: "link unavailable".into(),
                sent: false,
            }
            .into());
        }
        if let Some(c) = self.counter(shard) {
            c.dispatches.fetch_add(1, Ordering::Relaxed);
        }
        let ownership = HashOwnership {
            shard,
            shard_map: &self.shard_map,
        };
        let result = store.lock().execute_batch(
            &request.plan,
            &request.param_sets,
            request.txn,
            request.mode,
            &ownership,
            interrupts,
        );
        if fault == Some(LinkFault::AfterSend) {
            return Err(ClusterError::LinkFailed {
                shard: shard.0,
                reason: "connection reset while awaiting reply".into(),
                sent: true,
            }
            .into());
        }
        result
    }

    fn control(&self, shard: ShardId, txn: TxnId, control: &ShardControl) -> EmberResult<()> {
        let mut store = self.store_or_err(shard)?.lock();
        match control {
            ShardControl::Commit => store.commit(txn),
            ShardControl::Abort => store.abort(txn),
            ShardControl::Savepoint(name) => store.savepoint(txn, name),
            ShardControl::RollbackTo(name) => store.rollback_to(txn, name)?,
            ShardControl::Release(name) => store.release(txn, name)?,
        }
        Ok(())
    }

    fn apply_ddl(&self, shard: ShardId, ddl: &ShardDdl) -> EmberResult<()> {
        let mut store = self.store_or_err(shard)?.lock();
        match ddl {
            ShardDdl::CreateTable(schema) => store.create_table(schema),
            ShardDdl::DropTable(id) => store.drop_table(*id),
        }
        Ok(())
    }

    fn reset_link(&self, shard: ShardId) {
        if let Some(c) = self.counter(shard) {
            c.resets.fetch_add(1, Ordering::Relaxed);
        }
        tracing::warn!(%shard, "shard link reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_common::datum::Datum;
    use ember_common::interrupt::NoInterrupts;
    use ember_common::schema::{ColumnDef, Distribution, TableSchema};
    use ember_common::types::{DataType, TableId};
    use ember_executor::DispatchMode;
    use ember_planner::PhysicalPlan;
    use ember_sql_frontend::types::{Filter, ScalarExpr};

    fn setup_transport() -> (LocalTransport, Arc<TableSchema>) {
        let transport = LocalTransport::new(Arc::new(ShardMap::uniform(2)));
        let schema = Arc::new(TableSchema {
            id: TableId(1),
            name: "t".into(),
            columns: vec![ColumnDef::new("k", DataType::Int32)],
            distribution: Distribution::Replicated,
        });
        for shard in transport.shard_ids() {
            transport
                .apply_ddl(shard, &ShardDdl::CreateTable(schema.clone()))
                .unwrap();
        }
        (transport, schema)
    }

    fn insert_request(schema: &Arc<TableSchema>) -> ShardRequest {
        ShardRequest {
            txn: TxnId(1),
            plan: Arc::new(PhysicalPlan::Insert {
                schema: schema.clone(),
                columns: vec![0],
                rows: vec![vec![ScalarExpr::Param { index: 1 }]],
            }),
            param_sets: vec![vec![Datum::Int32(1)], vec![Datum::Int32(2)]],
            mode: DispatchMode::Routed,
        }
    }

    #[test]
    fn test_links_are_leased_and_returned() {
        let (transport, _) = setup_transport();
        {
            let _a = transport.acquire_link(ShardId(0)).unwrap();
            let _b = transport.acquire_link(ShardId(1)).unwrap();
            assert_eq!(transport.links_in_use(), 2);
        }
        assert_eq!(transport.links_in_use(), 0);
        assert!(transport.acquire_link(ShardId(9)).is_err());
    }

    #[test]
    fn test_batch_is_one_dispatch() {
        let (transport, schema) = setup_transport();
        let link = transport.acquire_link(ShardId(0)).unwrap();
        let res = transport
            .dispatch(&link, &insert_request(&schema), &NoInterrupts)
            .unwrap();
        assert_eq!(res.rows_affected, 2);
        assert_eq!(transport.dispatch_count(ShardId(0)), 1);
    }

    #[test]
    fn test_before_send_fault_leaves_shard_untouched() {
        let (transport, schema) = setup_transport();
        transport.faults().arm(ShardId(0), LinkFault::BeforeSend);
        let link = transport.acquire_link(ShardId(0)).unwrap();
        let err = transport
            .dispatch(&link, &insert_request(&schema), &NoInterrupts)
            .unwrap_err();
        assert!(err.is_pre_send_failure());
        assert_eq!(transport.with_store(ShardId(0), |s| s.row_count(schema.id)), Some(0));
    }

    #[test]
    fn test_after_send_fault_applies_then_fails() {
        let (transport, schema) = setup_transport();
        transport.faults().arm(ShardId(1), LinkFault::AfterSend);
        let link = transport.acquire_link(ShardId(1)).unwrap();
        let err = transport
            .dispatch(&link, &insert_request(&schema), &NoInterrupts)
            .unwrap_err();
        assert!(!err.is_pre_send_failure());
        assert_eq!(transport.with_store(ShardId(1), |s| s.row_count(schema.id)), Some(2));
        transport.control(ShardId(1), TxnId(1), &ShardControl::Abort).unwrap();
        assert_eq!(transport.with_store(ShardId(1), |s| s.row_count(schema.id)), Some(0));
    }

    #[test]
    fn test_scan_filter_passthrough() {
        let (transport, schema) = setup_transport();
        let link = transport.acquire_link(ShardId(0)).unwrap();
        transport
            .dispatch(&link, &insert_request(&schema), &NoInterrupts)
            .unwrap();
        let scan = ShardRequest {
            txn: TxnId(1),
            plan: Arc::new(PhysicalPlan::SeqScan {
                schema: schema.clone(),
                projection: vec![0],
                filter: Filter::default(),
            }),
            param_sets: Vec::new(),
            mode: DispatchMode::Broadcast,
        };
        let res = transport.dispatch(&link, &scan, &NoInterrupts).unwrap();
        assert_eq!(res.rows.len(), 2);
    }
}
