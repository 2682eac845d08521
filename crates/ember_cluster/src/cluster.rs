use std::sync::Arc;

use ember_common::catalog::Catalog;

use crate::admission::AdmissionControl;
use crate::distributed_exec::DistributedExecutor;
use crate::local_transport::LocalTransport;
use crate::shard_map::ShardMap;
use crate::txn::TxnManager;

/// A coordinator wired to in-process shards. Shared by every session of a
/// server.
pub struct LocalCluster {
    pub catalog: Arc<Catalog>,
    pub shard_map: Arc<ShardMap>,
    pub transport: Arc<LocalTransport>,
    pub txn_manager: Arc<TxnManager>,
    pub executor: Arc<DistributedExecutor>,
    pub admission: Arc<AdmissionControl>,
}

impl LocalCluster {
    pub fn new(shard_count: u64, admission: Arc<AdmissionControl>) -> Arc<Self> {
        let catalog = Arc::new(Catalog::new());
        let shard_map = Arc::new(ShardMap::uniform(shard_count));
        let transport = Arc::new(LocalTransport::new(shard_map.clone()));
        let txn_manager = Arc::new(TxnManager::new(transport.clone()));
        let executor = Arc::new(DistributedExecutor::new(
            catalog.clone(),
            shard_map.clone(),
            transport.clone(),
        ));
        tracing::info!(shards = shard_map.num_shards(), "local cluster ready");
        Arc::new(Self {
            catalog,
            shard_map,
            transport,
            txn_manager,
            executor,
            admission,
        })
    }

    /// Cluster with no admission limits, as used by tests.
    pub fn with_shards(shard_count: u64) -> Arc<Self> {
        Self::new(shard_count, AdmissionControl::unlimited())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ShardTransport;

    #[test]
    fn test_cluster_wiring() {
        let cluster = LocalCluster::with_shards(3);
        assert_eq!(cluster.transport.shard_ids().len(), 3);
        assert_eq!(cluster.shard_map.num_shards(), 3);
        assert_eq!(cluster.catalog.generation(), 1);
    }
}
