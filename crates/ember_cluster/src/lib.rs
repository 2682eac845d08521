pub mod admission;
pub mod cluster;
pub mod distributed_exec;
pub mod fault_injection;
pub mod local_transport;
pub mod shard_map;
pub mod sharding;
pub mod transport;
pub mod txn;

pub use admission::{AdmissionControl, ConnectionPermit, StatementPermit};
pub use cluster::LocalCluster;
pub use distributed_exec::DistributedExecutor;
pub use fault_injection::{LinkFault, LinkFaultInjector};
pub use local_transport::LocalTransport;
pub use shard_map::{ShardInfo, ShardMap};
pub use transport::{ShardControl, ShardDdl, ShardLink, ShardRequest, ShardTransport};
pub use txn::{TxnHandle, TxnManager};
