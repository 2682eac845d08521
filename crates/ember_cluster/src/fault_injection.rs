//! Fault injection for shard links, used by failure-path tests.
//!
//! A fault is armed for one shard and fires on that shard's next dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use ember_common::types::ShardId;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFault {
    /// The request never leaves the coordinator.
    BeforeSend,
    /// The shard applies the request but the reply is lost.
    AfterSend,
}

#[derive(Debug, Default)]
pub struct LinkFaultInjector {
    armed: Mutex<HashMap<ShardId, LinkFault>>,
    fired: AtomicU64,
}

impl LinkFaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, shard: ShardId, fault: LinkFault) {
        tracing::warn!(%shard, ?fault, "fault injection: link fault armed");
        self.armed.lock().insert(shard, fault);
    }

    /// Take the armed fault for `shard`, if any.
    pub fn take(&self, shard: ShardId) -> Option<LinkFault> {
        let fault = self.armed.lock().remove(&shard);
        if fault.is_some() {
            self.fired.fetch_add(1, Ordering::Relaxed);
        }
        fault
    }

    pub fn faults_fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.armed.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_fires_once() {
        let inj = LinkFaultInjector::new();
        inj.arm(ShardId(2), LinkFault::AfterSend);
        assert_eq!(inj.take(ShardId(1)), None);
        assert_eq!(inj.take(ShardId(2)), Some(LinkFault::AfterSend));
        assert_eq!(inj.take(ShardId(2)), None);
        assert_eq!(inj.faults_fired(), 1);
    }
}
