use std::sync::Arc;

use ember_cluster::{AdmissionControl, ShardLink, StatementPermit};
use ember_common::error::EmberResult;

/// Resources held by the command in progress: the admission slot and any
/// shard-link leases. Everything is returned by [`ResourceOwner::release_all`],
/// which runs on normal completion and on the error path alike.
#[derive(Debug, Default)]
pub struct ResourceOwner {
    permit: Option<StatementPermit>,
    leases: Vec<ShardLink>,
}

impl ResourceOwner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take an admission slot unless the command already holds one.
    pub fn reserve(&mut self, admission: &Arc<AdmissionControl>) -> EmberResult<()> {
        if self.permit.is_none() {
            self.permit = Some(admission.acquire_statement()?);
        }
        Ok(())
    }

    pub fn leases_mut(&mut self) -> &mut Vec<ShardLink> {
        &mut self.leases
    }

    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permit.is_none() && self.leases.is_empty()
    }

    pub fn release_all(&mut self) {
        if !self.is_empty() {
            tracing::trace!(
                leases = self.leases.len(),
                permit = self.permit.is_some(),
                "releasing command resources"
            );
        }
        self.leases.clear();
        self.permit = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_cluster::{LocalTransport, ShardMap, ShardTransport};
    use ember_common::types::ShardId;

    #[test]
    fn test_release_returns_everything() {
        let admission = AdmissionControl::new(1, 0);
        let transport = LocalTransport::new(Arc::new(ShardMap::uniform(2)));
        let mut owner = ResourceOwner::new();
        owner.reserve(&admission).unwrap();
        owner.reserve(&admission).unwrap();
        assert_eq!(admission.inflight_statements(), 1);
        owner
            .leases_mut()
            .push(transport.acquire_link(ShardId(1)).unwrap());
        assert_eq!(transport.links_in_use(), 1);

        owner.release_all();
        assert!(owner.is_empty());
        assert_eq!(admission.inflight_statements(), 0);
        assert_eq!(transport.links_in_use(), 0);
    }
}
