use std::sync::Arc;

use ember_cluster::TxnManager;
use ember_common::config::SessionConfig;
use ember_common::types::SessionId;

use crate::interrupts::InterruptState;
use crate::portal::PortalManager;
use crate::resource_owner::ResourceOwner;
use crate::statement_cache::StatementCache;
use crate::txn_bracket::TxnBracket;

/// Extended-query protocol flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolState {
    /// Set by Parse/Bind/Describe/Execute/Close/Flush and the batch
    /// message; cleared by Query, Sync and Terminate.
    pub doing_extended_query: bool,
    /// After an error inside an extended-query sequence every message up
    /// to the next Sync is discarded.
    pub skip_till_sync: bool,
    pub send_ready_for_query: bool,
}

/// Per-connection state. Nothing here is shared with other sessions except
/// the interrupt flags, which the cancel registry can reach.
pub struct Session {
    pub id: SessionId,
    pub secret_key: i32,
    pub user: String,
    pub database: String,
    pub statements: StatementCache,
    pub portals: PortalManager,
    pub protocol: ProtocolState,
    pub bracket: TxnBracket,
    pub interrupts: Arc<InterruptState>,
    pub resources: ResourceOwner,
    pub config: SessionConfig,
}

impl Session {
    pub fn new(
        id: SessionId,
        secret_key: i32,
        txn_manager: Arc<TxnManager>,
        config: SessionConfig,
    ) -> Self {
        Self {
            id,
            secret_key,
            user: String::new(),
            database: String::new(),
            statements: StatementCache::new(),
            portals: PortalManager::new(),
            protocol: ProtocolState::default(),
            bracket: TxnBracket::new(txn_manager),
            interrupts: InterruptState::new(),
            resources: ResourceOwner::new(),
            config,
        }
    }

    pub fn transaction_open(&self) -> bool {
        self.bracket.transaction_open()
    }

    pub fn txn_status_byte(&self) -> u8 {
        self.bracket.status_byte()
    }

    /// Roll back and drop everything the session holds.
    pub fn teardown(&mut self) {
        self.portals.clear();
        self.statements.clear();
        self.bracket.teardown();
        self.resources.release_all();
        tracing::debug!(session_id = self.id.0, "session state released");
    }
}
