//! Admission control: a shared gate for connections and in-flight
//! statements.
//!
//! Permits are RAII guards. A session reserves a statement permit when a
//! command starts and drops it when the command finishes or is aborted.
//! Exceeding a limit returns `EmberError::Transient` (SQLSTATE 53000).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ember_common::error::{EmberError, EmberResult};

/// Releases a statement slot when dropped.
#[derive(Debug)]
pub struct StatementPermit {
    control: Arc<AdmissionControl>,
}

impl Drop for StatementPermit {
    fn drop(&mut self) {
        self.control.inflight_statements.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Releases a connection slot when dropped.
#[derive(Debug)]
pub struct ConnectionPermit {
    control: Arc<AdmissionControl>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.control.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct AdmissionControl {
    /// 0 means unlimited.
    max_inflight_statements: usize,
    max_connections: usize,
    inflight_statements: AtomicUsize,
    active_connections: AtomicUsize,
    statements_rejected: AtomicU64,
    connections_rejected: AtomicU64,
}

impl std::fmt::Debug for AdmissionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionControl")
            .field("inflight_statements", &self.inflight_statements())
            .field("active_connections", &self.active_connections())
            .field(
                "statements_rejected",
                &self.statements_rejected.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl AdmissionControl {
    pub fn new(max_inflight_statements: usize, max_connections: usize) -> Arc<Self> {
        Arc::new(Self {
            max_inflight_statements,
            max_connections,
            inflight_statements: AtomicUsize::new(0),
            active_connections: AtomicUsize::new(0),
            statements_rejected: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
        })
    }

    /// No limits; every acquire succeeds.
    pub fn unlimited() -> Arc<Self> {
        Self::new(0, 0)
    }

    pub fn acquire_statement(self: &Arc<Self>) -> EmberResult<StatementPermit> {
        let current = self.inflight_statements.fetch_add(1, Ordering::AcqRel);
        if self.max_inflight_statements != 0 && current >= self.max_inflight_statements {
            self.inflight_statements.fetch_sub(1, Ordering::AcqRel);
            self.statements_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(EmberError::transient(format!(
                "statement concurrency limit reached ({}/{})",
                current, self.max_inflight_statements
            )));
        }
        Ok(StatementPermit {
            control: Arc::clone(self),
        })
    }

    pub fn acquire_connection(self: &Arc<Self>) -> EmberResult<ConnectionPermit> {
        let current = self.active_connections.fetch_add(1, Ordering::AcqRel);
        if self.max_connections != 0 && current >= self.max_connections {
            self.active_connections.fetch_sub(1, Ordering::AcqRel);
            self.connections_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(EmberError::transient(format!(
                "connection limit reached ({}/{})",
                current, self.max_connections
            )));
        }
        Ok(ConnectionPermit {
            control: Arc::clone(self),
        })
    }

    pub fn inflight_statements(&self) -> usize {
        self.inflight_statements.load(Ordering::Acquire)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn statements_rejected(&self) -> u64 {
        self.statements_rejected.load(Ordering::Relaxed)
    }

    pub fn connections_rejected(&self) -> u64 {
        self.connections_rejected.load(Ordering::Relaxed)
    }
}
