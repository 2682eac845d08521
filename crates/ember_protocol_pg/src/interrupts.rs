//! Pending-interrupt flags for one session.
//!
//! Cancel requests, terminate requests and statement timeouts only set
//! flags here. They take effect when the session reaches a safe point and
//! calls [`InterruptCheck::check_for_interrupts`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ember_common::error::{CancelReason, EmberError, EmberResult};
use ember_common::interrupt::InterruptCheck;
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct InterruptState {
    cancel_pending: AtomicBool,
    terminate_pending: AtomicBool,
    holdoff: AtomicU32,
    deadline: Mutex<Option<Instant>>,
}

impl InterruptState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Called from another connection's CancelRequest.
    pub fn request_cancel(&self) {
        self.cancel_pending.store(true, Ordering::SeqCst);
    }

    /// Ask the session to end at its next safe point.
    pub fn request_terminate(&self) {
        self.terminate_pending.store(true, Ordering::SeqCst);
    }

    pub fn cancel_pending(&self) -> bool {
        self.cancel_pending.load(Ordering::SeqCst)
    }

    pub fn clear_cancel(&self) {
        self.cancel_pending.store(false, Ordering::SeqCst);
    }

    /// Start the statement timer. `timeout_ms == 0` leaves it disarmed.
    pub fn arm_timeout(&self, timeout_ms: u64) {
        if timeout_ms > 0 {
            *self.deadline.lock() = Some(Instant::now() + Duration::from_millis(timeout_ms));
        }
    }

    pub fn disarm_timeout(&self) {
        *self.deadline.lock() = None;
    }

    pub fn timeout_armed(&self) -> bool {
        self.deadline.lock().is_some()
    }

    /// A message has just been read while the session was idle. A cancel
    /// that arrived with nothing running is dropped, unless an extended-query
    /// sequence is being skipped, in which case it stays pending.
    pub fn on_message_read(&self, skip_till_sync: bool) {
        if skip_till_sync {
            return;
        }
        if self.cancel_pending.swap(false, Ordering::SeqCst) {
            tracing::debug!("discarding cancel request received while idle");
        }
    }

    /// Suspend interrupt delivery until the returned guard is dropped.
    pub fn hold(self: &Arc<Self>) -> HoldInterrupts {
        self.holdoff.fetch_add(1, Ordering::AcqRel);
        HoldInterrupts {
            state: Arc::clone(self),
        }
    }

    pub fn held(&self) -> bool {
        self.holdoff.load(Ordering::Acquire) > 0
    }
}

impl InterruptCheck for InterruptState {
    fn check_for_interrupts(&self) -> EmberResult<()> {
        if self.held() {
            return Ok(());
        }
        if self.terminate_pending.load(Ordering::SeqCst) {
            return Err(EmberError::Terminated);
        }
        if self.cancel_pending.swap(false, Ordering::SeqCst) {
            return Err(EmberError::Canceled(CancelReason::UserRequest));
        }
        let mut deadline = self.deadline.lock();
        if deadline.is_some_and(|d| Instant::now() >= d) {
            *deadline = None;
            return Err(EmberError::Canceled(CancelReason::StatementTimeout));
        }
        Ok(())
    }
}

/// Resumes interrupt delivery on drop.
#[must_use]
pub struct HoldInterrupts {
    state: Arc<InterruptState>,
}

impl Drop for HoldInterrupts {
    fn drop(&mut self) {
        self.state.holdoff.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_delivered_once() {
        let st = InterruptState::new();
        st.request_cancel();
        let err = st.check_for_interrupts().unwrap_err();
        assert_eq!(err.pg_sqlstate(), "57014");
        assert!(st.check_for_interrupts().is_ok());
    }

    #[test]
    fn test_hold_defers_delivery() {
        let st = InterruptState::new();
        st.request_cancel();
        {
            let _outer = st.hold();
            let _inner = st.hold();
            assert!(st.check_for_interrupts().is_ok());
        }
        assert!(st.check_for_interrupts().is_err());
    }

    #[test]
    fn test_idle_cancel_discarded_unless_skipping() {
        let st = InterruptState::new();
        st.request_cancel();
        st.on_message_read(true);
        assert!(st.cancel_pending(), "deferred while skipping to Sync");
        st.on_message_read(false);
        assert!(!st.cancel_pending());
    }

    #[test]
    fn test_statement_timeout() {
        let st = InterruptState::new();
        st.arm_timeout(1);
        std::thread::sleep(Duration::from_millis(5));
        match st.check_for_interrupts() {
            Err(EmberError::Canceled(CancelReason::StatementTimeout)) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(!st.timeout_armed());
        st.arm_timeout(0);
        assert!(!st.timeout_armed());
    }

    #[test]
    fn test_terminate_wins_over_cancel() {
        let st = InterruptState::new();
        st.request_cancel();
        st.request_terminate();
        assert!(matches!(st.check_for_interrupts(), Err(EmberError::Terminated)));
    }
}
