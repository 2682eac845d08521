//! Error recovery for a session.
//!
//! Runs after any error raised while handling a message. Recovery itself
//! cannot fail, so an interrupt arriving while it runs is simply held and
//! an error in the middle of it cannot recurse.

use std::sync::Arc;

use ember_common::error::EmberError;
use ember_observability::record_error;

use crate::codec::BackendMessage;
use crate::handler::{Backend, Flow};

impl Backend {
    /// Bring the session back to a state where it can accept the next
    /// message, report `err` to the client, and decide how the protocol
    /// resumes.
    pub(crate) fn recover(&mut self, err: EmberError) -> Flow {
        if err.is_connection_fatal() {
            self.fatal(err);
            return Flow::Terminate;
        }

        let interrupts = Arc::clone(&self.session.interrupts);
        let _hold = interrupts.hold();

        let ended = self.session.bracket.abort_current(&interrupts);
        if ended {
            self.session.portals.clear();
        }
        self.session.resources.release_all();
        self.session.portals.drop_unnamed();
        self.session.statements.drop_unnamed();

        let sqlstate = err.pg_sqlstate();
        tracing::warn!(
            session_id = self.session.id.0,
            sqlstate,
            class = ?err.class(),
            error = %err,
            "statement failed"
        );
        record_error(sqlstate);
        self.send(BackendMessage::ErrorResponse {
            severity: err.pg_severity().into(),
            code: sqlstate.into(),
            message: err.pg_message(),
        });

        let protocol = &mut self.session.protocol;
        if protocol.doing_extended_query {
            protocol.skip_till_sync = true;
        } else {
            protocol.send_ready_for_query = true;
        }
        protocol.doing_extended_query = false;

        interrupts.clear_cancel();
        interrupts.disarm_timeout();
        Flow::Continue
    }
}
