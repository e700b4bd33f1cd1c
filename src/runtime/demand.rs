//! Read-demand control.
//!
//! The transport never reads ahead of the application: one input line is
//! requested only when the connection is idle and the peer is keeping up
//! with response output. The request is issued as a deferred action on the
//! connection's own worker, and eligibility is re-checked when the action
//! runs, because writability can flip (or a response can start) between
//! scheduling and execution. The pending flag bounds the asks to one per
//! eligible window and prevents re-entrant request storms.

/// Conditions sampled at a decision point.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DemandSnapshot {
    pub response_in_flight: bool,
    pub active: bool,
    pub writable: bool,
}

impl DemandSnapshot {
    fn eligible(&self) -> bool {
        !self.response_in_flight && self.active && self.writable
    }
}

#[derive(Debug, Default)]
pub(crate) struct DemandController {
    read_request_pending: bool,
}

impl DemandController {
    pub fn new() -> Self {
        Self {
            read_request_pending: false,
        }
    }

    /// Called when the connection becomes active, a response finishes, or
    /// writability changes. Returns true when a deferred read request
    /// should be scheduled.
    pub fn reconsider(&mut self, snapshot: DemandSnapshot) -> bool {
        if self.read_request_pending {
            return false;
        }
        if !snapshot.eligible() {
            return false;
        }
        self.read_request_pending = true;
        true
    }

    /// Runs when the scheduled request executes. Clears the pending flag
    /// unconditionally and reports whether the transport should actually
    /// deliver the next line.
    pub fn execute(&mut self, snapshot: DemandSnapshot) -> bool {
        self.read_request_pending = false;
        snapshot.eligible()
    }
}
