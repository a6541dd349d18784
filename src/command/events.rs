//! Observable outcomes of the dispatcher

use rabbit_shared::{CommandKind, CriticalKind, InFlight, Movement};

/// Events emitted by the dispatcher for logging and supervision
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// A link was handed to the dispatcher
    SessionOpened { transport: &'static str },
    /// A write was acknowledged by the link
    Sent { kind: CommandKind, payload: String },
    /// A write failed; the payload is not retried
    WriteFailed {
        kind: CommandKind,
        payload: String,
        error: String,
    },
    /// A critical command was submitted without an active link
    CriticalDropped { kind: CriticalKind },
    /// The session ended and its queued work was discarded
    SessionClosed {
        reason: String,
        dropped_critical: usize,
        cancelled_write: Option<InFlight>,
    },
}

/// Snapshot of the dispatcher state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatus {
    pub connected: bool,
    pub in_flight: Option<InFlight>,
    pub queued_critical: usize,
    pub pending_movement: bool,
    pub last_sent: Option<Movement>,
    pub target: Option<Movement>,
    pub movement_enabled: bool,
}
