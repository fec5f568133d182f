//! Session state machine.

use std::fmt;

/// Lifecycle of one device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Created, transport not yet used.
    #[default]
    Idle,
    /// Waiting for the first request to settle the protocol version.
    Handshaking,
    /// Command loop.
    Serving,
    /// Tearing down; the transport is being closed.
    Closing,
    /// Terminal.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::Handshaking => write!(f, "HANDSHAKING"),
            SessionState::Serving => write!(f, "SERVING"),
            SessionState::Closing => write!(f, "CLOSING"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

impl SessionState {
    /// Whether `self -> to` is a legal transition.
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Idle, Handshaking)
                | (Idle, Closing)
                | (Handshaking, Serving)
                | (Handshaking, Closing)
                | (Serving, Closing)
                | (Closing, Closed)
        )
    }
}

/// Why a session left `Serving` (or never reached it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The receiver sent `Exit`.
    Exit,
    /// Operator requested a stop.
    Cancelled,
    /// Fatal transport or protocol failure.
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Exit => write!(f, "exit requested by device"),
            CloseReason::Cancelled => write!(f, "cancelled"),
            CloseReason::Error(msg) => write!(f, "error: {msg}"),
        }
    }
}

/// Runtime state of one session.
#[derive(Debug, Default)]
pub struct SessionContext {
    /// Current state.
    pub state: SessionState,
    /// Negotiated protocol version, set when leaving `Handshaking`.
    pub protocol_version: Option<u32>,
    /// Commands dispatched so far.
    pub commands_served: u64,
    /// Timeouts since the last successful read.
    pub consecutive_timeouts: u32,
    pub close_reason: Option<CloseReason>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to a new state.
    ///
    /// Illegal transitions are refused and logged; returns whether the state
    /// changed.
    pub fn goto_state(&mut self, new_state: SessionState) -> bool {
        if !self.state.can_transition(new_state) {
            tracing::error!(from = %self.state, to = %new_state, "Refusing illegal state transition");
            return false;
        }
        tracing::info!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
        true
    }

    /// Record why the session is closing; the first reason wins.
    pub fn close(&mut self, reason: CloseReason) {
        if self.close_reason.is_none() {
            self.close_reason = Some(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut ctx = SessionContext::new();
        assert!(ctx.goto_state(SessionState::Handshaking));
        assert!(ctx.goto_state(SessionState::Serving));
        ctx.close(CloseReason::Exit);
        assert_eq!(ctx.close_reason, Some(CloseReason::Exit));
        assert!(ctx.goto_state(SessionState::Closing));
        assert!(ctx.goto_state(SessionState::Closed));
        assert_eq!(ctx.state, SessionState::Closed);
    }

    #[test]
    fn test_illegal_transitions_refused() {
        let mut ctx = SessionContext::new();
        assert!(!ctx.goto_state(SessionState::Serving));
        assert_eq!(ctx.state, SessionState::Idle);

        ctx.goto_state(SessionState::Closing);
        ctx.goto_state(SessionState::Closed);
        assert!(!ctx.goto_state(SessionState::Handshaking));
        assert_eq!(ctx.state, SessionState::Closed);
    }

    #[test]
    fn test_first_close_reason_wins() {
        let mut ctx = SessionContext::new();
        ctx.close(CloseReason::Error("bad magic".into()));
        ctx.close(CloseReason::Exit);
        assert_eq!(ctx.close_reason, Some(CloseReason::Error("bad magic".into())));
    }
}
