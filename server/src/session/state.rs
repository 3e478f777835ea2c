//! Sensor Session State Machine
//!
//! Defines the valid transitions of the single-exchange protocol:
//!
//! ```text
//! Accepted -> Greeted -> AwaitingPayload -> { Committed | Rejected | TimedOut } -> Closed
//! ```
//!
//! Any non-terminal state may also go straight to `Closed` (transport failure,
//! peer hang-up, noise payload).

/// Where a connection is in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handed off by the listener
    Accepted,
    /// Marker byte sent
    Greeted,
    /// Settle delay over, waiting for the payload
    AwaitingPayload,
    /// Payload decoded and committed to the store
    Committed,
    /// Payload could not be decoded
    Rejected,
    /// Deadline passed without a payload
    TimedOut,
    /// Socket released
    Closed,
}

/// Events that drive a session forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    GreetingSent,
    SettleElapsed,
    PayloadAccepted,
    PayloadRejected,
    DeadlineExpired,
    Closed,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(SessionState),
    /// Transition was invalid from current state
    Invalid {
        from: SessionState,
        event: SessionEvent,
    },
}

/// Tracks one connection through the protocol
#[derive(Debug)]
pub struct SessionStateMachine {
    current_state: SessionState,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    /// Create a new state machine in Accepted state
    pub fn new() -> Self {
        Self {
            current_state: SessionState::Accepted,
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.current_state
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: SessionEvent) -> TransitionResult {
        match self.get_next_state(event) {
            Some(state) => {
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }

    fn get_next_state(&self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent::*;
        use SessionState::*;

        match (self.current_state, event) {
            (Accepted, GreetingSent) => Some(Greeted),
            (Greeted, SettleElapsed) => Some(AwaitingPayload),

            (AwaitingPayload, PayloadAccepted) => Some(Committed),
            (AwaitingPayload, PayloadRejected) => Some(Rejected),
            (AwaitingPayload, DeadlineExpired) => Some(TimedOut),

            // Every path ends here, exactly once
            (SessionState::Closed, SessionEvent::Closed) => None,
            (_, SessionEvent::Closed) => Some(SessionState::Closed),

            _ => None,
        }
    }
}
