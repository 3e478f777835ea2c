//! Per-connection protocol handling
//!
//! This module handles:
//! - The greet / settle / receive / commit exchange with one sensor
//! - The deadline that bounds every connection
//! - Handing committed readings to durable delivery after the socket closes

mod connection;
mod state;

pub use connection::{
    handle_connection, run_session, ClosedSession, SensorSession, SessionContext, SessionError,
    SessionOutcome,
};
pub use state::{SessionEvent, SessionState, SessionStateMachine, TransitionResult};
