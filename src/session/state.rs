//! Session State Machine
//!
//! Lifecycle of one interactive session on the streaming surface:
//!
//! ```text
//! ┌──────────────┐   lease granted   ┌───────────────┐   channel ready   ┌──────────┐
//! │  Connecting  │ ────────────────► │ Authenticated │ ────────────────► │  Active  │
//! └──────┬───────┘                   └───────┬───────┘                   └────┬─────┘
//!        │ connect failed                    │                                │
//!        │                                   │  disconnect / transport error  │
//!        │                                   ▼  / idle timeout                ▼
//!        │                            ┌──────────────┐                        │
//!        │                            │   Closing    │ ◄──────────────────────┘
//!        │                            └──────┬───────┘
//!        │                                   │ lease released
//!        ▼                                   ▼
//!  ┌──────────────────────────────────────────────┐
//!  │                    Closed                    │  (absorbing; inputs ignored)
//!  └──────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Session states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Waiting for `connect` or for the registry lease
    #[default]
    Connecting,
    /// Lease held, terminal not yet ready
    Authenticated,
    /// Accepting `command` and `resize`
    Active,
    /// Draining in-flight output before release
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Authenticated => write!(f, "authenticated"),
            Self::Active => write!(f, "active"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// State machine for session lifecycle management
#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    error_message: Option<String>,
    state_changed_at: Instant,
    transition_count: u32,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            error_message: None,
            state_changed_at: Instant::now(),
            transition_count: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Reason the session failed, if it did
    pub fn error(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn transition_count(&self) -> u32 {
        self.transition_count
    }

    /// Registry granted the lease
    pub fn authenticated(&mut self) -> Result<(), StateTransitionError> {
        self.expect(&[SessionState::Connecting], SessionState::Authenticated)
    }

    /// Terminal is ready for commands
    pub fn activate(&mut self) -> Result<(), StateTransitionError> {
        self.expect(&[SessionState::Authenticated], SessionState::Active)
    }

    /// Connect failed; there is nothing to drain
    pub fn connect_failed(&mut self, error: String) -> Result<(), StateTransitionError> {
        self.expect(&[SessionState::Connecting], SessionState::Closed)?;
        self.error_message = Some(error);
        Ok(())
    }

    /// Begin teardown (disconnect, transport error, idle timeout)
    pub fn start_closing(&mut self) -> Result<(), StateTransitionError> {
        self.expect(
            &[
                SessionState::Connecting,
                SessionState::Authenticated,
                SessionState::Active,
            ],
            SessionState::Closing,
        )
    }

    /// Lease released
    pub fn close_complete(&mut self) -> Result<(), StateTransitionError> {
        self.expect(&[SessionState::Closing], SessionState::Closed)
    }

    /// Record a fatal error and begin teardown from wherever we are
    pub fn fail(&mut self, error: String) {
        if self.state != SessionState::Closed && self.state != SessionState::Closing {
            self.transition_to(SessionState::Closing);
        }
        self.error_message.get_or_insert(error);
    }

    pub fn accepts_commands(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    fn expect(&mut self, from: &[SessionState], to: SessionState) -> Result<(), StateTransitionError> {
        if from.contains(&self.state) {
            self.transition_to(to);
            Ok(())
        } else {
            Err(StateTransitionError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }

    fn transition_to(&mut self, new_state: SessionState) {
        tracing::debug!(
            "Session state transition: {} -> {} after {:?} (count: {})",
            self.state,
            new_state,
            self.state_changed_at.elapsed(),
            self.transition_count + 1
        );
        self.state = new_state;
        self.state_changed_at = Instant::now();
        self.transition_count += 1;
    }
}

/// Error type for invalid state transitions
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateTransitionError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}
