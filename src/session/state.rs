/**
 * session/state.rs
 *
 * Endpoint state machine
 */

use crate::params::{Mode, Role};
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Lifecycle of a session endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    /// Host socket bound and listening
    Listening,
    /// Host reachable: direct port known, or host code issued
    Bound,
    /// Client waiting on the traversal server for the host address
    Resolving,
    /// Client handshaking with the host
    Connecting,
    Connected,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Listening => "Listening",
            SessionState::Bound => "Bound",
            SessionState::Resolving => "Resolving host code",
            SessionState::Connecting => "Connecting",
            SessionState::Connected => "Connected",
            SessionState::Closed => "Closed",
            SessionState::Failed => "Failed",
        }
    }

    /// Whether `self -> next` is an edge of the machine for this role and mode
    pub fn can_transition(self, next: SessionState, role: Role, mode: Mode) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        match (role, self, next) {
            (Role::Host, Idle, Listening) => true,
            (Role::Host, Listening, Bound) => true,
            (Role::Host, Bound, Connected) => true,
            (Role::Client, Idle, Resolving) => mode == Mode::Traversal,
            (Role::Client, Idle, Connecting) => mode == Mode::Direct,
            (Role::Client, Resolving, Connecting) => true,
            (Role::Client, Connecting, Connected) => true,
            (_, Connected, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid session transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// Current state plus a watch channel so progress can be observed off-thread
#[derive(Debug)]
pub struct StateMachine {
    role: Role,
    mode: Mode,
    tx: watch::Sender<SessionState>,
}

impl StateMachine {
    pub fn new(role: Role, mode: Mode) -> Self {
        let (tx, _rx) = watch::channel(SessionState::Idle);
        Self { role, mode, tx }
    }

    pub fn current(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Check and apply a transition atomically
    pub fn advance(&self, next: SessionState) -> Result<(), InvalidTransition> {
        let (role, mode) = (self.role, self.mode);
        let mut rejected = None;

        self.tx.send_if_modified(|state| {
            if state.can_transition(next, role, mode) {
                debug!(from = %state, to = %next, "session transition");
                *state = next;
                true
            } else {
                rejected = Some(*state);
                false
            }
        });

        match rejected {
            Some(from) => {
                warn!(%from, to = %next, "rejected session transition");
                Err(InvalidTransition { from, to: next })
            }
            None => Ok(()),
        }
    }

    /// Move to `Failed` unless already terminal; true if this call moved it
    pub fn fail(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = SessionState::Failed;
                true
            }
        })
    }
}
