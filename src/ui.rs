/**
 * ui.rs
 *
 * Notification seam towards whatever presents the session
 */

use crate::error::SessionError;
use crate::params::{HostCode, Role};
use crate::session::{Peer, SessionEndpoint, SessionState};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Receives session lifecycle notifications.
///
/// Calls come from tokio worker tasks, never from the caller's thread, and
/// must not block.
pub trait NetPlayUi: Send + Sync {
    /// The endpoint just reached `Connected`; called before the creating call returns
    fn session_established(&self, endpoint: &SessionEndpoint);

    fn session_failed(&self, error: &SessionError);

    fn state_changed(&self, _state: SessionState) {}

    /// Every player in the session, local player included
    fn players_changed(&self, _players: &[Peer]) {}

    fn game_changed(&self, _game: &str) {}

    /// The host went away under a connected client
    fn connection_lost(&self) {}

    /// A traversal host lost its registration; its host code no longer resolves
    fn traversal_lost(&self) {}
}

/// Logs every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct LogUi;

impl NetPlayUi for LogUi {
    fn session_established(&self, endpoint: &SessionEndpoint) {
        let port = endpoint.local_port();
        match endpoint.host_code() {
            Some(code) => info!(port, host_code = %code, "session established"),
            None => info!(port, role = ?endpoint.role(), "session established"),
        }
    }

    fn session_failed(&self, error: &SessionError) {
        warn!(%error, "session failed");
    }

    fn players_changed(&self, players: &[Peer]) {
        let names: Vec<&str> = players.iter().map(|p| p.nickname.as_str()).collect();
        info!(count = players.len(), players = ?names, "player list changed");
    }

    fn game_changed(&self, game: &str) {
        info!(game, "game changed");
    }

    fn connection_lost(&self) {
        warn!("lost connection to host");
    }

    fn traversal_lost(&self) {
        warn!("traversal registration lost, host code no longer valid");
    }
}

/// Notification forwarded over a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Established {
        role: Role,
        local_port: u16,
        host_code: Option<HostCode>,
        game: String,
    },
    Failed {
        code: i32,
        message: String,
    },
    State(SessionState),
    Players(Vec<Peer>),
    Game(String),
    ConnectionLost,
    TraversalLost,
}

/// Forwards notifications to a receiver owned by the presentation side
#[derive(Debug, Clone)]
pub struct ChannelUi {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelUi {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: UiEvent) {
        // Receiver gone means nobody is presenting anymore
        let _ = self.tx.send(event);
    }
}

impl NetPlayUi for ChannelUi {
    fn session_established(&self, endpoint: &SessionEndpoint) {
        self.send(UiEvent::Established {
            role: endpoint.role(),
            local_port: endpoint.local_port(),
            host_code: endpoint.host_code().cloned(),
            game: endpoint.game(),
        });
    }

    fn session_failed(&self, error: &SessionError) {
        self.send(UiEvent::Failed {
            code: error.code(),
            message: error.to_string(),
        });
    }

    fn state_changed(&self, state: SessionState) {
        self.send(UiEvent::State(state));
    }

    fn players_changed(&self, players: &[Peer]) {
        self.send(UiEvent::Players(players.to_vec()));
    }

    fn game_changed(&self, game: &str) {
        self.send(UiEvent::Game(game.to_string()));
    }

    fn connection_lost(&self) {
        self.send(UiEvent::ConnectionLost);
    }

    fn traversal_lost(&self) {
        self.send(UiEvent::TraversalLost);
    }
}
