/**
 * session/mod.rs
 *
 * Session endpoint: the caller-owned result of a successful create
 */

mod client;
mod host;
mod protocol;
mod state;

pub(crate) use client::{handshake, start as start_client};
pub(crate) use host::{start as start_host, HostSetup};
pub use protocol::{Peer, PeerId, PeerMessage, HOST_PEER_ID, PROTOCOL_VERSION};
pub use state::{InvalidTransition, SessionState, StateMachine};

use crate::error::{Result, SessionError};
use crate::params::{HostCode, Mode, Role};
use crate::traversal::{TraversalLease, TraversalSession};
use crate::ui::NetPlayUi;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// State observed by the endpoint and its background tasks
pub(crate) struct Shared {
    state: StateMachine,
    players: RwLock<Vec<Peer>>,
    game: RwLock<String>,
    ui: Arc<dyn NetPlayUi>,
}

impl Shared {
    pub(crate) fn new(role: Role, mode: Mode, ui: Arc<dyn NetPlayUi>) -> Arc<Self> {
        Arc::new(Self {
            state: StateMachine::new(role, mode),
            players: RwLock::new(Vec::new()),
            game: RwLock::new(String::new()),
            ui,
        })
    }

    pub(crate) fn ui(&self) -> &dyn NetPlayUi {
        self.ui.as_ref()
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state.current()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub(crate) fn advance(&self, next: SessionState) -> std::result::Result<(), InvalidTransition> {
        self.state.advance(next)?;
        self.ui.state_changed(next);
        Ok(())
    }

    pub(crate) fn fail(&self) {
        if self.state.fail() {
            self.ui.state_changed(SessionState::Failed);
        }
    }

    pub(crate) fn players(&self) -> Vec<Peer> {
        self.players
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_players(&self, players: Vec<Peer>) {
        self.update_players(|current| *current = players, |_| ());
    }

    /// Apply `f` to the player list and notify; returns the new list.
    ///
    /// `publish` sees the new list while the write lock is still held, so
    /// concurrent changes are published in the order they were applied.
    pub(crate) fn update_players(
        &self,
        f: impl FnOnce(&mut Vec<Peer>),
        publish: impl FnOnce(&[Peer]),
    ) -> Vec<Peer> {
        let snapshot = {
            let mut players = self.players.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut players);
            publish(players.as_slice());
            players.clone()
        };
        self.ui.players_changed(&snapshot);
        snapshot
    }

    pub(crate) fn game(&self) -> String {
        self.game
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the game; `publish` runs under the write lock
    pub(crate) fn set_game(&self, game: &str, publish: impl FnOnce(&str)) {
        {
            let mut current = self.game.write().unwrap_or_else(PoisonError::into_inner);
            *current = game.to_string();
            publish(game);
        }
        self.ui.game_changed(game);
    }
}

/// A negotiated session.
///
/// Owned by whoever created it. Dropping it stops every background task and
/// releases the listening socket and the traversal registration; `close`
/// does the same and waits for the tasks to finish.
pub struct SessionEndpoint {
    role: Role,
    mode: Mode,
    local_port: u16,
    local_id: PeerId,
    host_code: Option<HostCode>,
    remote: Option<SocketAddr>,
    shared: Arc<Shared>,
    /// Host only: fan-out to every connected peer
    outbound: Option<broadcast::Sender<PeerMessage>>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    lease: Option<TraversalLease>,
}

impl SessionEndpoint {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.subscribe()
    }

    /// Port this side is bound to, OS-assigned when 0 was requested
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Host code issued by the traversal server, hosts in traversal mode only.
    ///
    /// `None` once the registration was lost and the code stopped resolving.
    pub fn host_code(&self) -> Option<&HostCode> {
        match &self.lease {
            Some(lease) if lease.is_lost() => None,
            _ => self.host_code.as_ref(),
        }
    }

    /// Host address, clients only
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Everyone in the session, this side included
    pub fn players(&self) -> Vec<Peer> {
        self.shared.players()
    }

    /// Everyone in the session except this side
    pub fn peers(&self) -> Vec<Peer> {
        let mut players = self.shared.players();
        players.retain(|peer| peer.id != self.local_id);
        players
    }

    pub fn game(&self) -> String {
        self.shared.game()
    }

    /// Select the game for everybody.
    ///
    /// # Errors
    ///
    /// `InvalidParameters` on a client or once the session is no longer connected.
    pub fn change_game(&self, game: &str) -> Result<()> {
        let Some(outbound) = &self.outbound else {
            return Err(SessionError::invalid("only the host can change the game"));
        };
        if self.state() != SessionState::Connected {
            return Err(SessionError::invalid("session is not connected"));
        }

        self.shared.set_game(game, |game| {
            // No receivers just means nobody joined yet
            let _ = outbound.send(PeerMessage::GameChanged {
                game: game.to_string(),
            });
        });
        info!(game, "game changed");
        Ok(())
    }

    /// Snapshot of the traversal registration, hosts in traversal mode only
    pub async fn traversal_session(&self) -> Option<TraversalSession> {
        match &self.lease {
            Some(lease) => Some(lease.session().await),
            None => None,
        }
    }

    /// Leave the session and wait for every background task
    pub async fn close(mut self) {
        if !self.state().is_terminal() && self.shared.advance(SessionState::Closed).is_ok() {
            info!(role = ?self.role, port = self.local_port, "session closed");
        }
        self.token.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        if let Some(lease) = self.lease.take() {
            lease.join().await;
        }
    }
}

impl Drop for SessionEndpoint {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for SessionEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEndpoint")
            .field("role", &self.role)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("local_port", &self.local_port)
            .field("host_code", &self.host_code)
            .field("remote", &self.remote)
            .finish()
    }
}
