/**
 * setup.rs
 *
 * Setup controller: what the NetPlay setup dialog does once the widgets are
 * taken away. Reads and writes the NetPlay section, builds parameters for
 * the host and join actions and keeps at most one session open.
 */

use crate::config::{self, keys, ConfigStore, NetPlaySettings};
use crate::error::{Result, SessionError};
use crate::factory::SessionFactory;
use crate::session::SessionEndpoint;
use tracing::info;

pub const NO_GAME_SELECTED: &str = "You must choose a game!";
pub const ALREADY_OPEN: &str = "A NetPlay window is already open!";
pub const LISTEN_PORT_TAKEN: &str =
    "Failed to listen. Someone is probably already listening on the port you specified.";
pub const SERVER_ALREADY_RUNNING: &str =
    "Failed to listen. Is another instance of the NetPlay server running?";

/// Text to show the user for a failed session attempt.
///
/// `forced_listen_port` is true when a traversal host asked for a specific
/// listen port instead of an ephemeral one.
pub fn failure_message(err: &SessionError, forced_listen_port: bool) -> String {
    match err {
        SessionError::InvalidParameters(message) => message.clone(),
        SessionError::SessionAlreadyOpen => ALREADY_OPEN.to_string(),
        SessionError::BindFailed { .. } | SessionError::TraversalRegistrationFailed(_) => {
            if forced_listen_port {
                LISTEN_PORT_TAKEN.to_string()
            } else {
                SERVER_ALREADY_RUNNING.to_string()
            }
        }
        other => other.to_string(),
    }
}

pub struct NetPlaySetup<S: ConfigStore> {
    store: S,
    settings: NetPlaySettings,
    factory: SessionFactory,
    session: Option<SessionEndpoint>,
}

impl<S: ConfigStore> NetPlaySetup<S> {
    pub fn new(store: S, factory: SessionFactory) -> Self {
        let settings = NetPlaySettings::load(&store);
        Self {
            store,
            settings,
            factory,
            session: None,
        }
    }

    pub fn settings(&self) -> &NetPlaySettings {
        &self.settings
    }

    /// Edit the in-memory settings; nothing is persisted until `save`
    pub fn settings_mut(&mut self) -> &mut NetPlaySettings {
        &mut self.settings
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn session(&self) -> Option<&SessionEndpoint> {
        self.session.as_ref()
    }

    /// "Traversal: host:port" as shown next to the reset button
    pub fn traversal_label(&self) -> String {
        format!(
            "Traversal: {}:{}",
            self.settings.traversal_server, self.settings.traversal_port
        )
    }

    /// User-facing text for an error from `host` or `join`
    pub fn describe_failure(&self, err: &SessionError) -> String {
        failure_message(err, self.settings.forces_listen_port())
    }

    /// A session that already ended does not block a new one
    fn ensure_no_session(&mut self) -> Result<()> {
        if let Some(session) = &self.session {
            if !session.state().is_terminal() {
                return Err(SessionError::SessionAlreadyOpen);
            }
        }
        self.session = None;
        Ok(())
    }

    /// Host `game` with the current settings
    pub async fn host(&mut self, game: &str) -> Result<&SessionEndpoint> {
        self.ensure_no_session()?;

        let game = game.trim();
        if game.is_empty() {
            return Err(SessionError::invalid(NO_GAME_SELECTED));
        }

        let params = self.settings.host_parameters()?.with_game(game);
        let endpoint = self.factory.create(&params).await?;

        self.settings.selected_host_game = game.to_string();
        self.store.set(keys::SELECTED_HOST_GAME, game);
        info!(game, port = endpoint.local_port(), "hosting");

        Ok(self.session.insert(endpoint))
    }

    /// Join with the current settings: address or host code, depending on mode
    pub async fn join(&mut self) -> Result<&SessionEndpoint> {
        self.ensure_no_session()?;

        let params = self.settings.client_parameters()?;
        let endpoint = self.factory.create(&params).await?;
        Ok(self.session.insert(endpoint))
    }

    /// Restore the default traversal server in one store update
    pub fn reset_traversal(&mut self) {
        config::reset_traversal(&mut self.store);
        self.settings.traversal_server = config::traversal_server(&self.store);
        self.settings.traversal_port = config::traversal_port(&self.store);
    }

    /// Persist the dialog fields
    pub fn save(&mut self) {
        self.settings.save(&mut self.store);
    }

    pub async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }

    /// Saves the settings, like closing the dialog does
    pub async fn shutdown(mut self) -> S {
        self.close_session().await;
        self.save();
        self.store
    }
}
