/**
 * factory.rs
 *
 * Session factory: turns connection parameters into a connected endpoint
 * - host: bind, optionally register a host code, start accepting
 * - client: optionally resolve a host code, connect, handshake
 */

use crate::error::{Result, SessionError};
use crate::params::{
    ConnectPlan, ConnectionParameters, Mode, TraversalServerAddr, ValidatedParameters,
};
use crate::session::{self, HostSetup, SessionEndpoint, SessionState, Shared};
use crate::transport::{self, TlsMode};
use crate::traversal::TraversalRendezvous;
use crate::ui::NetPlayUi;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Timeouts and transport choices for session attempts
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// TCP connect plus WebSocket upgrade towards a host
    pub connect_timeout: Duration,
    /// Each round trip with the traversal server
    pub traversal_timeout: Duration,
    /// Hello/welcome exchange, both directions
    pub handshake_timeout: Duration,
    /// Interval between keep-alives on a host's traversal registration
    pub keepalive_interval: Duration,
    pub traversal_tls: TlsMode,
    /// Hosts: forward the listening port through UPnP, best effort
    pub upnp: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            traversal_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(15),
            traversal_tls: TlsMode::Plain,
            upnp: false,
        }
    }
}

/// Creates sessions. Holds only read-only configuration, so clones are cheap
/// and concurrent attempts do not interfere.
#[derive(Clone)]
pub struct SessionFactory {
    options: SessionOptions,
    ui: Arc<dyn NetPlayUi>,
}

/// Only a concurrent terminal transition can refuse a forward step, and
/// that only happens when the attempt is being torn down.
fn step(shared: &Shared, next: SessionState) -> Result<()> {
    shared.advance(next).map_err(|_| SessionError::Cancelled)
}

impl SessionFactory {
    pub fn new(ui: Arc<dyn NetPlayUi>) -> Self {
        Self::with_options(ui, SessionOptions::default())
    }

    pub fn with_options(ui: Arc<dyn NetPlayUi>, options: SessionOptions) -> Self {
        Self { options, ui }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Negotiate a session and wait for the outcome.
    ///
    /// The UI hears `session_established` before this returns `Ok`, and
    /// `session_failed` before it returns `Err`.
    pub async fn create(&self, params: &ConnectionParameters) -> Result<SessionEndpoint> {
        let shared = Shared::new(params.role, params.mode, self.ui.clone());
        self.run(params, shared, CancellationToken::new()).await
    }

    /// Negotiate a session on a background task
    pub fn spawn(&self, params: ConnectionParameters) -> PendingSession {
        let shared = Shared::new(params.role, params.mode, self.ui.clone());
        let progress = shared.subscribe();
        let token = CancellationToken::new();

        let factory = self.clone();
        let attempt = token.clone();
        let task = tokio::spawn(async move { factory.run(&params, shared, attempt).await });

        PendingSession {
            progress,
            token,
            task,
        }
    }

    async fn run(
        &self,
        params: &ConnectionParameters,
        shared: Arc<Shared>,
        token: CancellationToken,
    ) -> Result<SessionEndpoint> {
        // Outlives the attempt when it succeeds, owned by the endpoint then
        let session_token = token.child_token();

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SessionError::Cancelled),
            result = self.establish(params, &shared, &session_token) => result,
        };

        match &result {
            Ok(endpoint) => self.ui.session_established(endpoint),
            Err(SessionError::Cancelled) => {
                session_token.cancel();
                shared.fail();
                info!(role = ?params.role, "session attempt cancelled");
            }
            Err(e) => {
                session_token.cancel();
                shared.fail();
                warn!(
                    role = ?params.role,
                    mode = ?params.mode,
                    error = %e,
                    "session attempt failed"
                );
                self.ui.session_failed(e);
            }
        }
        result
    }

    async fn establish(
        &self,
        params: &ConnectionParameters,
        shared: &Arc<Shared>,
        token: &CancellationToken,
    ) -> Result<SessionEndpoint> {
        let ValidatedParameters { nickname, plan } = params.validate()?;

        match plan {
            ConnectPlan::HostDirect { port } => {
                self.host(nickname, &params.game, port, None, shared, token)
                    .await
            }
            ConnectPlan::HostTraversal {
                listen_port,
                server,
            } => {
                self.host(nickname, &params.game, listen_port, Some(server), shared, token)
                    .await
            }
            ConnectPlan::JoinDirect { address, port } => {
                let target = format!("{}:{}", address, port);
                step(shared, SessionState::Connecting)?;
                self.join(nickname, Mode::Direct, &address, port, &target, shared, token)
                    .await
            }
            ConnectPlan::JoinTraversal { host_code, server } => {
                step(shared, SessionState::Resolving)?;
                let addr = self.rendezvous(server).resolve(&host_code).await?;

                step(shared, SessionState::Connecting)?;
                let host = addr.ip().to_string();
                let target = addr.to_string();
                self.join(nickname, Mode::Traversal, &host, addr.port(), &target, shared, token)
                    .await
            }
        }
    }

    fn rendezvous(&self, server: TraversalServerAddr) -> TraversalRendezvous {
        TraversalRendezvous::new(server, self.options.traversal_tls, self.options.traversal_timeout)
    }

    async fn host(
        &self,
        nickname: String,
        game: &str,
        port: u16,
        server: Option<TraversalServerAddr>,
        shared: &Arc<Shared>,
        token: &CancellationToken,
    ) -> Result<SessionEndpoint> {
        // Step 1: Bind the listening socket
        let listener = transport::bind_listener(port)
            .map_err(|source| SessionError::BindFailed { port, source })?;
        let local_port = listener
            .local_addr()
            .map_err(|source| SessionError::BindFailed { port, source })?
            .port();
        info!(port = local_port, "listening for players");
        step(shared, SessionState::Listening)?;

        // Step 2: Obtain a host code when behind traversal
        let mode = if server.is_some() { Mode::Traversal } else { Mode::Direct };
        let (host_code, lease) = match server {
            Some(server) => match self.rendezvous(server).register(local_port).await {
                Ok((code, client)) => {
                    let notify = shared.clone();
                    let lease = client.into_lease(
                        self.options.keepalive_interval,
                        token.clone(),
                        move || notify.ui().traversal_lost(),
                    );
                    (Some(code), Some(lease))
                }
                Err(e) => {
                    // Nobody can reach this listener without a code
                    drop(listener);
                    return Err(SessionError::TraversalRegistrationFailed(e));
                }
            },
            None => (None, None),
        };
        step(shared, SessionState::Bound)?;

        // Step 3: Open the doors
        step(shared, SessionState::Connected)?;
        let setup = HostSetup {
            listener,
            local_port,
            mode,
            nickname,
            game: game.trim().to_string(),
            host_code,
            lease,
            handshake_timeout: self.options.handshake_timeout,
            upnp: self.options.upnp,
        };
        Ok(session::start_host(setup, shared.clone(), token.clone()))
    }

    #[allow(clippy::too_many_arguments)]
    async fn join(
        &self,
        nickname: String,
        mode: Mode,
        host: &str,
        port: u16,
        target: &str,
        shared: &Arc<Shared>,
        token: &CancellationToken,
    ) -> Result<SessionEndpoint> {
        // Step 1: Reach the host, single attempt
        let mut dialed = transport::dial(host, port, TlsMode::Plain, self.options.connect_timeout)
            .await
            .map_err(|e| SessionError::connect_failed(target, e))?;

        // Step 2: Introduce ourselves
        let timeout = self.options.handshake_timeout;
        let welcome = session::handshake(&mut dialed.ws, target, &nickname, timeout).await?;
        info!(%target, player = %welcome.player_id, "joined session");

        step(shared, SessionState::Connected)?;
        Ok(session::start_client(dialed, mode, welcome, shared.clone(), token.clone()))
    }
}

/// A session attempt running on a background task.
///
/// Dropping the handle detaches the attempt; an endpoint it produces is
/// then dropped, and so closed, as soon as it completes.
pub struct PendingSession {
    progress: watch::Receiver<SessionState>,
    token: CancellationToken,
    task: JoinHandle<Result<SessionEndpoint>>,
}

impl PendingSession {
    /// Watch the attempt's state as it moves through the machine
    pub fn progress(&self) -> watch::Receiver<SessionState> {
        self.progress.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.progress.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<SessionEndpoint> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(SessionError::Cancelled),
        }
    }

    /// Stop the attempt.
    ///
    /// Returns once the attempt task is gone and everything it held (bound
    /// listener, traversal connection) has been released. An endpoint that
    /// completed before the cancellation landed is closed.
    pub async fn cancel(self) {
        self.token.cancel();
        if let Ok(Ok(endpoint)) = self.task.await {
            endpoint.close().await;
        }
    }
}
