/**
 * traversal/client.rs
 *
 * Traversal server client: register a hosted session, resolve host codes,
 * keep a registration alive
 */

use super::protocol::TraversalMessage;
use super::types::TraversalSession;
use crate::error::TraversalError;
use crate::params::{HostCode, TraversalServerAddr};
use crate::transport::{self, TlsMode, WireError, WsStream};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Bound on sending the close frame when a connection is released
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Unanswered keep-alive intervals before the registration is given up
const MISSED_KEEPALIVES: u32 = 3;

fn wire_failure(server: &TraversalServerAddr, err: WireError) -> TraversalError {
    match err {
        WireError::Json(e) => {
            TraversalError::Rejected(format!("malformed reply from {}: {}", server, e))
        }
        other => TraversalError::Unreachable(format!("{}: {}", server, other)),
    }
}

/// One connection to the traversal server.
///
/// Requests take `&mut self`, so calls on a connection are serialized.
pub struct TraversalClient {
    ws: WsStream,
    session: TraversalSession,
    timeout: Duration,
}

impl TraversalClient {
    /// Connect to the traversal server, single attempt
    pub async fn connect(
        server: &TraversalServerAddr,
        tls: TlsMode,
        timeout: Duration,
    ) -> Result<Self, TraversalError> {
        let dialed = transport::dial(&server.host, server.port, tls, timeout)
            .await
            .map_err(|e| wire_failure(server, e))?;

        debug!(%server, local = %dialed.local_addr, "connected to traversal server");

        Ok(Self {
            ws: dialed.ws,
            session: TraversalSession::new(server.clone()),
            timeout,
        })
    }

    pub fn session(&self) -> &TraversalSession {
        &self.session
    }

    async fn request(
        &mut self,
        msg: &TraversalMessage,
    ) -> Result<TraversalMessage, TraversalError> {
        let server = self.session.server.clone();

        transport::send_json(&mut self.ws, msg)
            .await
            .map_err(|e| wire_failure(&server, e))?;

        loop {
            let reply: TraversalMessage = transport::recv_json_timeout(&mut self.ws, self.timeout)
                .await
                .map_err(|e| wire_failure(&server, e))?;
            self.session.touch();

            match reply {
                // Unsolicited traffic, not an answer
                TraversalMessage::Keepalive | TraversalMessage::PeerIncoming { .. } => continue,
                other => return Ok(other),
            }
        }
    }

    /// Ask for a host code bound to our listening port
    pub async fn register(
        &mut self,
        listen_port: u16,
    ) -> Result<(HostCode, SocketAddr), TraversalError> {
        let reply = self
            .request(&TraversalMessage::Register { listen_port })
            .await?;

        match reply {
            TraversalMessage::Registered {
                host_code,
                public_addr,
            } => {
                self.session.local_host_code = Some(host_code.clone());
                self.session.resolved_endpoint = Some(public_addr);
                Ok((host_code, public_addr))
            }
            TraversalMessage::Error { message } => Err(TraversalError::Rejected(message)),
            other => Err(TraversalError::Rejected(format!(
                "unexpected {} reply to register",
                other.message_type()
            ))),
        }
    }

    /// Translate a host code into the host's address
    pub async fn resolve(&mut self, code: &HostCode) -> Result<SocketAddr, TraversalError> {
        self.session.target_host_code = Some(code.clone());

        let reply = self
            .request(&TraversalMessage::Resolve {
                host_code: code.to_string(),
            })
            .await?;

        match reply {
            TraversalMessage::Resolved { host_code, addr } if host_code == *code => {
                self.session.resolved_endpoint = Some(addr);
                Ok(addr)
            }
            TraversalMessage::NotFound { .. } => {
                Err(TraversalError::HostCodeNotFound(code.to_string()))
            }
            TraversalMessage::Error { message } => Err(TraversalError::Rejected(message)),
            other => Err(TraversalError::Rejected(format!(
                "unexpected {} reply to resolve",
                other.message_type()
            ))),
        }
    }

    pub async fn close(mut self) {
        let _ = tokio::time::timeout(CLOSE_GRACE, self.ws.close(None)).await;
    }

    /// Keep this registration alive in the background until `token` fires.
    ///
    /// `on_lost` runs once if the server goes away first; it does not run
    /// when the lease is released through `token`.
    pub fn into_lease(
        self,
        keepalive: Duration,
        token: CancellationToken,
        on_lost: impl FnOnce() + Send + 'static,
    ) -> TraversalLease {
        let session = Arc::new(Mutex::new(self.session));
        let lost = Arc::new(AtomicBool::new(false));

        let task = {
            let session = session.clone();
            let lost = lost.clone();
            tokio::spawn(async move {
                if !run_lease(self.ws, session, keepalive, token).await {
                    lost.store(true, Ordering::Release);
                    on_lost();
                }
            })
        };
        TraversalLease {
            session,
            lost,
            task,
        }
    }
}

/// Registration held open by a background task.
///
/// The server forgets the host code once this connection goes away.
pub struct TraversalLease {
    session: Arc<Mutex<TraversalSession>>,
    lost: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TraversalLease {
    pub async fn session(&self) -> TraversalSession {
        self.session.lock().await.clone()
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// The server stopped answering before the lease was released
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Wait for the lease task after its token was cancelled
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Returns true when released through `token`, false when the server was lost
async fn run_lease(
    mut ws: WsStream,
    session: Arc<Mutex<TraversalSession>>,
    keepalive: Duration,
    token: CancellationToken,
) -> bool {
    let mut ticker = tokio::time::interval(keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                let _ = tokio::time::timeout(CLOSE_GRACE, ws.close(None)).await;
                debug!("traversal registration released");
                return true;
            }
            _ = ticker.tick() => {
                let silence = session.lock().await.since_last_contact();
                if silence > keepalive * MISSED_KEEPALIVES {
                    warn!(?silence, "traversal server stopped answering keep-alives");
                    return false;
                }
                if let Err(e) = transport::send_json(&mut ws, &TraversalMessage::Keepalive).await {
                    warn!(error = %e, "traversal keepalive failed");
                    return false;
                }
            }
            msg = transport::recv_json::<_, TraversalMessage>(&mut ws) => {
                match msg {
                    Ok(msg) => {
                        session.lock().await.touch();
                        match msg {
                            TraversalMessage::PeerIncoming { addr } => {
                                info!(%addr, "peer resolved our host code");
                            }
                            TraversalMessage::Keepalive => trace!("traversal keepalive"),
                            other => {
                                debug!(kind = other.message_type(), "ignoring traversal message")
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "lost traversal server, host code no longer resolvable");
                        return false;
                    }
                }
            }
        }
    }
}

/// Entry point used by the session factory
#[derive(Debug, Clone)]
pub struct TraversalRendezvous {
    server: TraversalServerAddr,
    tls: TlsMode,
    timeout: Duration,
}

impl TraversalRendezvous {
    pub fn new(server: TraversalServerAddr, tls: TlsMode, timeout: Duration) -> Self {
        Self {
            server,
            tls,
            timeout,
        }
    }

    pub fn server(&self) -> &TraversalServerAddr {
        &self.server
    }

    /// Obtain a host code for `local_port`.
    ///
    /// The returned client carries the registration; drop or close it to
    /// give the code up.
    pub async fn register(
        &self,
        local_port: u16,
    ) -> Result<(HostCode, TraversalClient), TraversalError> {
        let mut client = TraversalClient::connect(&self.server, self.tls, self.timeout).await?;
        let (code, public_addr) = client.register(local_port).await?;
        info!(
            host_code = %code,
            %public_addr,
            server = %self.server,
            "registered with traversal server"
        );
        Ok((code, client))
    }

    /// Look up a host code, one connection per call
    pub async fn resolve(&self, code: &HostCode) -> Result<SocketAddr, TraversalError> {
        let mut client = TraversalClient::connect(&self.server, self.tls, self.timeout).await?;
        let result = client.resolve(code).await;
        client.close().await;

        let addr = result?;
        info!(host_code = %code, %addr, "host code resolved");
        Ok(addr)
    }
}
