/**
 * traversal/server.rs
 *
 * Traversal server: hands out host codes and resolves them for clients
 */

use super::protocol::TraversalMessage;
use crate::params::HostCode;
use crate::transport::{self, WireError};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause after a failed accept, e.g. out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Traversal server configuration
#[derive(Debug, Clone)]
pub struct TraversalServerConfig {
    /// Maximum number of hosts registered at once
    pub max_hosts: usize,
    /// Deadline for the WebSocket upgrade
    pub handshake_timeout: Duration,
    /// Connections silent for longer than this are dropped
    pub idle_timeout: Duration,
}

impl Default for TraversalServerConfig {
    fn default() -> Self {
        Self {
            max_hosts: 4096,
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// A registered host
#[derive(Debug)]
struct HostEntry {
    addr: SocketAddr,
    /// Outbound channel to the host's connection
    notify: mpsc::UnboundedSender<TraversalMessage>,
}

type Registry = Arc<RwLock<HashMap<HostCode, HostEntry>>>;

pub struct TraversalServer {
    listener: TcpListener,
    registry: Registry,
    config: TraversalServerConfig,
}

impl TraversalServer {
    /// Bind the server
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, config: TraversalServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(local = %listener.local_addr()?, "traversal server listening");

        Ok(Self {
            listener,
            registry: Arc::new(RwLock::new(HashMap::new())),
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `token` fires
    pub async fn run(self, token: CancellationToken) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "traversal accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let registry = self.registry.clone();
            let config = self.config.clone();
            let token = token.child_token();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, registry, config, token).await {
                    debug!(%peer, error = %e, "traversal connection ended");
                }
            });
        }
        info!("traversal server stopped");
    }

    /// Run on a background task
    pub fn spawn(self) -> io::Result<TraversalServerHandle> {
        let addr = self.local_addr()?;
        let registry = self.registry.clone();
        let token = CancellationToken::new();
        let task = tokio::spawn(self.run(token.clone()));

        Ok(TraversalServerHandle {
            addr,
            registry,
            token,
            task,
        })
    }
}

/// Handle to a spawned traversal server
pub struct TraversalServerHandle {
    addr: SocketAddr,
    registry: Registry,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl TraversalServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of host codes currently resolvable
    pub async fn registered_hosts(&self) -> usize {
        self.registry.read().await.len()
    }

    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Registry,
    config: TraversalServerConfig,
    token: CancellationToken,
) -> Result<(), WireError> {
    let upgrade = tokio_tungstenite::accept_async(stream);
    let mut ws = tokio::time::timeout(config.handshake_timeout, upgrade)
        .await
        .map_err(|_| WireError::Timeout(config.handshake_timeout))??;

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    let mut own_code: Option<HostCode> = None;
    let idle = config.idle_timeout;

    let result = loop {
        tokio::select! {
            _ = token.cancelled() => {
                let _ = ws.close(None).await;
                break Ok(());
            }
            Some(outbound) = notify_rx.recv() => {
                if let Err(e) = transport::send_json(&mut ws, &outbound).await {
                    break Err(e);
                }
            }
            msg = transport::recv_json_timeout::<_, TraversalMessage>(&mut ws, idle) => {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(WireError::Json(e)) => {
                        let message = format!("malformed request: {}", e);
                        let reply = TraversalMessage::Error { message };
                        if let Err(e) = transport::send_json(&mut ws, &reply).await {
                            break Err(e);
                        }
                        continue;
                    }
                    Err(WireError::Closed) => break Ok(()),
                    Err(e) => break Err(e),
                };

                let reply = match msg {
                    TraversalMessage::Register { listen_port } => {
                        let own = &mut own_code;
                        register(&registry, &config, peer, listen_port, own, &notify_tx).await
                    }
                    TraversalMessage::Resolve { host_code } => {
                        resolve(&registry, peer, host_code).await
                    }
                    TraversalMessage::Keepalive => TraversalMessage::Keepalive,
                    other => TraversalMessage::Error {
                        message: format!("unexpected {} request", other.message_type()),
                    },
                };

                if let Err(e) = transport::send_json(&mut ws, &reply).await {
                    break Err(e);
                }
            }
        }
    };

    if let Some(code) = own_code {
        registry.write().await.remove(&code);
        info!(host_code = %code, %peer, "host unregistered");
    }

    result
}

async fn register(
    registry: &Registry,
    config: &TraversalServerConfig,
    peer: SocketAddr,
    listen_port: u16,
    own_code: &mut Option<HostCode>,
    notify: &mpsc::UnboundedSender<TraversalMessage>,
) -> TraversalMessage {
    if own_code.is_some() {
        return TraversalMessage::Error {
            message: "already registered on this connection".into(),
        };
    }
    if listen_port == 0 {
        return TraversalMessage::Error {
            message: "invalid listen port 0".into(),
        };
    }

    let mut hosts = registry.write().await;
    if hosts.len() >= config.max_hosts {
        warn!(%peer, "traversal server full, registration refused");
        return TraversalMessage::Error {
            message: "server full".into(),
        };
    }

    let code = loop {
        let candidate = HostCode::generate();
        if !hosts.contains_key(&candidate) {
            break candidate;
        }
    };
    let public_addr = SocketAddr::new(peer.ip(), listen_port);

    hosts.insert(
        code.clone(),
        HostEntry {
            addr: public_addr,
            notify: notify.clone(),
        },
    );
    *own_code = Some(code.clone());
    info!(host_code = %code, %public_addr, "host registered");

    TraversalMessage::Registered {
        host_code: code,
        public_addr,
    }
}

async fn resolve(registry: &Registry, peer: SocketAddr, host_code: String) -> TraversalMessage {
    let Ok(code) = HostCode::parse(&host_code) else {
        return TraversalMessage::NotFound { host_code };
    };

    let hosts = registry.read().await;
    match hosts.get(&code) {
        Some(entry) => {
            let _ = entry.notify.send(TraversalMessage::PeerIncoming { addr: peer });
            debug!(host_code = %code, client = %peer, "host code resolved");
            TraversalMessage::Resolved {
                host_code: code,
                addr: entry.addr,
            }
        }
        None => {
            debug!(host_code = %code, client = %peer, "unknown host code");
            TraversalMessage::NotFound { host_code }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TraversalError;
    use crate::params::TraversalServerAddr;
    use crate::traversal::{TraversalClient, TraversalRendezvous};
    use crate::transport::TlsMode;

    const TIMEOUT: Duration = Duration::from_secs(2);

    async fn start(config: TraversalServerConfig) -> (TraversalServerHandle, TraversalServerAddr) {
        let server = TraversalServer::bind("127.0.0.1:0".parse().unwrap(), config)
            .await
            .unwrap();
        let handle = server.spawn().unwrap();
        let addr = TraversalServerAddr {
            host: "127.0.0.1".into(),
            port: handle.local_addr().port(),
        };
        (handle, addr)
    }

    #[tokio::test]
    async fn register_then_resolve() {
        let (handle, addr) = start(TraversalServerConfig::default()).await;
        let rendezvous = TraversalRendezvous::new(addr, TlsMode::Plain, TIMEOUT);

        let (code, client) = rendezvous.register(4321).await.unwrap();
        assert_eq!(client.session().local_host_code.as_ref(), Some(&code));
        assert_eq!(handle.registered_hosts().await, 1);

        let resolved = rendezvous.resolve(&code).await.unwrap();
        assert_eq!(resolved, "127.0.0.1:4321".parse().unwrap());

        client.close().await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_code_is_not_found() {
        let (handle, addr) = start(TraversalServerConfig::default()).await;
        let rendezvous = TraversalRendezvous::new(addr, TlsMode::Plain, TIMEOUT);

        let code = HostCode::parse("00000000").unwrap();
        let err = rendezvous.resolve(&code).await.unwrap_err();
        assert!(matches!(err, TraversalError::HostCodeNotFound(ref c) if c == "00000000"));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn code_dies_with_its_connection() {
        let (handle, addr) = start(TraversalServerConfig::default()).await;
        let rendezvous = TraversalRendezvous::new(addr, TlsMode::Plain, TIMEOUT);

        let (code, client) = rendezvous.register(4000).await.unwrap();
        client.close().await;

        // Unregistration happens on the server's connection task
        let mut gone = false;
        for _ in 0..50 {
            if handle.registered_hosts().await == 0 {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone);
        assert!(matches!(
            rendezvous.resolve(&code).await,
            Err(TraversalError::HostCodeNotFound(_))
        ));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn port_zero_and_capacity_are_rejected() {
        let config = TraversalServerConfig {
            max_hosts: 1,
            ..Default::default()
        };
        let (handle, addr) = start(config).await;

        let mut client = TraversalClient::connect(&addr, TlsMode::Plain, TIMEOUT).await.unwrap();
        assert!(matches!(client.register(0).await, Err(TraversalError::Rejected(_))));
        client.register(5000).await.unwrap();
        assert!(matches!(client.register(5001).await, Err(TraversalError::Rejected(_))));

        let mut second = TraversalClient::connect(&addr, TlsMode::Plain, TIMEOUT).await.unwrap();
        match second.register(5002).await {
            Err(TraversalError::Rejected(message)) => assert_eq!(message, "server full"),
            other => panic!("expected rejection, got {other:?}"),
        }

        client.close().await;
        second.close().await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn lease_keeps_contact_fresh() {
        let (handle, addr) = start(TraversalServerConfig::default()).await;
        let rendezvous = TraversalRendezvous::new(addr, TlsMode::Plain, TIMEOUT);

        let (code, client) = rendezvous.register(4100).await.unwrap();
        let token = CancellationToken::new();
        let lease = client.into_lease(Duration::from_millis(50), token.clone(), || {});
        let before = lease.session().await.last_contact;

        rendezvous.resolve(&code).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let session = lease.session().await;
        assert!(session.last_contact > before);
        assert!(lease.is_active());

        token.cancel();
        lease.join().await;
        handle.shutdown().await;
    }
}
