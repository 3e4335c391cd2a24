/**
 * session/host.rs
 *
 * Host side: accept peers, run the hello/welcome handshake, keep the
 * player list and fan out changes
 */

use super::protocol::{Peer, PeerId, PeerMessage, HOST_PEER_ID, PROTOCOL_VERSION};
use super::{SessionEndpoint, Shared};
use crate::params::{validate_nickname, HostCode, Mode, Role};
use crate::port_mapping;
use crate::transport::{self, WireError};
use crate::traversal::TraversalLease;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pending fan-out messages per peer before it counts as lagging
const OUTBOUND_CAPACITY: usize = 64;

/// Pause after a failed accept, e.g. out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a bound host needs to start serving
pub(crate) struct HostSetup {
    pub listener: TcpListener,
    pub local_port: u16,
    pub mode: Mode,
    pub nickname: String,
    /// Selected before the session is announced, may be empty
    pub game: String,
    pub host_code: Option<HostCode>,
    pub lease: Option<TraversalLease>,
    pub handshake_timeout: Duration,
    pub upnp: bool,
}

struct HostRuntime {
    shared: Arc<Shared>,
    outbound: broadcast::Sender<PeerMessage>,
    next_id: AtomicU32,
    handshake_timeout: Duration,
}

impl HostRuntime {
    /// Change the player list and tell every peer, as one step
    fn change_players(&self, f: impl FnOnce(&mut Vec<Peer>)) -> Vec<Peer> {
        self.shared.update_players(f, |players| {
            let _ = self.outbound.send(PeerMessage::PlayerList {
                players: players.to_vec(),
            });
        })
    }
}

/// Start accepting peers and hand back the endpoint
pub(crate) fn start(
    setup: HostSetup,
    shared: Arc<Shared>,
    token: CancellationToken,
) -> SessionEndpoint {
    shared.set_players(vec![Peer {
        id: HOST_PEER_ID,
        nickname: setup.nickname,
    }]);
    if !setup.game.is_empty() {
        shared.set_game(&setup.game, |_| ());
    }

    let (outbound, _) = broadcast::channel(OUTBOUND_CAPACITY);
    let runtime = Arc::new(HostRuntime {
        shared: shared.clone(),
        outbound: outbound.clone(),
        next_id: AtomicU32::new(HOST_PEER_ID.0 + 1),
        handshake_timeout: setup.handshake_timeout,
    });

    let mut tasks = vec![tokio::spawn(accept_loop(
        setup.listener,
        runtime,
        token.clone(),
    ))];
    if setup.upnp {
        tasks.push(tokio::spawn(port_mapping::forward(
            setup.local_port,
            token.clone(),
        )));
    }

    SessionEndpoint {
        role: Role::Host,
        mode: setup.mode,
        local_port: setup.local_port,
        local_id: HOST_PEER_ID,
        host_code: setup.host_code,
        remote: None,
        shared,
        outbound: Some(outbound),
        token,
        tasks,
        lease: setup.lease,
    }
}

async fn accept_loop(listener: TcpListener, runtime: Arc<HostRuntime>, token: CancellationToken) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        let runtime = runtime.clone();
        let token = token.child_token();
        tokio::spawn(async move {
            if let Err(e) = serve_peer(stream, addr, &runtime, token).await {
                debug!(%addr, error = %e, "peer connection ended");
            }
        });
    }
    // Listener dropped here, the port is free again
    debug!("host stopped accepting");
}

async fn serve_peer(
    stream: TcpStream,
    addr: SocketAddr,
    runtime: &HostRuntime,
    token: CancellationToken,
) -> Result<(), WireError> {
    let timeout = runtime.handshake_timeout;
    stream.set_nodelay(true)?;
    let mut ws = tokio::time::timeout(timeout, tokio_tungstenite::accept_async(stream))
        .await
        .map_err(|_| WireError::Timeout(timeout))??;

    let hello: PeerMessage = transport::recv_json_timeout(&mut ws, timeout).await?;
    let nickname = match hello {
        PeerMessage::Hello { version, .. } if version != PROTOCOL_VERSION => {
            let reason = format!(
                "protocol version {} is not supported, host speaks {}",
                version, PROTOCOL_VERSION
            );
            return reject(&mut ws, addr, reason).await;
        }
        PeerMessage::Hello { nickname, .. } => match validate_nickname(&nickname) {
            Ok(nickname) => nickname,
            Err(e) => return reject(&mut ws, addr, e.to_string()).await,
        },
        other => {
            let reason = format!("expected hello, got {}", other.message_type());
            return reject(&mut ws, addr, reason).await;
        }
    };

    let id = PeerId(runtime.next_id.fetch_add(1, Ordering::Relaxed));
    // Subscribe before joining so no later change is missed
    let mut outbound = runtime.outbound.subscribe();
    let players = runtime.change_players(|players| {
        players.push(Peer {
            id,
            nickname: nickname.clone(),
        })
    });
    info!(peer = %id, %nickname, %addr, "player joined");

    let result = run_peer(&mut ws, id, players, &mut outbound, runtime, &token).await;

    runtime.change_players(|players| players.retain(|peer| peer.id != id));
    info!(peer = %id, %nickname, "player left");

    result
}

async fn run_peer(
    ws: &mut WebSocketStream<TcpStream>,
    id: PeerId,
    players: Vec<Peer>,
    outbound: &mut broadcast::Receiver<PeerMessage>,
    runtime: &HostRuntime,
    token: &CancellationToken,
) -> Result<(), WireError> {
    let welcome = PeerMessage::Welcome {
        player_id: id,
        game: runtime.shared.game(),
        players,
    };
    transport::send_json(ws, &welcome).await?;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                let _ = ws.close(None).await;
                return Ok(());
            }
            event = outbound.recv() => match event {
                Ok(msg) => transport::send_json(ws, &msg).await?,
                Err(RecvError::Lagged(skipped)) => {
                    // Resync with a full snapshot instead of the missed deltas
                    warn!(peer = %id, skipped, "peer lagging, resending state");
                    let players = runtime.shared.players();
                    transport::send_json(ws, &PeerMessage::PlayerList { players }).await?;
                    let game = runtime.shared.game();
                    transport::send_json(ws, &PeerMessage::GameChanged { game }).await?;
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            msg = transport::recv_json::<_, PeerMessage>(ws) => match msg {
                Ok(other) => {
                    debug!(peer = %id, kind = other.message_type(), "ignoring peer message")
                }
                Err(WireError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            },
        }
    }
}

async fn reject(
    ws: &mut WebSocketStream<TcpStream>,
    addr: SocketAddr,
    reason: String,
) -> Result<(), WireError> {
    info!(%addr, %reason, "peer rejected");
    transport::send_json(ws, &PeerMessage::Rejected { reason }).await?;
    let _ = ws.close(None).await;
    Ok(())
}
