/**
 * session/client.rs
 *
 * Client side: greet the host, then follow its player list and game
 */

use super::protocol::{Peer, PeerId, PeerMessage, PROTOCOL_VERSION};
use super::{SessionEndpoint, SessionState, Shared};
use crate::error::{Result, SessionError};
use crate::params::{Mode, Role};
use crate::transport::{self, Dialed, WireError, WsStream};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// What the host told us when it let us in
#[derive(Debug)]
pub(crate) struct Welcome {
    pub player_id: PeerId,
    pub game: String,
    pub players: Vec<Peer>,
}

/// Send hello and wait for the host's verdict.
///
/// A refusal or a silent host is a `ConnectFailed` against `target`.
pub(crate) async fn handshake(
    ws: &mut WsStream,
    target: &str,
    nickname: &str,
    timeout: Duration,
) -> Result<Welcome> {
    let hello = PeerMessage::Hello {
        nickname: nickname.to_string(),
        version: PROTOCOL_VERSION,
    };
    transport::send_json(ws, &hello)
        .await
        .map_err(|e| SessionError::connect_failed(target, e))?;

    let reply: PeerMessage = transport::recv_json_timeout(ws, timeout)
        .await
        .map_err(|e| SessionError::connect_failed(target, format!("no welcome from host: {}", e)))?;

    match reply {
        PeerMessage::Welcome {
            player_id,
            game,
            players,
        } => Ok(Welcome {
            player_id,
            game,
            players,
        }),
        PeerMessage::Rejected { reason } => Err(SessionError::connect_failed(
            target,
            format!("rejected by host: {}", reason),
        )),
        other => Err(SessionError::connect_failed(
            target,
            format!("unexpected {} during handshake", other.message_type()),
        )),
    }
}

/// Adopt the host's view and keep following it in the background
pub(crate) fn start(
    dialed: Dialed,
    mode: Mode,
    welcome: Welcome,
    shared: Arc<Shared>,
    token: CancellationToken,
) -> SessionEndpoint {
    let Dialed {
        ws,
        local_addr,
        peer_addr,
    } = dialed;

    shared.set_players(welcome.players);
    shared.set_game(&welcome.game, |_| ());

    let task = tokio::spawn(follow_host(ws, shared.clone(), token.clone()));

    SessionEndpoint {
        role: Role::Client,
        mode,
        local_port: local_addr.port(),
        local_id: welcome.player_id,
        host_code: None,
        remote: Some(peer_addr),
        shared,
        outbound: None,
        token,
        tasks: vec![task],
        lease: None,
    }
}

async fn follow_host(mut ws: WsStream, shared: Arc<Shared>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                let _ = tokio::time::timeout(CLOSE_GRACE, ws.close(None)).await;
                break;
            }
            msg = transport::recv_json::<_, PeerMessage>(&mut ws) => match msg {
                Ok(PeerMessage::PlayerList { players }) => shared.set_players(players),
                Ok(PeerMessage::GameChanged { game }) => {
                    info!(%game, "host changed the game");
                    shared.set_game(&game, |_| ());
                }
                Ok(other) => debug!(kind = other.message_type(), "ignoring host message"),
                Err(WireError::Json(e)) => warn!(error = %e, "malformed message from host"),
                Err(e) => {
                    warn!(error = %e, "connection to host lost");
                    shared.ui().connection_lost();
                    let _ = shared.advance(SessionState::Closed);
                    break;
                }
            },
        }
    }
}
