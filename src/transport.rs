/**
 * transport.rs
 *
 * Socket plumbing shared by sessions and traversal:
 * - listener bind through socket2
 * - bounded TCP connect + optional TLS + WebSocket upgrade
 * - JSON text frames over WebSocket
 */

use futures_util::{SinkExt, StreamExt};
use native_tls::TlsConnector;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

/// Pending connections queued by the kernel before accept
const LISTEN_BACKLOG: i32 = 128;

/// Byte stream a WebSocket can run over, plain or TLS
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Client side WebSocket, transport erased
pub type WsStream = WebSocketStream<Box<dyn Io>>;

/// Wire level failures
#[derive(Debug, Error)]
pub enum WireError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    Closed,
}

/// Transport security for outgoing WebSocket connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    #[default]
    Plain,
    Tls {
        /// Allow self-signed certificates (development servers)
        accept_invalid_certs: bool,
    },
}

/// An established outgoing WebSocket with its socket addresses
pub struct Dialed {
    pub ws: WsStream,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

/// Bind a listening socket on all interfaces, port 0 for an ephemeral port.
///
/// SO_REUSEADDR lets a port be rebound right after a previous listener on it
/// was closed; it does not allow two live listeners on the same port.
pub fn bind_listener(port: u16) -> io::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    #[cfg(unix)]
    socket.set_reuse_address(true)?;

    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    let listener = TcpListener::from_std(socket.into())?;
    debug!(local = %listener.local_addr()?, "listener bound");
    Ok(listener)
}

fn websocket_url(host: &str, port: u16, tls: TlsMode) -> String {
    let scheme = match tls {
        TlsMode::Plain => "ws",
        TlsMode::Tls { .. } => "wss",
    };
    if host.contains(':') {
        format!("{}://[{}]:{}/", scheme, host, port)
    } else {
        format!("{}://{}:{}/", scheme, host, port)
    }
}

/// Connect, secure and upgrade within a single deadline
pub async fn dial(
    host: &str,
    port: u16,
    tls: TlsMode,
    timeout: Duration,
) -> Result<Dialed, WireError> {
    tokio::time::timeout(timeout, dial_inner(host, port, tls))
        .await
        .map_err(|_| WireError::Timeout(timeout))?
}

async fn dial_inner(host: &str, port: u16, tls: TlsMode) -> Result<Dialed, WireError> {
    let url = websocket_url(host, port, tls);

    // Raw TCP connect, resolving the host name
    let tcp = TcpStream::connect((host, port)).await?;
    tcp.set_nodelay(true)?;
    let local_addr = tcp.local_addr()?;
    let peer_addr = tcp.peer_addr()?;
    trace!(%url, %local_addr, %peer_addr, "tcp connected");

    let stream: Box<dyn Io> = match tls {
        TlsMode::Plain => Box::new(tcp),
        TlsMode::Tls { accept_invalid_certs } => {
            let connector = TlsConnector::builder()
                .danger_accept_invalid_certs(accept_invalid_certs)
                .build()
                .map_err(|e| WireError::Tls(e.to_string()))?;
            let connector = tokio_native_tls::TlsConnector::from(connector);
            let tls_stream = connector
                .connect(host, tcp)
                .await
                .map_err(|e| WireError::Tls(e.to_string()))?;
            Box::new(tls_stream)
        }
    };

    let (ws, _response) = tokio_tungstenite::client_async(url, stream).await?;

    Ok(Dialed {
        ws,
        local_addr,
        peer_addr,
    })
}

/// Serialize and send one message as a text frame
pub async fn send_json<S, M>(ws: &mut WebSocketStream<S>, msg: &M) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: Serialize,
{
    let json = serde_json::to_string(msg)?;
    ws.send(Message::Text(json)).await?;
    Ok(())
}

/// Next JSON message, skipping control and binary frames
pub async fn recv_json<S, M>(ws: &mut WebSocketStream<S>) -> Result<M, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: DeserializeOwned,
{
    loop {
        let msg = ws.next().await.ok_or(WireError::Closed)??;

        match msg {
            Message::Text(text) => return Ok(serde_json::from_str(&text)?),
            Message::Ping(data) => ws.send(Message::Pong(data)).await?,
            Message::Close(_) => return Err(WireError::Closed),
            _ => {}
        }
    }
}

/// Like `recv_json` with a deadline
pub async fn recv_json_timeout<S, M>(
    ws: &mut WebSocketStream<S>,
    timeout: Duration,
) -> Result<M, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: DeserializeOwned,
{
    tokio::time::timeout(timeout, recv_json(ws))
        .await
        .map_err(|_| WireError::Timeout(timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Counter {
        n: u32,
    }

    #[test]
    fn urls_bracket_ipv6() {
        assert_eq!(websocket_url("127.0.0.1", 6262, TlsMode::Plain), "ws://127.0.0.1:6262/");
        assert_eq!(websocket_url("::1", 80, TlsMode::Plain), "ws://[::1]:80/");
        assert_eq!(
            websocket_url(
                "stun.dolphin-emu.org",
                6262,
                TlsMode::Tls {
                    accept_invalid_certs: false
                }
            ),
            "wss://stun.dolphin-emu.org:6262/"
        );
    }

    #[tokio::test]
    async fn ephemeral_bind_gets_a_port() {
        let listener = bind_listener(0).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn second_listener_on_a_live_port_fails() {
        let first = bind_listener(0).unwrap();
        let port = first.local_addr().unwrap().port();
        let err = bind_listener(port).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        drop(first);
        assert!(bind_listener(port).is_ok());
    }

    #[tokio::test]
    async fn dial_refused_is_an_io_error() {
        let port = {
            let listener = bind_listener(0).unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = dial("127.0.0.1", port, TlsMode::Plain, Duration::from_secs(2))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WireError::Io(_)), "{err}");
    }

    #[tokio::test]
    async fn dial_times_out_when_handshake_stalls() {
        // Accepts the TCP connection but never speaks WebSocket
        let listener = bind_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let err = dial("127.0.0.1", port, TlsMode::Plain, Duration::from_millis(200))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WireError::Timeout(_)));
    }

    #[tokio::test]
    async fn json_frames_cross_the_socket() {
        let listener = bind_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let counter: Counter = recv_json(&mut ws).await.unwrap();
            send_json(&mut ws, &Counter { n: counter.n + 1 }).await.unwrap();
        });

        let mut dialed = dial("127.0.0.1", port, TlsMode::Plain, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(dialed.peer_addr.port(), port);
        send_json(&mut dialed.ws, &Counter { n: 41 }).await.unwrap();
        let reply: Counter = recv_json_timeout(&mut dialed.ws, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, Counter { n: 42 });
        server.await.unwrap();
    }
}
