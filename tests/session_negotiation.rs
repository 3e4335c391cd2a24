/**
 * tests/session_negotiation.rs
 *
 * End-to-end session negotiation over loopback
 */

use netplay::session::{PeerMessage, SessionState, PROTOCOL_VERSION};
use netplay::transport::{self, TlsMode};
use netplay::traversal::{
    TraversalMessage, TraversalRendezvous, TraversalServer, TraversalServerConfig,
    TraversalServerHandle,
};
use netplay::ui::{ChannelUi, LogUi, UiEvent};
use netplay::{
    ConnectionParameters, MemoryConfig, NetPlaySetup, Role, SessionError, SessionFactory,
    SessionOptions, TraversalServerAddr,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_test::{assert_err, assert_ok};

fn factory() -> SessionFactory {
    let options = SessionOptions {
        connect_timeout: Duration::from_secs(2),
        traversal_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    SessionFactory::with_options(Arc::new(LogUi), options)
}

async fn traversal_server() -> (TraversalServerHandle, TraversalServerAddr) {
    let bind = "127.0.0.1:0".parse().unwrap();
    let server = TraversalServer::bind(bind, TraversalServerConfig::default())
        .await
        .unwrap();
    let handle = server.spawn().unwrap();
    let addr = TraversalServerAddr {
        host: "127.0.0.1".into(),
        port: handle.local_addr().port(),
    };
    (handle, addr)
}

/// A port nothing is listening on right now
fn free_port() -> u16 {
    let listener = transport::bind_listener(0).unwrap();
    listener.local_addr().unwrap().port()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn direct_client_reaches_a_live_host() {
    let factory = factory();
    let host = assert_ok!(factory.create(&ConnectionParameters::host_direct("Host", 0)).await);
    host.change_game("Mario Party 4").unwrap();

    let params = ConnectionParameters::join_direct("Guest", "127.0.0.1", host.local_port());
    let client = assert_ok!(factory.create(&params).await);

    assert_eq!(client.state(), SessionState::Connected);
    assert_eq!(client.role(), Role::Client);
    assert_eq!(client.remote_addr().map(|a| a.port()), Some(host.local_port()));
    assert_eq!(client.game(), "Mario Party 4");

    let peers = client.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].nickname, "Host");

    assert!(eventually(|| host.peers().len() == 1).await);
    assert_eq!(host.peers()[0].nickname, "Guest");

    client.close().await;
    assert!(eventually(|| host.peers().is_empty()).await);
    host.close().await;
}

#[tokio::test]
async fn host_events_arrive_in_order() {
    let (ui, mut events) = ChannelUi::new();
    let factory = SessionFactory::new(Arc::new(ui));
    let host = assert_ok!(factory.create(&ConnectionParameters::host_direct("Host", 0)).await);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen.len(), 5, "{seen:?}");
    assert_eq!(seen[0], UiEvent::State(SessionState::Listening));
    assert_eq!(seen[1], UiEvent::State(SessionState::Bound));
    assert_eq!(seen[2], UiEvent::State(SessionState::Connected));
    assert!(matches!(&seen[3], UiEvent::Players(players) if players.len() == 1));
    assert_eq!(
        seen[4],
        UiEvent::Established {
            role: Role::Host,
            local_port: host.local_port(),
            host_code: None,
            game: String::new(),
        }
    );
    host.close().await;
}

#[tokio::test]
async fn traversal_host_on_ephemeral_port_gets_a_code() {
    let (server, addr) = traversal_server().await;
    let factory = factory();

    let params = ConnectionParameters::host_traversal("Host", 0, &addr);
    let host = assert_ok!(factory.create(&params).await);
    assert_ne!(host.local_port(), 0);
    let code = host.host_code().cloned().unwrap();
    assert!(!code.as_str().is_empty());
    assert_eq!(server.registered_hosts().await, 1);

    let session = host.traversal_session().await.unwrap();
    assert_eq!(session.local_host_code.as_ref(), Some(&code));
    assert_eq!(session.resolved_endpoint.map(|a| a.port()), Some(host.local_port()));

    // Closing the host gives the code back
    host.close().await;
    let mut released = false;
    for _ in 0..50 {
        if server.registered_hosts().await == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released);
    server.shutdown().await;
}

#[tokio::test]
async fn client_joins_by_host_code() {
    let (server, addr) = traversal_server().await;
    let factory = factory();

    let params = ConnectionParameters::host_traversal("Host", 0, &addr);
    let host = assert_ok!(factory.create(&params).await);
    let code = host.host_code().cloned().unwrap();

    let (ui, mut events) = ChannelUi::new();
    let joiner = SessionFactory::with_options(Arc::new(ui), factory.options().clone());
    let client = assert_ok!(
        joiner
            .create(&ConnectionParameters::join_traversal("Guest", code.as_str(), &addr))
            .await
    );
    assert_eq!(client.remote_addr().map(|a| a.port()), Some(host.local_port()));

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let UiEvent::State(state) = event {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        [SessionState::Resolving, SessionState::Connecting, SessionState::Connected]
    );

    host.change_game("Kirby Air Ride").unwrap();
    assert!(eventually(|| client.game() == "Kirby Air Ride").await);
    assert!(matches!(
        client.change_game("Pikmin"),
        Err(SessionError::InvalidParameters(_))
    ));

    // Host leaving ends the client's session
    host.close().await;
    assert!(eventually(|| client.state() == SessionState::Closed).await);
    let mut lost = false;
    while let Ok(event) = events.try_recv() {
        lost |= event == UiEvent::ConnectionLost;
    }
    assert!(lost);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn unknown_code_is_host_code_not_found() {
    let (server, addr) = traversal_server().await;
    let params = ConnectionParameters::join_traversal("Guest", "00000000", &addr);

    let err = assert_err!(factory().create(&params).await);
    assert!(
        matches!(err, SessionError::HostCodeNotFound(ref code) if code == "00000000"),
        "{err}"
    );
    server.shutdown().await;
}

#[tokio::test]
async fn dead_traversal_server_is_reported_per_role() {
    let dead = TraversalServerAddr {
        host: "127.0.0.1".into(),
        port: free_port(),
    };
    let factory = factory();

    let err = assert_err!(
        factory
            .create(&ConnectionParameters::join_traversal("Guest", "1a2b3c4d", &dead))
            .await
    );
    assert!(matches!(err, SessionError::TraversalUnreachable(_)), "{err}");

    // The host's listener is released before the error comes back
    let listen_port = free_port();
    let err = assert_err!(
        factory
            .create(&ConnectionParameters::host_traversal("Host", listen_port, &dead))
            .await
    );
    assert!(matches!(err, SessionError::TraversalRegistrationFailed(_)), "{err}");
    assert_ok!(transport::bind_listener(listen_port));
}

#[tokio::test]
async fn resolved_host_that_is_not_listening_is_connect_failed() {
    let (server, addr) = traversal_server().await;
    let rendezvous = TraversalRendezvous::new(addr.clone(), TlsMode::Plain, Duration::from_secs(2));

    // A registration pointing at a port nobody listens on
    let (code, registration) = rendezvous.register(free_port()).await.unwrap();

    let params = ConnectionParameters::join_traversal("Guest", code.as_str(), &addr);
    let err = assert_err!(factory().create(&params).await);
    assert!(matches!(err, SessionError::ConnectFailed { .. }), "{err}");

    registration.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn traversal_server_refusal_reaches_the_client() {
    // Answers every request with an error
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = TraversalServerAddr {
        host: "127.0.0.1".into(),
        port: listener.local_addr().unwrap().port(),
    };
    let refuser = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            while transport::recv_json::<_, TraversalMessage>(&mut ws).await.is_ok() {
                let reply = TraversalMessage::Error {
                    message: "maintenance".into(),
                };
                if transport::send_json(&mut ws, &reply).await.is_err() {
                    break;
                }
            }
        }
    });

    let (ui, mut events) = ChannelUi::new();
    let factory = SessionFactory::with_options(Arc::new(ui), factory().options().clone());
    let params = ConnectionParameters::join_traversal("Guest", "1a2b3c4d", &addr);
    let err = assert_err!(factory.create(&params).await);
    match &err {
        SessionError::TraversalServerRejected(message) => assert_eq!(message, "maintenance"),
        other => panic!("expected a refusal, got {other}"),
    }

    let mut reported = None;
    while let Ok(event) = events.try_recv() {
        if let UiEvent::Failed { code, .. } = event {
            reported = Some(code);
        }
    }
    assert_eq!(reported, Some(err.code()));

    // Hosts see the same refusal as a failed registration
    let params = ConnectionParameters::host_traversal("Host", 0, &addr);
    let err = assert_err!(factory.create(&params).await);
    assert!(matches!(err, SessionError::TraversalRegistrationFailed(_)), "{err}");

    refuser.abort();
}

#[tokio::test]
async fn losing_the_traversal_server_withdraws_the_host_code() {
    let (server, addr) = traversal_server().await;
    let (ui, mut events) = ChannelUi::new();
    let options = SessionOptions {
        keepalive_interval: Duration::from_millis(50),
        ..factory().options().clone()
    };
    let factory = SessionFactory::with_options(Arc::new(ui), options);

    let params = ConnectionParameters::host_traversal("Host", 0, &addr);
    let host = assert_ok!(factory.create(&params).await);
    assert!(host.host_code().is_some());

    server.shutdown().await;

    let mut lost = false;
    for _ in 0..100 {
        while let Ok(event) = events.try_recv() {
            lost |= event == UiEvent::TraversalLost;
        }
        if lost {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(lost);
    assert!(host.host_code().is_none());
    // Players already connected keep playing
    assert_eq!(host.state(), SessionState::Connected);

    host.close().await;
}

#[tokio::test]
async fn busy_port_is_bind_failed() {
    let taken = transport::bind_listener(0).unwrap();
    let port = taken.local_addr().unwrap().port();

    let err = assert_err!(factory().create(&ConnectionParameters::host_direct("Host", port)).await);
    match err {
        SessionError::BindFailed { port: failed, source } => {
            assert_eq!(failed, port);
            assert_eq!(source.kind(), std::io::ErrorKind::AddrInUse);
        }
        other => panic!("expected BindFailed, got {other}"),
    }
}

#[tokio::test]
async fn nobody_home_is_connect_failed() {
    let params = ConnectionParameters::join_direct("Guest", "127.0.0.1", free_port());
    let err = assert_err!(factory().create(&params).await);
    assert!(matches!(err, SessionError::ConnectFailed { .. }), "{err}");
}

#[tokio::test]
async fn protocol_mismatch_is_rejected() {
    let host = assert_ok!(factory().create(&ConnectionParameters::host_direct("Host", 0)).await);

    let timeout = Duration::from_secs(2);
    let mut dialed = transport::dial("127.0.0.1", host.local_port(), TlsMode::Plain, timeout)
        .await
        .unwrap();
    let hello = PeerMessage::Hello {
        nickname: "Time Traveller".into(),
        version: PROTOCOL_VERSION + 1,
    };
    transport::send_json(&mut dialed.ws, &hello).await.unwrap();
    let reply: PeerMessage = transport::recv_json_timeout(&mut dialed.ws, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(matches!(reply, PeerMessage::Rejected { .. }), "{reply:?}");
    assert!(host.peers().is_empty());

    host.close().await;
}

#[tokio::test]
async fn cancelling_releases_the_port_every_time() {
    // Accepts traversal connections and never answers, so registration hangs
    let stall = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stall_addr = TraversalServerAddr {
        host: "127.0.0.1".into(),
        port: stall.local_addr().unwrap().port(),
    };
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = stall.accept().await {
            held.push(socket);
        }
    });

    let options = SessionOptions {
        traversal_timeout: Duration::from_secs(30),
        ..Default::default()
    };
    let factory = SessionFactory::with_options(Arc::new(LogUi), options);
    let port = free_port();

    for _ in 0..100 {
        let params = ConnectionParameters::host_traversal("Host", port, &stall_addr);
        let pending = factory.spawn(params);
        let mut progress = pending.progress();
        progress
            .wait_for(|state| *state == SessionState::Listening)
            .await
            .unwrap();

        pending.cancel().await;
        assert_eq!(*progress.borrow(), SessionState::Failed);

        let rebound = assert_ok!(transport::bind_listener(port));
        drop(rebound);
    }

    holder.abort();
}

#[tokio::test]
async fn spawned_attempt_can_be_joined() {
    let pending = factory().spawn(ConnectionParameters::host_direct("Host", 0));
    let host = assert_ok!(pending.join().await);
    assert_eq!(host.state(), SessionState::Connected);
    host.close().await;
}

#[tokio::test]
async fn setup_allows_one_session_at_a_time() {
    let mut store = MemoryConfig::new();
    netplay::ConfigStore::set(&mut store, "HostPort", "0");
    let mut setup = NetPlaySetup::new(store, factory());

    let port = assert_ok!(setup.host("Metroid Prime").await).local_port();
    assert!(matches!(setup.join().await, Err(SessionError::SessionAlreadyOpen)));

    setup.close_session().await;
    assert!(setup.session().is_none());
    assert_ok!(transport::bind_listener(port));
}
