//! End-to-end tests over a real WebSocket.

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use roster_core::publisher::{Event, EventHandler, HandlerError, ANY_EVENT};
use roster_core::{DeliveryOutcome, Envelope, Identity, LifecycleEvent, TransitionKind};
use roster_protocol::{codec, codes, Frame};
use roster_server::auth::TokenClaims;
use roster_server::config::{AuthConfig, Config, HeartbeatConfig};
use roster_server::{app, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const SECRET: &str = "integration-secret";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> Config {
    Config {
        node_id: Some("test-node".to_string()),
        auth: AuthConfig {
            secret: SECRET.to_string(),
            ..AuthConfig::default()
        },
        ..Config::default()
    }
}

fn token_for(kind: roster_core::PrincipalKind, sub: &str) -> String {
    let exp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 300;
    let claims = TokenClaims {
        sub: sub.to_string(),
        kind,
        role: None,
        sid: None,
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn user_token(sub: &str) -> String {
    token_for(roster_core::PrincipalKind::User, sub)
}

async fn spawn_server(config: Config) -> (SocketAddr, Arc<AppState>) {
    let state = Arc::new(AppState::build(config).await.unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr, token: Option<&str>) -> Client {
    let url = match token {
        Some(token) => format!("ws://{addr}/ws?token={token}"),
        None => format!("ws://{addr}/ws"),
    };
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Client, frame: &Frame) {
    let data = codec::encode(frame).unwrap();
    ws.send(Message::Binary(data.to_vec())).await.unwrap();
}

/// Next protocol frame, or `None` once the server has closed the socket.
async fn next_frame(ws: &mut Client) -> Option<Frame> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame");
        match msg {
            Some(Ok(Message::Binary(data))) => return Some(codec::decode(&data).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn recv(ws: &mut Client) -> Frame {
    next_frame(ws).await.expect("socket closed")
}

/// Open a socket and complete the handshake.
async fn open(addr: SocketAddr) -> Client {
    let mut ws = connect(addr, None).await;
    assert!(matches!(recv(&mut ws).await, Frame::Connected { .. }));
    ws
}

async fn login(ws: &mut Client, id: u64, token: &str) -> Frame {
    send(ws, &Frame::login(id, token)).await;
    recv(ws).await
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

fn watch_lifecycle(state: &AppState, channel: &str) -> mpsc::UnboundedReceiver<LifecycleEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: Arc<dyn EventHandler> = Arc::new(move |event: &Event| -> Result<(), HandlerError> {
        let lifecycle: LifecycleEvent = serde_json::from_value(event.payload.clone())?;
        tx.send(lifecycle)?;
        Ok(())
    });
    // Kept alive by the publisher until the test ends.
    let _subscription = state.publisher.subscribe(channel, ANY_EVENT, handler);
    rx
}

async fn next_transition(rx: &mut mpsc::UnboundedReceiver<LifecycleEvent>) -> LifecycleEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no lifecycle event")
        .expect("lifecycle channel closed")
}

#[tokio::test]
async fn test_handshake_with_query_token() {
    let (addr, state) = spawn_server(test_config()).await;
    let alice = Identity::user("alice");

    let mut ws = connect(addr, Some(&user_token("alice"))).await;
    match recv(&mut ws).await {
        Frame::Connected { connection_id, .. } => assert!(connection_id.starts_with("test-node/")),
        other => panic!("expected Connected, got {other:?}"),
    }
    assert_eq!(
        recv(&mut ws).await,
        Frame::authenticated(0, "user:alice")
    );
    assert!(state.registry.is_online(&alice).await.unwrap());

    ws.close(None).await.unwrap();
    wait_until(|| {
        let state = state.clone();
        let alice = alice.clone();
        async move { !state.registry.is_online(&alice).await.unwrap() }
    })
    .await;
}

#[tokio::test]
async fn test_two_connections_single_online_single_offline() {
    let (addr, state) = spawn_server(test_config()).await;
    let mut events = watch_lifecycle(&state, "presence:user");
    let alice = Identity::user("alice");

    let mut c1 = open(addr).await;
    let mut c2 = open(addr).await;
    assert!(matches!(login(&mut c1, 1, &user_token("alice")).await, Frame::Authenticated { .. }));
    assert!(matches!(login(&mut c2, 1, &user_token("alice")).await, Frame::Authenticated { .. }));

    let online = next_transition(&mut events).await;
    assert_eq!(online.identity, alice);
    assert_eq!(online.transition, TransitionKind::Online);

    c1.close(None).await.unwrap();
    wait_until(|| {
        let state = state.clone();
        let alice = alice.clone();
        async move { state.registry.list_connections(&alice).await.unwrap().len() == 1 }
    })
    .await;
    assert!(
        tokio::time::timeout(Duration::from_millis(200), events.recv())
            .await
            .is_err(),
        "closing one of two connections must not announce anything"
    );

    c2.close(None).await.unwrap();
    let offline = next_transition(&mut events).await;
    assert_eq!(offline.identity, alice);
    assert_eq!(offline.transition, TransitionKind::Offline);
    assert!(!state.registry.is_online(&alice).await.unwrap());
}

#[tokio::test]
async fn test_invalid_credential_is_rejected_without_side_effects() {
    let (addr, state) = spawn_server(test_config()).await;
    let mut ws = open(addr).await;

    match login(&mut ws, 7, "not-a-token").await {
        Frame::Error { id, code, .. } => {
            assert_eq!(id, 7);
            assert_eq!(code, codes::AUTHENTICATION_FAILED);
        }
        other => panic!("expected Error, got {other:?}"),
    }
    assert!(state.registry.online_identities(None).await.unwrap().is_empty());

    // The socket stays usable.
    assert_eq!(
        login(&mut ws, 8, &user_token("bob")).await,
        Frame::authenticated(8, "user:bob")
    );
}

#[tokio::test]
async fn test_logout_keeps_socket_open_for_relogin() {
    let (addr, state) = spawn_server(test_config()).await;
    let carol = Identity::performer("carol");
    let token = token_for(roster_core::PrincipalKind::Performer, "carol");
    let mut ws = open(addr).await;

    login(&mut ws, 1, &token).await;
    assert!(state.registry.is_online(&carol).await.unwrap());

    send(&mut ws, &Frame::logout(2)).await;
    assert_eq!(recv(&mut ws).await, Frame::ack(2));
    assert!(!state.registry.is_online(&carol).await.unwrap());

    send(&mut ws, &Frame::logout(3)).await;
    assert_eq!(recv(&mut ws).await, Frame::ack(3));

    assert_eq!(
        login(&mut ws, 4, &token).await,
        Frame::authenticated(4, "performer:carol")
    );
    assert!(state.registry.is_online(&carol).await.unwrap());
}

#[tokio::test]
async fn test_emit_reaches_every_socket_of_identity() {
    let (addr, state) = spawn_server(test_config()).await;
    let alice = Identity::user("alice");

    let mut c1 = open(addr).await;
    let mut c2 = open(addr).await;
    let mut bystander = open(addr).await;
    login(&mut c1, 1, &user_token("alice")).await;
    login(&mut c2, 1, &user_token("alice")).await;
    login(&mut bystander, 1, &user_token("bob")).await;

    let report = state
        .emitter
        .emit([alice.clone(), alice.clone()], "ping", br#"{"x":1}"#.to_vec())
        .await;
    assert_eq!(report.delivered, 2);

    for ws in [&mut c1, &mut c2] {
        assert_eq!(recv(ws).await, Frame::event("ping", br#"{"x":1}"#.to_vec()));
    }

    send(&mut bystander, &Frame::ping()).await;
    assert!(matches!(recv(&mut bystander).await, Frame::Pong { .. }));

    c1.close(None).await.unwrap();
    c2.close(None).await.unwrap();
    wait_until(|| {
        let state = state.clone();
        let alice = alice.clone();
        async move { !state.registry.is_online(&alice).await.unwrap() }
    })
    .await;

    let report = state.emitter.emit([alice], "ping", Vec::new()).await;
    assert_eq!(report.delivered, 0);
}

#[tokio::test]
async fn test_switching_identity_drops_previous_identity_traffic() {
    let (addr, state) = spawn_server(test_config()).await;
    let alice = Identity::user("alice");
    let carol = Identity::performer("carol");
    let mut ws = open(addr).await;

    login(&mut ws, 1, &user_token("alice")).await;
    let resolved = state.registry.list_connections(&alice).await.unwrap();
    assert_eq!(resolved.len(), 1);

    let carol_token = token_for(roster_core::PrincipalKind::Performer, "carol");
    assert_eq!(
        login(&mut ws, 2, &carol_token).await,
        Frame::authenticated(2, "performer:carol")
    );

    for id in &resolved {
        let envelope = Arc::new(Envelope::new("private", b"{}".to_vec()));
        assert_eq!(state.dispatch.dispatch(id, envelope), DeliveryOutcome::Stale);
    }
    let report = state.emitter.emit([alice], "private", Vec::new()).await;
    assert_eq!(report.delivered, 0);

    let report = state.emitter.emit([carol], "for-carol", Vec::new()).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(recv(&mut ws).await, Frame::event("for-carol", Vec::new()));
}

#[tokio::test]
async fn test_unsupported_version_closes_connection() {
    let (addr, _state) = spawn_server(test_config()).await;
    let mut ws = open(addr).await;

    send(&mut ws, &Frame::connect(99, None)).await;
    match recv(&mut ws).await {
        Frame::Error { code, .. } => assert_eq!(code, codes::UNSUPPORTED_VERSION),
        other => panic!("expected Error, got {other:?}"),
    }
    assert!(next_frame(&mut ws).await.is_none());
}

#[tokio::test]
async fn test_idle_connection_is_closed_and_unregistered() {
    let config = Config {
        heartbeat: HeartbeatConfig {
            interval_ms: 100,
            timeout_ms: 300,
        },
        ..test_config()
    };
    let (addr, state) = spawn_server(config).await;
    let dave = Identity::user("dave");

    let mut ws = open(addr).await;
    login(&mut ws, 1, &user_token("dave")).await;
    assert!(state.registry.is_online(&dave).await.unwrap());

    match recv(&mut ws).await {
        Frame::Error { code, .. } => assert_eq!(code, codes::CONNECTION_CLOSED),
        other => panic!("expected Error, got {other:?}"),
    }
    wait_until(|| {
        let state = state.clone();
        let dave = dave.clone();
        async move { !state.registry.is_online(&dave).await.unwrap() }
    })
    .await;
}
