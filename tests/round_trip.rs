//! End-to-end tests over a real WebSocket.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    accept_async, connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use maze_sync::authority::Authority;
use maze_sync::network::client::{ClientConfig, CommandDispatcher};
use maze_sync::network::connection::Connection;
use maze_sync::network::poller::StatePoller;
use maze_sync::network::protocol::{
    ClientMessage, Command, CommandRequest, ErrorCode, RegisterPayload, ServerMessage,
    UpdatePosPayload,
};
use maze_sync::network::retry::RetryPolicy;
use maze_sync::network::server::{ServerConfig, SyncServer, SyncServerError};

const TIMEOUT: Duration = Duration::from_secs(2);

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Running {
    server: Arc<SyncServer>,
    addr: String,
    task: JoinHandle<Result<(), SyncServerError>>,
}

impl Running {
    async fn stop(self) {
        self.server.shutdown();
        tokio::time::timeout(Duration::from_secs(3), self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

async fn start(bind: &str, authority: Arc<Authority>) -> Running {
    let config = ServerConfig {
        bind_addr: bind.parse().unwrap(),
        ..Default::default()
    };
    let server = Arc::new(SyncServer::with_authority(config, authority));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let running = server.clone();
    let task = tokio::spawn(async move { running.serve(listener).await });

    Running { server, addr, task }
}

fn client_config(addr: &str) -> ClientConfig {
    ClientConfig {
        server_addr: addr.to_string(),
        retry: RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(20),
            multiplier: 2,
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_register_update_and_query() {
    let authority = Arc::new(Authority::default());
    let running = start("127.0.0.1:0", authority.clone()).await;

    let alice = CommandDispatcher::new("alice", client_config(&running.addr));
    let bob = CommandDispatcher::new("bob", client_config(&running.addr));

    let reply = alice.register("Alice", Some((2, 3))).await.unwrap();
    assert!(reply.applied);
    assert_eq!(reply.message, "registered");
    assert_eq!(reply.seq, 1);

    bob.register("Bob", None).await.unwrap();
    let reply = bob.update_position(7, 8, 2).await.unwrap();
    assert_eq!(reply.message, "position-updated");
    assert_eq!(reply.seq, 2);

    let state = alice.query_state().await.unwrap();
    assert_eq!(state.players.len(), 2);
    assert_eq!(state.players[0].id, "alice");
    assert_eq!((state.players[0].x, state.players[0].y, state.players[0].lives), (2, 3, 3));
    assert_eq!(state.players[1].id, "bob");
    assert_eq!((state.players[1].x, state.players[1].y, state.players[1].lives), (7, 8, 2));

    let reply = alice.logout().await.unwrap();
    assert_eq!(reply.message, "logged-out");
    assert_eq!(authority.player_count().await, 1);
    assert_eq!(authority.processed_count().await, 4);

    running.stop().await;
}

#[tokio::test]
async fn test_retransmission_returns_cached_reply() {
    let authority = Arc::new(Authority::default());
    let running = start("127.0.0.1:0", authority.clone()).await;
    let connection = Connection::dial(&running.addr).await.unwrap();

    let first = UpdatePosPayload { x: 1, y: 1, lives: 3 };
    let first = CommandRequest::new("carol", 5, Command::UpdatePos(first));
    let original = connection.send_command(first, TIMEOUT).await.unwrap();
    assert!(original.applied);

    // Same (identity, seq) with a different payload: the server must not apply it.
    let replay = UpdatePosPayload { x: 9, y: 9, lives: 1 };
    let replay = CommandRequest::new("carol", 5, Command::UpdatePos(replay));
    let duplicate = connection.send_command(replay, TIMEOUT).await.unwrap();
    assert_eq!(duplicate, original);

    let state = authority.handle_state_query().await;
    assert_eq!((state.players[0].x, state.players[0].y), (1, 1));
    assert_eq!(authority.processed_count().await, 1);

    running.stop().await;
}

#[tokio::test]
async fn test_unknown_and_bad_commands() {
    let authority = Arc::new(Authority::default());
    let running = start("127.0.0.1:0", authority.clone()).await;
    let connection = Connection::dial(&running.addr).await.unwrap();

    let dance = CommandRequest::new("dave", 1, Command::Unknown { name: "DANCE".to_string() });
    let reply = connection.send_command(dance, TIMEOUT).await.unwrap();
    assert!(!reply.applied);
    assert_eq!(reply.message, "unknown-command");

    let nameless = CommandRequest::new(
        "dave",
        2,
        Command::Register(RegisterPayload { name: " ".to_string(), x: None, y: None }),
    );
    let reply = connection.send_command(nameless, TIMEOUT).await.unwrap();
    assert!(!reply.applied);
    assert_eq!(reply.message, "bad-payload");

    assert_eq!(authority.player_count().await, 0);
    assert_eq!(authority.processed_count().await, 2);

    running.stop().await;
}

async fn next_reply(ws: &mut WsClient) -> ServerMessage {
    match ws.next().await {
        Some(Ok(Message::Text(text))) => ServerMessage::from_json(&text).unwrap(),
        other => panic!("unexpected frame: {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_payload_cached_as_bad_payload() {
    let authority = Arc::new(Authority::default());
    let running = start("127.0.0.1:0", authority.clone()).await;
    let (mut ws, _) = connect_async(format!("ws://{}", running.addr)).await.unwrap();

    let frames = [
        r#"{"type":"send_command","call_id":1,"request":{"identity":"eve","seq":1,"command":"REGISTER","payload":{}}}"#,
        r#"{"type":"send_command","call_id":2,"request":{"identity":"eve","seq":2,"command":"UPDATE_POS","payload":{"x":1,"y":1}}}"#,
        r#"{"type":"send_command","call_id":3,"request":{"identity":"eve","seq":2,"command":"UPDATE_POS","payload":{"x":1,"y":1}}}"#,
    ];

    let mut replies = Vec::new();
    for frame in frames {
        ws.send(Message::Text(frame.to_string())).await.unwrap();
        match next_reply(&mut ws).await {
            ServerMessage::CommandReply { reply, .. } => replies.push(reply),
            other => panic!("expected command reply, got {:?}", other),
        }
    }

    for reply in &replies {
        assert!(!reply.applied);
        assert_eq!(reply.message, "bad-payload");
    }
    assert_eq!(replies[2], replies[1]);
    assert_eq!(authority.player_count().await, 0);
    assert_eq!(authority.processed_count().await, 2);

    running.stop().await;
}

#[tokio::test]
async fn test_undecodable_envelope_gets_error_and_connection_survives() {
    let running = start("127.0.0.1:0", Arc::new(Authority::default())).await;
    let (mut ws, _) = connect_async(format!("ws://{}", running.addr)).await.unwrap();

    // No seq: there is nothing to key a cached reply on.
    let bad = r#"{"type":"send_command","call_id":7,"request":{"identity":"eve","command":"LOGOUT"}}"#;
    ws.send(Message::Text(bad.to_string())).await.unwrap();

    match next_reply(&mut ws).await {
        ServerMessage::Error { call_id, error } => {
            assert_eq!(call_id, Some(7));
            assert_eq!(error.code, ErrorCode::InvalidInput);
        }
        other => panic!("expected error frame, got {:?}", other),
    }

    let good = r#"{"type":"send_command","call_id":8,"request":{"identity":"eve","seq":1,"command":"LOGOUT"}}"#;
    ws.send(Message::Text(good.to_string())).await.unwrap();
    match next_reply(&mut ws).await {
        ServerMessage::CommandReply { call_id, reply } => {
            assert_eq!(call_id, 8);
            assert_eq!(reply.message, "logged-out");
        }
        other => panic!("expected command reply, got {:?}", other),
    }

    running.stop().await;
}

/// WebSocket relay in front of the server. On its first connection it lets
/// the request through, swallows the reply and hangs up.
struct LossyRelay {
    addr: String,
    forwarded: Arc<Mutex<Vec<ClientMessage>>>,
    swallowed: Arc<Mutex<Vec<ServerMessage>>>,
}

async fn start_lossy_relay(backend: String) -> LossyRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let forwarded = Arc::new(Mutex::new(Vec::new()));
    let swallowed = Arc::new(Mutex::new(Vec::new()));

    let (forwarded_log, swallowed_log) = (forwarded.clone(), swallowed.clone());
    tokio::spawn(async move {
        let mut first = true;
        while let Ok((stream, _)) = listener.accept().await {
            let lose_reply = std::mem::replace(&mut first, false);
            let backend = backend.clone();
            let forwarded = forwarded_log.clone();
            let swallowed = swallowed_log.clone();

            tokio::spawn(async move {
                let mut client = accept_async(stream).await.unwrap();
                let (mut server, _) = connect_async(format!("ws://{}", backend)).await.unwrap();

                loop {
                    tokio::select! {
                        Some(Ok(msg)) = client.next() => {
                            if let Message::Text(text) = &msg {
                                let parsed = ClientMessage::from_json(text).unwrap();
                                forwarded.lock().unwrap().push(parsed);
                            }
                            if server.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(msg)) = server.next() => {
                            if lose_reply {
                                if let Message::Text(text) = &msg {
                                    let parsed = ServerMessage::from_json(text).unwrap();
                                    swallowed.lock().unwrap().push(parsed);
                                }
                                let _ = client.close(None).await;
                                break;
                            }
                            if client.send(msg).await.is_err() {
                                break;
                            }
                        }
                        else => break,
                    }
                }
            });
        }
    });

    LossyRelay { addr, forwarded, swallowed }
}

#[tokio::test]
async fn test_lost_reply_retried_with_same_seq() {
    let authority = Arc::new(Authority::default());
    let running = start("127.0.0.1:0", authority.clone()).await;
    let relay = start_lossy_relay(running.addr.clone()).await;

    let dispatcher = CommandDispatcher::new("gina", client_config(&relay.addr));
    let reply = dispatcher.register("Gina", None).await.unwrap();

    // The command reached the server twice under one seq.
    let requests: Vec<CommandRequest> = relay
        .forwarded
        .lock()
        .unwrap()
        .iter()
        .filter_map(|msg| match msg {
            ClientMessage::SendCommand { request, .. } => Some(request.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], requests[1]);
    assert_eq!(requests[0].seq, 1);

    // The retry got the reply the first attempt lost.
    let lost = match relay.swallowed.lock().unwrap().first() {
        Some(ServerMessage::CommandReply { reply, .. }) => reply.clone(),
        other => panic!("expected a swallowed command reply, got {:?}", other),
    };
    assert_eq!(reply, lost);
    assert!(reply.applied);

    assert_eq!(authority.player_count().await, 1);
    assert_eq!(authority.processed_count().await, 1);
    assert_eq!(dispatcher.last_seq().await, 1);

    running.stop().await;
}

#[tokio::test]
async fn test_dispatcher_reconnects_after_restart() {
    let authority = Arc::new(Authority::default());
    let first = start("127.0.0.1:0", authority.clone()).await;
    let addr = first.addr.clone();

    let dispatcher = CommandDispatcher::new("frank", client_config(&addr));
    dispatcher.register("Frank", None).await.unwrap();
    assert!(dispatcher.is_connected().await);

    first.stop().await;

    // Same address, same authority: only the transport went away.
    let second = start(&addr, authority.clone()).await;

    let reply = dispatcher.update_position(4, 4, 3).await.unwrap();
    assert!(reply.applied);
    assert_eq!(reply.seq, 2);
    assert!(dispatcher.is_connected().await);
    assert_eq!(authority.processed_count().await, 2);

    second.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_client_connections() {
    let running = start("127.0.0.1:0", Arc::new(Authority::default())).await;
    let connection = Connection::dial(&running.addr).await.unwrap();
    assert!(!connection.is_closed());

    running.stop().await;

    tokio::time::timeout(TIMEOUT, async {
        while !connection.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection not closed after shutdown");
}

#[tokio::test]
async fn test_poller_sees_other_players() {
    let running = start("127.0.0.1:0", Arc::new(Authority::default())).await;

    let me = Arc::new(CommandDispatcher::new("me", client_config(&running.addr)));
    let other = CommandDispatcher::new("other", client_config(&running.addr));
    me.register("Me", None).await.unwrap();
    other.register("Other", Some((3, 4))).await.unwrap();

    let poller = StatePoller::new(me.clone())
        .with_period(Duration::from_millis(50))
        .spawn();
    let mut players = poller.players();

    let seen = tokio::time::timeout(TIMEOUT, async {
        loop {
            players.changed().await.unwrap();
            let current = players.borrow_and_update().clone();
            if !current.is_empty() {
                return current;
            }
        }
    })
    .await
    .expect("poller published nothing");

    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].id, "other");
    assert_eq!((seen[0].x, seen[0].y), (3, 4));

    poller.shutdown().await;
    running.stop().await;
}
