use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use cw_test_utils::buffer_msg;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::watch;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use watcher::auth::AuthResult;
use watcher::dedup::EidCache;
use watcher::ingest::{ChannelFilter, Ingestor};
use watcher::storage::{MessageStore, SqliteStore};
use watcher::stream::{StreamError, StreamProcessor, StreamSettings};

type Ws = WebSocketStream<DuplexStream>;

async fn ws_pair() -> (Ws, Ws) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    (client, server)
}

fn auth() -> AuthResult {
    AuthResult {
        session: "s".to_owned(),
        uid: 1,
        api_host: String::new(),
        stream_host: String::new(),
        stream_path: String::new(),
    }
}

fn processor(settings: StreamSettings) -> (StreamProcessor, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ingestor = Arc::new(Ingestor::new(
        ChannelFilter::new(Vec::<String>::new(), ["#denied"]),
        Arc::new(EidCache::default()),
        store.clone(),
    ));
    (StreamProcessor::new(ingestor, None, settings), store)
}

fn quiet_timers() -> StreamSettings {
    StreamSettings {
        heartbeat_interval: Duration::from_secs(3600),
        ping_interval: Duration::from_secs(3600),
        debug: true,
    }
}

#[tokio::test(start_paused = true)]
async fn heartbeat_reports_highest_eid_seen() {
    let (p, _store) = processor(StreamSettings {
        ping_interval: Duration::from_secs(3600),
        ..StreamSettings::default()
    });
    let (client, mut server) = ws_pair().await;
    let (_tx, rx) = watch::channel(false);
    let _task = tokio::spawn(async move { p.run(client, &auth(), rx).await });

    server
        .send(Message::Text(buffer_msg("#a", "x", "hello world", 41, 0).into()))
        .await
        .unwrap();
    server
        .send(Message::Text(buffer_msg("#denied", "x", "hidden", 42, 0).into()))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let Some(Ok(Message::Text(text))) = server.next().await else {
        panic!("expected heartbeat text frame");
    };
    assert!(started.elapsed() >= Duration::from_secs(30));
    let hb: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(hb["_method"], "heartbeat");
    assert_eq!(hb["last_seen_eid"], 42);
    assert!(hb["_reqid"].as_i64().unwrap() > 0);
}

#[tokio::test(start_paused = true)]
async fn ping_is_sent_on_its_own_interval() {
    let (p, _store) = processor(StreamSettings {
        heartbeat_interval: Duration::from_secs(3600),
        ..StreamSettings::default()
    });
    let (client, mut server) = ws_pair().await;
    let (_tx, rx) = watch::channel(false);
    let _task = tokio::spawn(async move { p.run(client, &auth(), rx).await });

    let started = tokio::time::Instant::now();
    let Some(Ok(Message::Ping(data))) = server.next().await else {
        panic!("expected ping");
    };
    assert_eq!(&data[..], b"ping");
    assert!(started.elapsed() >= Duration::from_secs(60));
}

#[tokio::test]
async fn server_ping_gets_exactly_one_pong() {
    let (p, _store) = processor(quiet_timers());
    let (client, mut server) = ws_pair().await;
    let (_tx, rx) = watch::channel(false);
    let _task = tokio::spawn(async move { p.run(client, &auth(), rx).await });

    server.send(Message::Ping("are-you-there".into())).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(2), server.next())
        .await
        .unwrap();
    assert!(matches!(reply, Some(Ok(Message::Pong(ref d))) if &d[..] == b"are-you-there"));

    // Whatever follows the pong, it must not be a second pong.
    server.send(Message::Close(None)).await.unwrap();
    let next = tokio::time::timeout(Duration::from_secs(2), server.next())
        .await
        .unwrap();
    assert!(
        !matches!(next, Some(Ok(Message::Pong(_)))),
        "duplicate pong: {next:?}"
    );
}

#[tokio::test]
async fn frames_are_stored_in_order_and_bad_frames_skipped() {
    let (p, store) = processor(quiet_timers());
    let (client, mut server) = ws_pair().await;
    let (_tx, rx) = watch::channel(false);
    let task = tokio::spawn(async move { p.run(client, &auth(), rx).await });

    for text in [
        buffer_msg("#a", "x", "\x0307first\x03 message", 1, 1_752_956_700_000_000),
        "garbage".to_owned(),
        r#"{"type":"stat_user"}"#.to_owned(),
        buffer_msg("#a", "x", "first message again", 1, 1_752_956_700_000_000),
        buffer_msg("#denied", "x", "denied line", 2, 1_752_956_700_000_000),
        buffer_msg("#b", "y", "second message", 3, 1_752_956_701_000_000),
    ] {
        server.send(Message::Text(text.into())).await.unwrap();
    }
    server.send(Message::Close(None)).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(StreamError::Closed)), "got {result:?}");

    let rows = store
        .query_by_date("2025-07-19")
        .unwrap();
    let bodies: Vec<&str> = rows.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["first message", "second message"]);
}

#[tokio::test]
async fn shutdown_sends_close_and_returns_ok() {
    let (p, _store) = processor(quiet_timers());
    let (client, mut server) = ws_pair().await;
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(async move { p.run(client, &auth(), rx).await });

    tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    let frame = tokio::time::timeout(Duration::from_secs(2), server.next())
        .await
        .unwrap();
    assert!(matches!(frame, Some(Ok(Message::Close(_)))));
}

#[tokio::test]
async fn dropped_transport_is_an_error() {
    let (p, _store) = processor(quiet_timers());
    let (client, server) = ws_pair().await;
    let (_tx, rx) = watch::channel(false);
    let task = tokio::spawn(async move { p.run(client, &auth(), rx).await });

    drop(server);
    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert!(
        matches!(result, Err(StreamError::Read(_) | StreamError::Closed)),
        "got {result:?}"
    );
}

/// A socket that never yields a frame and refuses every write.
struct DeadWriter;

impl Stream for DeadWriter {
    type Item = Result<Message, WsError>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Pending
    }
}

impl Sink<Message> for DeadWriter {
    type Error = WsError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Err(WsError::AlreadyClosed))
    }

    fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), WsError> {
        Err(WsError::AlreadyClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Err(WsError::AlreadyClosed))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test(start_paused = true)]
async fn failed_heartbeat_write_ends_the_loop() {
    let (p, _store) = processor(StreamSettings {
        ping_interval: Duration::from_secs(3600),
        ..StreamSettings::default()
    });
    let (_tx, rx) = watch::channel(false);

    let started = tokio::time::Instant::now();
    let result = p.run(DeadWriter, &auth(), rx).await;
    assert!(matches!(result, Err(StreamError::Heartbeat(_))), "got {result:?}");
    assert!(started.elapsed() >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn failed_ping_write_ends_the_loop() {
    let (p, _store) = processor(StreamSettings {
        heartbeat_interval: Duration::from_secs(3600),
        ..StreamSettings::default()
    });
    let (_tx, rx) = watch::channel(false);

    let started = tokio::time::Instant::now();
    let result = p.run(DeadWriter, &auth(), rx).await;
    assert!(matches!(result, Err(StreamError::Ping(_))), "got {result:?}");
    assert!(started.elapsed() >= Duration::from_secs(60));
}
