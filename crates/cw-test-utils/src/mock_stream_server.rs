// mock_stream_server: A scripted WebSocket server standing in for the
// upstream streaming endpoint.
//
// Each accepted connection pops the next script from a queue and plays it
// (send frames, pause, close, or drop the socket). Everything the client
// sends is recorded so tests can assert on heartbeats and pings.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;

/// One step of a per-connection script.
#[derive(Debug, Clone)]
pub enum WsStep {
    /// Send a text frame.
    Text(String),
    /// Wait before the next step.
    Pause(Duration),
    /// Send a close frame and end the connection.
    Close,
    /// Drop the socket without a close frame.
    Drop,
}

/// Handshake details captured for each accepted connection.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub path_and_query: String,
    pub cookie: Option<String>,
    pub origin: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Default)]
struct StreamState {
    scripts: Mutex<VecDeque<Vec<WsStep>>>,
    received: Mutex<Vec<String>>,
    pings: AtomicUsize,
    connections: AtomicUsize,
    handshakes: Mutex<Vec<Handshake>>,
    reject: AtomicBool,
    stall: AtomicBool,
    stalled: AtomicUsize,
}

/// A mock upstream streaming endpoint for integration testing.
///
/// Binds to port 0 (random). Connections without a queued script simply
/// record client traffic until the client goes away.
pub struct MockStreamServer {
    addr: SocketAddr,
    state: Arc<StreamState>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockStreamServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(StreamState::default());

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _peer)) = listener.accept().await {
                let conn_state = accept_state.clone();
                tokio::spawn(async move {
                    // Client-side drops are expected in tests.
                    let _ = Self::handle_connection(stream, conn_state).await;
                });
            }
        });

        Ok(Self {
            addr,
            state,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue the script played by the next accepted connection.
    pub fn push_script(&self, steps: Vec<WsStep>) {
        self.state.scripts.lock().unwrap().push_back(steps);
    }

    /// Refuse WebSocket upgrades with HTTP 403 while set.
    pub fn set_reject(&self, reject: bool) {
        self.state.reject.store(reject, Ordering::SeqCst);
    }

    /// Accept TCP but never answer the upgrade request while set.
    pub fn set_stall(&self, stall: bool) {
        self.state.stall.store(stall, Ordering::SeqCst);
    }

    /// Connections held open without an upgrade response.
    pub fn stalled_count(&self) -> usize {
        self.state.stalled.load(Ordering::SeqCst)
    }

    /// Text frames received from clients, across all connections.
    pub fn received(&self) -> Vec<String> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn ping_count(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    /// Number of successful upgrades.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn handshakes(&self) -> Vec<Handshake> {
        self.state.handshakes.lock().unwrap().clone()
    }

    // -- internal --

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        state: Arc<StreamState>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if state.stall.load(Ordering::SeqCst) {
            state.stalled.fetch_add(1, Ordering::SeqCst);
            // Hold the socket until the client gives up.
            let mut stream = stream;
            let mut sink = [0u8; 1024];
            while stream.read(&mut sink).await? > 0 {}
            return Ok(());
        }
        let hs_state = state.clone();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if hs_state.reject.load(Ordering::SeqCst) {
                let mut rejection = ErrorResponse::new(Some("forbidden".to_owned()));
                *rejection.status_mut() = StatusCode::FORBIDDEN;
                return Err(rejection);
            }
            let header = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
            };
            hs_state.handshakes.lock().unwrap().push(Handshake {
                path_and_query: req
                    .uri()
                    .path_and_query()
                    .map(|p| p.as_str().to_owned())
                    .unwrap_or_default(),
                cookie: header("cookie"),
                origin: header("origin"),
                user_agent: header("user-agent"),
            });
            Ok(resp)
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        state.connections.fetch_add(1, Ordering::SeqCst);
        let (mut write, mut read) = ws.split();

        let script = state.scripts.lock().unwrap().pop_front().unwrap_or_default();

        // Recorder runs beside the script so traffic sent during pauses is kept.
        let rec_state = state.clone();
        let (pong_tx, mut pong_rx) = tokio::sync::mpsc::unbounded_channel();
        let recorder = tokio::spawn(async move {
            while let Some(Ok(msg)) = read.next().await {
                match msg {
                    Message::Text(t) => rec_state.received.lock().unwrap().push(t.as_str().to_owned()),
                    Message::Ping(data) => {
                        rec_state.pings.fetch_add(1, Ordering::SeqCst);
                        let _ = pong_tx.send(data);
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        for step in script {
            match step {
                WsStep::Text(text) => write.send(Message::Text(text.into())).await?,
                WsStep::Pause(d) => {
                    let deadline = tokio::time::sleep(d);
                    tokio::pin!(deadline);
                    loop {
                        tokio::select! {
                            () = &mut deadline => break,
                            Some(data) = pong_rx.recv() => write.send(Message::Pong(data)).await?,
                        }
                    }
                }
                WsStep::Close => {
                    let _ = write.send(Message::Close(None)).await;
                    recorder.abort();
                    return Ok(());
                }
                WsStep::Drop => {
                    recorder.abort();
                    return Ok(());
                }
            }
        }

        // Script exhausted: keep answering pings until the client leaves.
        tokio::pin!(recorder);
        loop {
            tokio::select! {
                _ = &mut recorder => break,
                Some(data) = pong_rx.recv() => {
                    if write.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
