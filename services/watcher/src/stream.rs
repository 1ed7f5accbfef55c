//! Stream read loop.
//!
//! One `select!` services, in turn: the next frame, the heartbeat tick, the
//! ping tick and shutdown. Frames are handled strictly in arrival order.
//!
//! # Exit conditions
//! - shutdown: best-effort close frame, `Ok(())`
//! - read error, close frame, end of stream, failed heartbeat or ping:
//!   `Err(StreamError)`; the caller decides whether to reconnect

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cw_protocol::{HeartbeatRequest, StreamFrame};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::auth::AuthResult;
use crate::backfill::BackfillHandle;
use crate::ingest::{IngestOutcome, Ingestor};
use crate::shutdown;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub heartbeat_interval: Duration,
    pub ping_interval: Duration,
    /// Echo every raw frame at info level.
    pub debug: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            ping_interval: DEFAULT_PING_INTERVAL,
            debug: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("read failed: {0}")]
    Read(#[source] WsError),
    #[error("stream closed by server")]
    Closed,
    #[error("heartbeat send failed: {0}")]
    Heartbeat(#[source] WsError),
    #[error("ping send failed: {0}")]
    Ping(#[source] WsError),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What a single text frame turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Message(IngestOutcome),
    StoreFailed,
    BackfillQueued,
    /// Gap-fill signal with no worker to take it.
    BackfillDropped,
    Ignored,
    Malformed,
}

pub struct StreamProcessor {
    ingestor: Arc<Ingestor>,
    backfill: Option<BackfillHandle>,
    settings: StreamSettings,
}

impl StreamProcessor {
    pub fn new(
        ingestor: Arc<Ingestor>,
        backfill: Option<BackfillHandle>,
        settings: StreamSettings,
    ) -> Self {
        Self {
            ingestor,
            backfill,
            settings,
        }
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    /// Consume `ws` until it fails or shutdown is signalled.
    pub async fn run<S>(
        &self,
        mut ws: S,
        auth: &AuthResult,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), StreamError>
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    {
        let mut heartbeat = ticker(self.settings.heartbeat_interval);
        let mut ping = ticker(self.settings.ping_interval);

        loop {
            tokio::select! {
                biased;
                () = shutdown::requested(&mut shutdown_rx) => {
                    info!("shutdown requested, closing stream");
                    let _ = ws.send(Message::Close(None)).await;
                    return Ok(());
                }
                frame = ws.next() => match frame {
                    None => return Err(StreamError::Closed),
                    Some(Err(e)) => return Err(StreamError::Read(e)),
                    Some(Ok(Message::Text(text))) => {
                        self.handle_text(text.as_str(), auth);
                    }
                    // tungstenite queues the pong itself and flushes it on the next read.
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "server sent close");
                        return Err(StreamError::Closed);
                    }
                    Some(Ok(_)) => {}
                },
                _ = heartbeat.tick() => {
                    let hb = HeartbeatRequest::new(Utc::now().timestamp(), self.ingestor.last_seen_eid());
                    let json = serde_json::to_string(&hb)?;
                    ws.send(Message::Text(json.into())).await.map_err(StreamError::Heartbeat)?;
                    debug!(last_seen_eid = hb.last_seen_eid, "heartbeat sent");
                }
                _ = ping.tick() => {
                    ws.send(Message::Ping("ping".into())).await.map_err(StreamError::Ping)?;
                    debug!("ping sent");
                }
            }
        }
    }

    /// Decode and route one text frame. Never fails; problems are logged.
    pub fn handle_text(&self, text: &str, auth: &AuthResult) -> FrameOutcome {
        if self.settings.debug {
            info!(frame = text, "raw frame");
        }
        let frame = match StreamFrame::from_json(text) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "unparsable frame");
                return FrameOutcome::Malformed;
            }
        };
        match frame {
            StreamFrame::BufferMsg(msg) => match self.ingestor.ingest(&msg, Utc::now()) {
                Ok(outcome) => FrameOutcome::Message(outcome),
                Err(_) => FrameOutcome::StoreFailed,
            },
            StreamFrame::OobInclude(oob) => {
                let queued = self
                    .backfill
                    .as_ref()
                    .is_some_and(|b| b.submit(oob.url.as_str(), auth));
                if queued {
                    info!(url = %oob.url, "backfill queued");
                    FrameOutcome::BackfillQueued
                } else {
                    warn!(url = %oob.url, "backfill worker unavailable, gap not filled");
                    FrameOutcome::BackfillDropped
                }
            }
            StreamFrame::Other => FrameOutcome::Ignored,
        }
    }
}

/// Interval whose first tick is one full period away.
fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
