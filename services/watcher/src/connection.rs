//! Connection lifecycle: authenticate, dial, hand off to the stream loop,
//! and reconnect with backoff when the loop fails.
//!
//! # States
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connected
//! Connecting/Reconnecting -> Error        (attempts exhausted)
//! any -> Disconnected                     (close, terminal)
//! ```
//!
//! The de-duplication cache and `last_seen_eid` live in the stream
//! processor's ingestor and so survive every reconnect.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::auth::{AuthError, AuthResult, Authenticator, Credentials, Endpoints, stream_url};
use crate::backoff::RetryPolicy;
use crate::session_cache::{DEFAULT_FRESHNESS, Expiring};
use crate::shutdown;
use crate::stream::StreamProcessor;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(45);

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub retry: RetryPolicy,
    /// Bound on the WebSocket handshake.
    pub connect_timeout: Duration,
    /// How long a login is reused before re-authenticating.
    pub auth_freshness: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auth_freshness: DEFAULT_FRESHNESS,
        }
    }
}

/// Why a single connection attempt failed.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("authentication: {0}")]
    Auth(#[from] AuthError),
    #[error("invalid stream request: {0}")]
    Request(String),
    #[error("dial: {0}")]
    Dial(#[source] WsError),
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("giving up after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        #[source]
        last_error: AttemptError,
    },
    #[error("connection cancelled")]
    Cancelled,
    #[error("no credentials to reconnect with")]
    NoCredentials,
}

/// An open stream plus the login it was opened with.
pub struct LiveConnection {
    pub stream: WsStream,
    pub auth: AuthResult,
}

pub struct ConnectionManager {
    authenticator: Authenticator,
    processor: StreamProcessor,
    settings: ConnectionSettings,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
    retry_count: AtomicU32,
    credentials: Mutex<Option<Credentials>>,
    auth_cache: Mutex<Option<Expiring<AuthResult>>>,
    last_connected: Mutex<Option<DateTime<Utc>>>,
}

impl ConnectionManager {
    /// `shutdown_tx` is the process-wide cancellation signal; `close` sets it.
    pub fn new(
        authenticator: Authenticator,
        processor: StreamProcessor,
        settings: ConnectionSettings,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            authenticator,
            processor,
            settings,
            state_tx,
            shutdown_tx,
            closed: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
            credentials: Mutex::new(None),
            auth_cache: Mutex::new(None),
            last_connected: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn last_connected(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_connected)
    }

    pub fn processor(&self) -> &StreamProcessor {
        &self.processor
    }

    /// Authenticate (or reuse a fresh login) and open the stream, retrying
    /// with backoff. The first attempt is immediate.
    pub async fn connect(&self, creds: &Credentials) -> Result<LiveConnection, ConnectionError> {
        *lock(&self.credentials) = Some(creds.clone());
        self.retry_count.store(0, Ordering::SeqCst);
        self.establish(false).await
    }

    /// Connect, process, and reconnect until shutdown or retries run out.
    ///
    /// Returns `Ok(())` on shutdown.
    pub async fn run(&self, creds: &Credentials) -> Result<(), ConnectionError> {
        let mut live = match self.connect(creds).await {
            Ok(live) => live,
            Err(ConnectionError::Cancelled) => {
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        loop {
            let result = self
                .processor
                .run(live.stream, &live.auth, self.shutdown_receiver())
                .await;
            // The socket was moved into the loop and is gone by now.
            if self.is_shutting_down() {
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }
            match result {
                Ok(()) => return Ok(()),
                Err(e) => warn!(error = %e, "stream lost"),
            }

            self.retry_count.store(0, Ordering::SeqCst);
            live = match self.establish(true).await {
                Ok(live) => live,
                Err(ConnectionError::Cancelled) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
        }
    }

    /// Stop everything. Safe to call repeatedly.
    pub fn close(&self) {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);
        self.set_state(ConnectionState::Disconnected);
        if first {
            info!("connection manager closed");
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || *self.shutdown_tx.borrow()
    }

    /// Attempt loop shared by the initial connect and reconnects.
    ///
    /// A reconnect waits `delay_for(n)` before every attempt, including the
    /// first, so a server that accepts then drops at once cannot cause a hot
    /// loop. An initial connect skips the wait on attempt 0.
    async fn establish(&self, reconnecting: bool) -> Result<LiveConnection, ConnectionError> {
        let creds = lock(&self.credentials)
            .clone()
            .ok_or(ConnectionError::NoCredentials)?;
        let max_attempts = self.settings.retry.max_attempts.max(1);
        let mut shutdown_rx = self.shutdown_receiver();
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if self.is_shutting_down() {
                return Err(ConnectionError::Cancelled);
            }
            self.retry_count.store(attempt, Ordering::SeqCst);

            if reconnecting || attempt > 0 {
                self.set_state(ConnectionState::Reconnecting);
                let delay = self.settings.retry.delay_for(attempt);
                info!(attempt, delay = ?delay, "retrying connection");
                tokio::select! {
                    () = shutdown::requested(&mut shutdown_rx) => return Err(ConnectionError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            } else {
                self.set_state(ConnectionState::Connecting);
            }

            let result = tokio::select! {
                () = shutdown::requested(&mut shutdown_rx) => return Err(ConnectionError::Cancelled),
                r = self.attempt(&creds) => r,
            };
            match result {
                Ok(live) => {
                    if self.is_shutting_down() {
                        return Err(ConnectionError::Cancelled);
                    }
                    self.set_state(ConnectionState::Connected);
                    *lock(&self.last_connected) = Some(Utc::now());
                    self.retry_count.store(0, Ordering::SeqCst);
                    return Ok(live);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "connection attempt failed");
                    last_error = Some(e);
                }
            }
        }

        self.set_state(ConnectionState::Error);
        match last_error {
            Some(last_error) => Err(ConnectionError::Exhausted {
                attempts: max_attempts,
                last_error,
            }),
            None => Err(ConnectionError::Cancelled),
        }
    }

    async fn attempt(&self, creds: &Credentials) -> Result<LiveConnection, AttemptError> {
        let auth = self.fresh_auth(creds).await?;
        let endpoints = self.authenticator.endpoints();
        let url = stream_url(&auth, endpoints);
        let request = build_stream_request(&url, &auth, endpoints)?;

        let stream = match tokio::time::timeout(self.settings.connect_timeout, connect_async(request)).await {
            Err(_) => return Err(AttemptError::Timeout(self.settings.connect_timeout)),
            Ok(Err(e)) => {
                if let WsError::Http(resp) = &e {
                    warn!(status = resp.status().as_u16(), "stream upgrade rejected");
                }
                return Err(AttemptError::Dial(e));
            }
            Ok(Ok((stream, _response))) => stream,
        };
        info!(url = %url, "stream connected");
        Ok(LiveConnection { stream, auth })
    }

    async fn fresh_auth(&self, creds: &Credentials) -> Result<AuthResult, AuthError> {
        let cached = lock(&self.auth_cache)
            .as_ref()
            .and_then(|c| c.get(Instant::now()))
            .cloned();
        if let Some(auth) = cached {
            debug!("reusing cached login");
            return Ok(auth);
        }
        let auth = self.authenticator.authenticate(creds).await?;
        *lock(&self.auth_cache) = Some(Expiring::new(
            auth.clone(),
            Instant::now(),
            self.settings.auth_freshness,
        ));
        Ok(auth)
    }

    /// Writes are refused after `close`, except the final `Disconnected`.
    fn set_state(&self, next: ConnectionState) {
        if next != ConnectionState::Disconnected && self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!(from = %current, to = %next, "connection state");
            *current = next;
            true
        });
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Upgrade request carrying origin, user agent and the session cookie.
fn build_stream_request(
    url: &str,
    auth: &AuthResult,
    endpoints: &Endpoints,
) -> Result<Request, AttemptError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| AttemptError::Request(format!("invalid URL '{url}': {e}")))?;
    let header = |value: &str| {
        HeaderValue::from_str(value).map_err(|e| AttemptError::Request(format!("invalid header: {e}")))
    };
    let headers = request.headers_mut();
    headers.insert("Origin", header(&endpoints.origin)?);
    headers.insert("User-Agent", header(&endpoints.user_agent)?);
    headers.insert("Cookie", header(&format!("session={}", auth.session))?);
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_display_lowercase() {
        let names: Vec<String> = [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Error,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(
            names,
            ["disconnected", "connecting", "connected", "reconnecting", "error"]
        );
    }

    #[test]
    fn stream_request_carries_identity_headers() {
        let auth = AuthResult {
            session: "2.abc".to_owned(),
            uid: 1,
            api_host: String::new(),
            stream_host: "api-2.example.com".to_owned(),
            stream_path: "/websocket/2".to_owned(),
        };
        let endpoints = Endpoints::default();
        let req = build_stream_request(&stream_url(&auth, &endpoints), &auth, &endpoints).unwrap();
        assert_eq!(req.uri().host(), Some("api-2.example.com"));
        assert_eq!(req.headers()["cookie"], "session=2.abc");
        assert_eq!(req.headers()["origin"], "https://www.irccloud.com");
        assert!(req.headers()["user-agent"].to_str().unwrap().starts_with("watcher/"));
    }

    #[test]
    fn bad_session_value_is_a_request_error() {
        let auth = AuthResult {
            session: "bad\nvalue".to_owned(),
            uid: 1,
            api_host: String::new(),
            stream_host: "h".to_owned(),
            stream_path: "/p".to_owned(),
        };
        let endpoints = Endpoints::default();
        assert!(matches!(
            build_stream_request("wss://h/p", &auth, &endpoints),
            Err(AttemptError::Request(_))
        ));
    }
}
