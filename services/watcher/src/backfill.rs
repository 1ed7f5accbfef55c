//! Gap-fill fetches over the side HTTP channel.
//!
//! The stream hands `oob_include` URLs to a single worker task, which
//! fetches them one at a time and pushes every `buffer_msg` through the
//! same [`Ingestor`] the live path uses. The read loop never waits on HTTP.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cw_protocol::{StreamFrame, decode_backlog};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, COOKIE};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::{AuthResult, USER_AGENT};
use crate::ingest::{IngestOutcome, Ingestor};
use crate::shutdown;

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backlog returned HTTP {0}")]
    Status(u16),
    #[error("malformed backlog: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Tally of one backlog batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// `buffer_msg` entries considered (after the batch cap).
    pub received: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub filtered: usize,
    pub failed: usize,
}

/// Absolute URL for a backlog reference.
///
/// Relative references are joined to `api_host`, or to `fallback` when the
/// login response carried no API host.
pub fn resolve_url(url: &str, api_host: &str, fallback: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_owned();
    }
    let base = if api_host.is_empty() { fallback } else { api_host };
    let base = base.trim_end_matches('/');
    if url.starts_with('/') {
        format!("{base}{url}")
    } else {
        format!("{base}/{url}")
    }
}

pub struct BackfillFetcher {
    client: reqwest::Client,
    ingestor: Arc<Ingestor>,
    fallback_api_host: String,
    /// 0 means unlimited.
    max_batch_events: usize,
}

impl BackfillFetcher {
    pub fn new(
        ingestor: Arc<Ingestor>,
        fallback_api_host: impl Into<String>,
        max_batch_events: usize,
    ) -> Result<Self, BackfillError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(FETCH_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            ingestor,
            fallback_api_host: fallback_api_host.into(),
            max_batch_events,
        })
    }

    /// Fetch one backlog batch and ingest it.
    ///
    /// Per-message store failures are counted, not returned.
    pub async fn fetch(&self, url: &str, auth: &AuthResult) -> Result<BackfillReport, BackfillError> {
        let url = resolve_url(url, &auth.api_host, &self.fallback_api_host);
        info!(url = %url, "fetching backlog");

        let resp = self
            .client
            .get(&url)
            .header(COOKIE, format!("session={}", auth.session))
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(BackfillError::Status(status.as_u16()));
        }
        let bytes = resp.bytes().await?;
        let frames = decode_backlog(&bytes)?;

        let mut report = BackfillReport::default();
        let mut messages: Vec<_> = frames
            .into_iter()
            .filter_map(|f| match f {
                StreamFrame::BufferMsg(m) => Some(m),
                _ => None,
            })
            .collect();
        if self.max_batch_events != 0 && messages.len() > self.max_batch_events {
            warn!(
                limit = self.max_batch_events,
                skipped = messages.len() - self.max_batch_events,
                "backlog batch capped"
            );
            messages.truncate(self.max_batch_events);
        }

        for msg in &messages {
            report.received += 1;
            match self.ingestor.ingest(msg, Utc::now()) {
                Ok(IngestOutcome::Stored) => report.stored += 1,
                Ok(IngestOutcome::Duplicate) => report.duplicates += 1,
                Ok(IngestOutcome::Filtered) => report.filtered += 1,
                Err(_) => report.failed += 1,
            }
        }
        info!(
            received = report.received,
            stored = report.stored,
            duplicates = report.duplicates,
            filtered = report.filtered,
            failed = report.failed,
            "backlog processed"
        );
        Ok(report)
    }
}

#[derive(Debug)]
struct BackfillJob {
    url: String,
    auth: AuthResult,
}

/// Queue into the backfill worker. Cheap to clone.
#[derive(Clone)]
pub struct BackfillHandle {
    tx: mpsc::UnboundedSender<BackfillJob>,
}

impl BackfillHandle {
    /// Enqueue a fetch. Returns `false` if the worker has stopped.
    pub fn submit(&self, url: impl Into<String>, auth: &AuthResult) -> bool {
        self.tx
            .send(BackfillJob {
                url: url.into(),
                auth: auth.clone(),
            })
            .is_ok()
    }
}

/// Start the sequential worker. It exits when shutdown is signalled or
/// every [`BackfillHandle`] has been dropped.
pub fn spawn_worker(
    fetcher: BackfillFetcher,
    mut shutdown_rx: watch::Receiver<bool>,
) -> (BackfillHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<BackfillJob>();
    let task = tokio::spawn(async move {
        loop {
            let job = tokio::select! {
                () = shutdown::requested(&mut shutdown_rx) => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            tokio::select! {
                () = shutdown::requested(&mut shutdown_rx) => break,
                result = fetcher.fetch(&job.url, &job.auth) => {
                    if let Err(e) = result {
                        warn!(url = %job.url, error = %e, "backfill failed");
                    }
                }
            }
        }
    });
    (BackfillHandle { tx }, task)
}
