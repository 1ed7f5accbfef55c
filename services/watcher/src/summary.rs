//! Daily summaries of stored messages.
//!
//! The generator is a strategy: [`PlainSummary`] formats the filtered lines
//! grouped by channel. [`DailySchedule`] decides when the writer runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Timelike, Utc};
use regex::Regex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info};

use crate::shutdown;
use crate::storage::{MessageStore, PersistedMessage, StorageError};

static JOIN_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(-->|<--|\*{3})\s*(.*?)\s+(has joined|has left|has quit|joined|left|quit)")
        .expect("join/part pattern")
});
static MODE_CHANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(-->|<--|\*{3})\s*.*?\s+(sets mode|was kicked|was banned)").expect("mode pattern")
});
static NICK_CHANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(-->|<--|\*{3})\s*.*?\s+is now known as").expect("nick pattern")
});
static TOPIC_CHANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(-->|<--|\*{3})\s*.*?\s+(changed the topic|set the topic)").expect("topic pattern")
});
static BOT_SENDER: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"(?i)^(bot|github|travis|ci|deploy|monitor|alert|status|feed|rss)")
            .expect("bot prefix pattern"),
        Regex::new(r"(?i)bot$").expect("bot suffix pattern"),
    ]
});

/// Topic lines at least this long are kept.
const SUBSTANTIAL_TOPIC_LEN: usize = 100;
const MIN_BODY_LEN: usize = 10;

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("writing summary: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid schedule '{expr}': {reason}")]
pub struct ScheduleError {
    pub expr: String,
    pub reason: String,
}

/// Turns a window of messages into report text.
pub trait SummaryGenerator: Send + Sync {
    fn generate(&self, messages: &[PersistedMessage], now: DateTime<Utc>) -> String;
}

/// Markdown report without any text-generation backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainSummary;

impl SummaryGenerator for PlainSummary {
    fn generate(&self, messages: &[PersistedMessage], now: DateTime<Utc>) -> String {
        let mut by_channel: BTreeMap<&str, Vec<&PersistedMessage>> = BTreeMap::new();
        for m in messages.iter().filter(|m| !is_noise(m)) {
            by_channel.entry(m.channel.as_str()).or_default().push(m);
        }

        let mut out = format!("# Daily IRC Summary - {}\n\n", now.format("%B %-d, %Y"));
        out.push_str("*Generated using basic text formatting*\n\n");
        for (channel, mut lines) in by_channel {
            lines.sort_by_key(|m| (m.timestamp, m.eid));
            out.push_str(&format!("## Summary for {channel}\n\n"));
            for m in lines {
                out.push_str(&format!(
                    "[{}] <{}> {}\n",
                    m.timestamp.format("%H:%M"),
                    m.sender,
                    m.body
                ));
            }
            out.push('\n');
        }
        out
    }
}

/// Join/part, mode, nick and short topic notices, bot senders, and lines
/// too short to carry content.
pub fn is_noise(m: &PersistedMessage) -> bool {
    let body = m.body.trim();
    if body.is_empty()
        || JOIN_PART.is_match(&m.body)
        || MODE_CHANGE.is_match(&m.body)
        || NICK_CHANGE.is_match(&m.body)
    {
        return true;
    }
    if TOPIC_CHANGE.is_match(&m.body) && m.body.len() < SUBSTANTIAL_TOPIC_LEN {
        return true;
    }
    if BOT_SENDER.iter().any(|re| re.is_match(&m.sender)) {
        return true;
    }
    body.len() < MIN_BODY_LEN
}

/// Summarize the 24 hours before `now` into `output`.
///
/// Returns how many stored messages the window held. Nothing is written
/// when the window is empty.
pub fn write_daily_summary(
    store: &dyn MessageStore,
    generator: &dyn SummaryGenerator,
    output: &Path,
    now: DateTime<Utc>,
) -> Result<usize, SummaryError> {
    let messages = store.query_by_time_range(now - ChronoDuration::hours(24), now)?;
    if messages.is_empty() {
        info!("no messages in the last 24 hours, summary skipped");
        return Ok(0);
    }
    let text = generator.generate(&messages, now);
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, text)?;
    info!(path = %output.display(), messages = messages.len(), "summary written");
    Ok(messages.len())
}

/// A five-field cron expression restricted to `M H * * *`.
///
/// Minute and hour are either a number or `*`; the other three fields must
/// be `*`. Times are UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    minute: Option<u32>,
    hour: Option<u32>,
}

impl DailySchedule {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let fail = |reason: &str| ScheduleError {
            expr: expr.to_owned(),
            reason: reason.to_owned(),
        };
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(fail("expected 5 fields"));
        };
        if [dom, month, dow].iter().any(|f| **f != "*") {
            return Err(fail("only minute and hour may be set"));
        }
        let field = |raw: &str, max: u32, name: &str| -> Result<Option<u32>, ScheduleError> {
            if raw == "*" {
                return Ok(None);
            }
            match raw.parse::<u32>() {
                Ok(v) if v <= max => Ok(Some(v)),
                _ => Err(fail(&format!("bad {name} '{raw}'"))),
            }
        };
        Ok(Self {
            minute: field(*minute, 59, "minute")?,
            hour: field(*hour, 23, "hour")?,
        })
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let start = after
            .duration_trunc(ChronoDuration::minutes(1))
            .unwrap_or(after)
            + ChronoDuration::minutes(1);
        (0..24 * 60)
            .map(|i| start + ChronoDuration::minutes(i))
            .find(|t| self.matches(*t))
            .unwrap_or(start)
    }

    fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minute.is_none_or(|m| t.minute() == m) && self.hour.is_none_or(|h| t.hour() == h)
    }
}

/// Write a summary at every scheduled time until shutdown.
pub async fn run_summary_schedule(
    schedule: DailySchedule,
    store: Arc<dyn MessageStore>,
    generator: Arc<dyn SummaryGenerator>,
    output: PathBuf,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut after = Utc::now();
    loop {
        let next = schedule.next_after(after);
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        info!(next = %next, "next summary scheduled");
        tokio::select! {
            () = shutdown::requested(&mut shutdown_rx) => break,
            () = tokio::time::sleep(wait) => {}
        }
        let now = Utc::now().max(next);
        if let Err(e) = write_daily_summary(store.as_ref(), generator.as_ref(), &output, now) {
            error!(error = %e, "scheduled summary failed");
        }
        after = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn msg(chan: &str, sender: &str, body: &str, h: u32, m: u32) -> PersistedMessage {
        let ts = Utc.with_ymd_and_hms(2026, 3, 14, h, m, 0).unwrap();
        PersistedMessage::new(i64::from(h * 60 + m), 0, chan, sender, body, ts)
    }

    #[test]
    fn noise_is_filtered() {
        let noisy = [
            msg("#a", "x", "--> alice has joined #a", 1, 0),
            msg("#a", "x", "<-- bob has quit (Ping timeout)", 1, 0),
            msg("#a", "x", "*** carol sets mode +o dave", 1, 0),
            msg("#a", "x", "*** erin is now known as erin_", 1, 0),
            msg("#a", "x", "*** frank changed the topic to: hi", 1, 0),
            msg("#a", "github", "pushed 3 commits to main", 1, 0),
            msg("#a", "MergeBot", "merged pull request #12", 1, 0),
            msg("#a", "x", "ok thanks", 1, 0),
            msg("#a", "x", "   ", 1, 0),
        ];
        for m in &noisy {
            assert!(is_noise(m), "should be noise: {} / {}", m.sender, m.body);
        }
        let long_topic = format!("*** frank changed the topic to: {}", "x".repeat(100));
        assert!(!is_noise(&msg("#a", "frank", &long_topic, 1, 0)));
        assert!(!is_noise(&msg("#a", "alice", "has anyone tried the new release?", 1, 0)));
    }

    #[test]
    fn plain_summary_groups_by_channel_in_time_order() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 6, 0, 0).unwrap();
        let messages = vec![
            msg("#zeta", "bob", "the deploy went out fine", 3, 5),
            msg("#alpha", "alice", "second line in alpha", 2, 30),
            msg("#alpha", "alice", "first line in alpha", 1, 15),
            msg("#alpha", "x", "short", 1, 16),
        ];
        let text = PlainSummary.generate(&messages, now);
        assert_eq!(
            text,
            "# Daily IRC Summary - March 14, 2026\n\n\
             *Generated using basic text formatting*\n\n\
             ## Summary for #alpha\n\n\
             [01:15] <alice> first line in alpha\n\
             [02:30] <alice> second line in alpha\n\n\
             ## Summary for #zeta\n\n\
             [03:05] <bob> the deploy went out fine\n\n"
        );
    }

    #[test]
    fn schedule_parses_daily_cron() {
        let s = DailySchedule::parse("0 6 * * *").unwrap();
        let at = |h, m| Utc.with_ymd_and_hms(2026, 3, 14, h, m, 0).unwrap();
        assert_eq!(s.next_after(at(5, 59)), at(6, 0));
        assert_eq!(
            s.next_after(at(6, 0)),
            Utc.with_ymd_and_hms(2026, 3, 15, 6, 0, 0).unwrap()
        );
    }

    #[test]
    fn schedule_with_wildcard_hour_fires_hourly() {
        let s = DailySchedule::parse("30 * * * *").unwrap();
        let t = Utc.with_ymd_and_hms(2026, 3, 14, 10, 45, 12).unwrap();
        assert_eq!(
            s.next_after(t),
            Utc.with_ymd_and_hms(2026, 3, 14, 11, 30, 0).unwrap()
        );
    }

    #[test]
    fn schedule_rejects_unsupported_expressions() {
        for bad in ["", "0 6 * *", "0 6 1 * *", "60 6 * * *", "0 24 * * *", "a b * * *"] {
            assert!(DailySchedule::parse(bad).is_err(), "accepted {bad:?}");
        }
    }
}
