//! Core domain model for jobpoll: listings, per-source polling metadata, stats.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jobpoll-core";

pub const DEFAULT_MIN_POLL_INTERVAL_MINUTES: u32 = 5;
pub const DEFAULT_MAX_POLL_INTERVAL_MINUTES: u32 = 360;
pub const DEFAULT_POLL_INTERVAL_MINUTES: u32 = 30;

/// Stable identifier of a polled source. Derived from the source URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceKey(String);

impl SourceKey {
    pub fn from_url(url: &str) -> Self {
        Self(url.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inclusive bounds plus the starting value for a source's poll interval, in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalBounds {
    pub min_minutes: u32,
    pub max_minutes: u32,
    pub default_minutes: u32,
}

impl Default for IntervalBounds {
    fn default() -> Self {
        Self {
            min_minutes: DEFAULT_MIN_POLL_INTERVAL_MINUTES,
            max_minutes: DEFAULT_MAX_POLL_INTERVAL_MINUTES,
            default_minutes: DEFAULT_POLL_INTERVAL_MINUTES,
        }
    }
}

impl IntervalBounds {
    pub fn clamp(&self, minutes: u32) -> u32 {
        minutes.clamp(self.min_minutes, self.max_minutes)
    }

    /// Returns `None` when the bounds are unusable (`min == 0` or `min > max`).
    pub fn validated(self) -> Option<Self> {
        if self.min_minutes == 0 || self.min_minutes > self.max_minutes {
            return None;
        }
        Some(Self {
            default_minutes: self.clamp(self.default_minutes),
            ..self
        })
    }

    /// Narrow these bounds with optional per-source overrides, staying inside the originals.
    pub fn narrowed(self, min_override: Option<u32>, max_override: Option<u32>) -> Self {
        let min_minutes = min_override
            .map(|m| self.clamp(m))
            .unwrap_or(self.min_minutes);
        let max_minutes = max_override
            .map(|m| self.clamp(m))
            .unwrap_or(self.max_minutes)
            .max(min_minutes);
        let default_minutes = self.default_minutes.clamp(min_minutes, max_minutes);
        Self {
            min_minutes,
            max_minutes,
            default_minutes,
        }
    }
}

/// What the scheduler needs to know to poll one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTarget {
    pub key: SourceKey,
    pub source_url: String,
    pub source_name: String,
    pub bounds: IntervalBounds,
}

impl PollTarget {
    pub fn new(source_url: impl Into<String>, source_name: impl Into<String>, bounds: IntervalBounds) -> Self {
        let source_url = source_url.into();
        Self {
            key: SourceKey::from_url(&source_url),
            source_url,
            source_name: source_name.into(),
            bounds,
        }
    }
}

/// One listing as handed over by a parser. Only some fields feed the content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Listing {
    pub id: String,
    #[serde(alias = "position_title", alias = "positionTitle")]
    pub title: String,
    #[serde(alias = "companyName")]
    pub company_name: String,
    #[serde(alias = "applicationUrl")]
    pub application_url: String,
    /// Upstream freshness marker, kept verbatim.
    #[serde(default, alias = "updatedAt")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub scraped_at: Option<DateTime<Utc>>,
}

/// Persisted polling state for a single source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub source_key: SourceKey,
    pub source_url: String,
    pub source_name: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_change_at: Option<DateTime<Utc>>,
    pub consecutive_unchanged_polls: u32,
    pub total_polls: u64,
    pub total_changes: u64,
    pub current_poll_interval_minutes: u32,
    pub min_poll_interval_minutes: u32,
    pub max_poll_interval_minutes: u32,
    pub last_status_code: Option<u16>,
    pub last_response_time_ms: Option<u64>,
    pub content_hash: Option<String>,
    pub last_job_count: u64,
}

impl SourceMetadata {
    /// Fresh, never-polled record.
    pub fn new(target: &PollTarget) -> Self {
        Self {
            source_key: target.key.clone(),
            source_url: target.source_url.clone(),
            source_name: target.source_name.clone(),
            etag: None,
            last_modified: None,
            last_poll_at: None,
            last_change_at: None,
            consecutive_unchanged_polls: 0,
            total_polls: 0,
            total_changes: 0,
            current_poll_interval_minutes: target.bounds.clamp(target.bounds.default_minutes),
            min_poll_interval_minutes: target.bounds.min_minutes,
            max_poll_interval_minutes: target.bounds.max_minutes,
            last_status_code: None,
            last_response_time_ms: None,
            content_hash: None,
            last_job_count: 0,
        }
    }

    /// Adopt configured bounds for a record restored from storage, keeping the interval inside them.
    pub fn apply_bounds(&mut self, bounds: IntervalBounds) {
        self.min_poll_interval_minutes = bounds.min_minutes;
        self.max_poll_interval_minutes = bounds.max_minutes;
        self.current_poll_interval_minutes = bounds.clamp(self.current_poll_interval_minutes);
    }

    pub fn change_rate(&self) -> f64 {
        if self.total_polls == 0 {
            0.0
        } else {
            self.total_changes as f64 / self.total_polls as f64
        }
    }
}

/// Read-only diagnostic snapshot served by the status surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingStats {
    pub source_name: String,
    pub source_url: String,
    pub total_polls: u64,
    pub total_changes: u64,
    pub change_rate: f64,
    pub consecutive_unchanged_polls: u32,
    pub current_poll_interval_minutes: u32,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_change_at: Option<DateTime<Utc>>,
    pub last_job_count: u64,
    pub last_status_code: Option<u16>,
    pub last_response_time_ms: Option<u64>,
}

impl From<&SourceMetadata> for PollingStats {
    fn from(meta: &SourceMetadata) -> Self {
        Self {
            source_name: meta.source_name.clone(),
            source_url: meta.source_url.clone(),
            total_polls: meta.total_polls,
            total_changes: meta.total_changes,
            change_rate: meta.change_rate(),
            consecutive_unchanged_polls: meta.consecutive_unchanged_polls,
            current_poll_interval_minutes: meta.current_poll_interval_minutes,
            last_poll_at: meta.last_poll_at,
            last_change_at: meta.last_change_at,
            last_job_count: meta.last_job_count,
            last_status_code: meta.last_status_code,
            last_response_time_ms: meta.last_response_time_ms,
        }
    }
}
