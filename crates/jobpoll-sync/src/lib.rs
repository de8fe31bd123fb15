//! Adaptive polling pipeline: metadata repository, delta detection, interval scheduling
//! and the per-source fetch → detect → adjust → save cycle.

use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use jobpoll_core::{IntervalBounds, Listing, PollTarget, PollingStats, SourceKey, SourceMetadata};
use jobpoll_sources::{
    listings_updated_since, load_source_registry, parser_for, ListingParser, ParserConfig,
    SourceConfig, SourceRegistry,
};
use jobpoll_storage::{
    ConditionalFetcher, FetchOutcome, FetcherConfig, FileMetadataStore, MetadataStore,
    PgMetadataStore, TokenBucketConfig,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "jobpoll-sync";

/// Unchanged polls in a row required before the interval backs off.
pub const BACKOFF_AFTER_UNCHANGED_POLLS: u32 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid poll interval bounds: min={min} max={max} (need 1 <= min <= max)")]
    InvalidBounds { min: u32, max: u32 },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub bounds: IntervalBounds,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub concurrency: usize,
    pub tick_secs: u64,
    pub requests_per_minute: Option<u32>,
    pub database_url: Option<String>,
    pub metadata_dir: Option<PathBuf>,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bounds: IntervalBounds::default(),
            http_timeout_secs: 30,
            user_agent: FetcherConfig::default().user_agent,
            concurrency: 8,
            tick_secs: 60,
            requests_per_minute: None,
            database_url: None,
            metadata_dir: None,
            workspace_root: PathBuf::from("."),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let min = env_parse("JOBPOLL_MIN_POLL_MINUTES").unwrap_or(defaults.bounds.min_minutes);
        let max = env_parse("JOBPOLL_MAX_POLL_MINUTES").unwrap_or(defaults.bounds.max_minutes);
        let bounds = IntervalBounds {
            min_minutes: min,
            max_minutes: max,
            default_minutes: env_parse("JOBPOLL_DEFAULT_POLL_MINUTES")
                .unwrap_or(defaults.bounds.default_minutes),
        }
        .validated()
        .ok_or(ConfigError::InvalidBounds { min, max })?;

        Ok(Self {
            bounds,
            http_timeout_secs: env_parse("JOBPOLL_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("JOBPOLL_USER_AGENT").unwrap_or(defaults.user_agent),
            concurrency: env_parse("JOBPOLL_CONCURRENCY").unwrap_or(defaults.concurrency),
            tick_secs: env_parse("JOBPOLL_TICK_SECS").unwrap_or(defaults.tick_secs),
            requests_per_minute: env_parse("JOBPOLL_REQUESTS_PER_MINUTE"),
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            metadata_dir: std::env::var("JOBPOLL_METADATA_DIR").ok().map(PathBuf::from),
            workspace_root: std::env::var("JOBPOLL_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        })
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            concurrency: self.concurrency,
            token_bucket: self
                .requests_per_minute
                .filter(|rpm| *rpm > 0)
                .map(|rpm| TokenBucketConfig {
                    capacity: rpm,
                    refill_every: Duration::from_secs(60) / rpm,
                }),
        }
    }
}

/// Picks the durable store: Postgres if `DATABASE_URL` is set, else a metadata
/// directory, else none (in-memory only).
pub async fn open_metadata_store(config: &SyncConfig) -> Result<Option<Arc<dyn MetadataStore>>> {
    if let Some(url) = &config.database_url {
        let store = PgMetadataStore::connect(url)
            .await
            .context("connecting to metadata database")?;
        store
            .ensure_schema()
            .await
            .context("ensuring source_polling_metadata schema")?;
        return Ok(Some(Arc::new(store)));
    }
    if let Some(dir) = &config.metadata_dir {
        return Ok(Some(Arc::new(FileMetadataStore::new(dir.clone()))));
    }
    warn!("no durable metadata store configured; polling state will not survive a restart");
    Ok(None)
}

type Published = Arc<RwLock<HashMap<SourceKey, SourceMetadata>>>;

fn publish(published: &Published, metadata: &SourceMetadata) {
    let mut map = published.write().unwrap_or_else(PoisonError::into_inner);
    map.insert(metadata.source_key.clone(), metadata.clone());
}

/// Exclusive handle on one source's cached metadata; other cycles for the
/// same source wait until it is dropped. Dropping it publishes the record
/// for lock-free readers.
pub struct SourceGuard {
    record: OwnedMappedMutexGuard<Option<SourceMetadata>, SourceMetadata>,
    published: Published,
}

impl Deref for SourceGuard {
    type Target = SourceMetadata;

    fn deref(&self) -> &SourceMetadata {
        &self.record
    }
}

impl DerefMut for SourceGuard {
    fn deref_mut(&mut self) -> &mut SourceMetadata {
        &mut self.record
    }
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        publish(&self.published, &self.record);
    }
}

type Slot = Arc<Mutex<Option<SourceMetadata>>>;

/// In-process cache of source metadata in front of an optional durable store.
///
/// Records are created lazily (store first, then defaults) and every save is
/// written through. Locking is per source key. Readers use [`snapshot`](Self::snapshot),
/// which never waits on an in-flight cycle.
///
/// A record whose durable load failed is "unconfirmed": it is never written back
/// (that would overwrite the stored history with defaults) and the load is retried
/// on the next [`lock`](Self::lock).
pub struct MetadataRepository {
    store: Option<Arc<dyn MetadataStore>>,
    entries: Mutex<HashMap<SourceKey, Slot>>,
    published: Published,
    unconfirmed: Mutex<HashSet<SourceKey>>,
}

impl MetadataRepository {
    pub fn new(store: Option<Arc<dyn MetadataStore>>) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
            published: Arc::new(RwLock::new(HashMap::new())),
            unconfirmed: Mutex::new(HashSet::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub fn is_durable(&self) -> bool {
        self.store.is_some()
    }

    async fn slot(&self, key: &SourceKey) -> Slot {
        let mut map = self.entries.lock().await;
        map.entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Get-or-create the record for `target` and hold it exclusively.
    pub async fn lock(&self, target: &PollTarget) -> SourceGuard {
        let slot = self.slot(&target.key).await;
        let mut guard: OwnedMutexGuard<Option<SourceMetadata>> = slot.lock_owned().await;
        let needs_load = guard.is_none() || self.unconfirmed.lock().await.contains(&target.key);
        if needs_load {
            match self.load_stored(target).await {
                Ok(Some(stored)) => {
                    *guard = Some(stored);
                    self.unconfirmed.lock().await.remove(&target.key);
                }
                Ok(None) => {
                    if guard.is_none() {
                        *guard = Some(SourceMetadata::new(target));
                    }
                    self.unconfirmed.lock().await.remove(&target.key);
                }
                Err(()) => {
                    if guard.is_none() {
                        *guard = Some(SourceMetadata::new(target));
                    }
                    self.unconfirmed.lock().await.insert(target.key.clone());
                }
            }
        }
        let record = OwnedMutexGuard::map(guard, |entry| {
            entry.get_or_insert_with(|| SourceMetadata::new(target))
        });
        if needs_load {
            publish(&self.published, &record);
        }
        SourceGuard {
            record,
            published: self.published.clone(),
        }
    }

    /// Current record, creating it if needed. Waits for any cycle holding the source.
    pub async fn get(&self, target: &PollTarget) -> SourceMetadata {
        self.lock(target).await.clone()
    }

    /// Last published state of a source. Does not wait for an in-flight cycle;
    /// only a never-seen source takes the lock to create its record.
    pub async fn snapshot(&self, target: &PollTarget) -> SourceMetadata {
        let published = self
            .published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&target.key)
            .cloned();
        match published {
            Some(metadata) => metadata,
            None => self.get(target).await,
        }
    }

    /// Persist a record obtained through [`lock`](Self::lock). The guard is the
    /// cached copy, so only publishing and the durable write remain. Store
    /// failures are logged and never surface to the caller.
    pub async fn save(&self, metadata: &SourceMetadata) {
        publish(&self.published, metadata);
        let Some(store) = &self.store else {
            return;
        };
        if self.unconfirmed.lock().await.contains(&metadata.source_key) {
            warn!(
                source_key = %metadata.source_key,
                backend = store.backend(),
                "stored record could not be loaded; skipping durable save"
            );
            return;
        }
        if let Err(err) = store.save(metadata).await {
            warn!(
                source_key = %metadata.source_key,
                backend = store.backend(),
                error = %err,
                "durable metadata save failed; in-memory state stays authoritative"
            );
        }
    }

    pub async fn cached_len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// `Err(())` means the store was unreachable; the error is logged here.
    async fn load_stored(&self, target: &PollTarget) -> Result<Option<SourceMetadata>, ()> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        match store.load(&target.key).await {
            Ok(Some(mut metadata)) => {
                metadata.apply_bounds(target.bounds);
                metadata.source_name = target.source_name.clone();
                debug!(source_key = %target.key, "restored metadata from {}", store.backend());
                Ok(Some(metadata))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                warn!(
                    source_key = %target.key,
                    backend = store.backend(),
                    error = %err,
                    "loading metadata failed; running on defaults until the store answers"
                );
                Err(())
            }
        }
    }
}

struct FingerprintEntry<'a> {
    id: &'a str,
    title: &'a str,
    company: &'a str,
    url: &'a str,
    updated_at: Option<&'a str>,
}

impl FingerprintEntry<'_> {
    fn sort_key(&self) -> (&str, &str, &str, &str, Option<&str>) {
        (self.id, self.title, self.company, self.url, self.updated_at)
    }

    /// Length-prefixed fields in fixed order, so no two entries share an encoding.
    fn feed(&self, hasher: &mut Sha256) {
        for field in [self.id, self.title, self.company, self.url] {
            feed_field(hasher, field);
        }
        match self.updated_at {
            Some(updated_at) => {
                hasher.update([1u8]);
                feed_field(hasher, updated_at);
            }
            None => hasher.update([0u8]),
        }
    }
}

fn feed_field(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_be_bytes());
    hasher.update(field.as_bytes());
}

/// Decides whether a listing set differs from the last one seen for a source.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaDetector;

impl DeltaDetector {
    /// SHA-256 over the id-sorted identity projection of `listings`.
    /// Descriptions, locations and scrape times do not contribute.
    pub fn fingerprint(listings: &[Listing]) -> String {
        let mut entries = listings
            .iter()
            .map(|l| FingerprintEntry {
                id: &l.id,
                title: &l.title,
                company: &l.company_name,
                url: &l.application_url,
                updated_at: l.updated_at.as_deref(),
            })
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let mut hasher = Sha256::new();
        hasher.update((entries.len() as u64).to_be_bytes());
        for entry in &entries {
            entry.feed(&mut hasher);
        }
        hex::encode(hasher.finalize())
    }

    /// Compare against the stored fingerprint and update counters. The first
    /// pass for a source always reports a change.
    pub fn detect(&self, metadata: &mut SourceMetadata, listings: &[Listing], now: DateTime<Utc>) -> bool {
        let current = Self::fingerprint(listings);
        let changed = metadata.content_hash.as_deref() != Some(current.as_str());

        metadata.content_hash = Some(current);
        metadata.last_job_count = listings.len() as u64;

        if changed {
            metadata.last_change_at = Some(now);
            metadata.total_changes += 1;
            metadata.consecutive_unchanged_polls = 0;
        } else {
            metadata.consecutive_unchanged_polls += 1;
        }
        changed
    }

    /// A 304 counts as an unchanged observation without touching the fingerprint.
    pub fn record_not_modified(&self, metadata: &mut SourceMetadata) {
        metadata.consecutive_unchanged_polls += 1;
    }
}

/// Interval after one poll: halve on change, grow by half after enough quiet
/// polls, otherwise keep. Always inside `[min, max]`.
pub fn next_interval(
    current: u32,
    consecutive_unchanged: u32,
    changed: bool,
    min: u32,
    max: u32,
) -> u32 {
    let current = u64::from(current);
    let next = if changed {
        current / 2
    } else if consecutive_unchanged >= BACKOFF_AFTER_UNCHANGED_POLLS {
        current * 3 / 2
    } else {
        current
    };
    u32::try_from(next).unwrap_or(u32::MAX).clamp(min, max.max(min))
}

/// Never polled, or the current interval has fully elapsed.
pub fn is_due(metadata: &SourceMetadata, now: DateTime<Utc>) -> bool {
    match metadata.last_poll_at {
        None => true,
        Some(last) => {
            now.signed_duration_since(last)
                >= chrono::Duration::minutes(i64::from(metadata.current_poll_interval_minutes))
        }
    }
}

pub struct AdaptiveScheduler {
    repo: Arc<MetadataRepository>,
}

impl AdaptiveScheduler {
    pub fn new(repo: Arc<MetadataRepository>) -> Self {
        Self { repo }
    }

    pub async fn should_poll(&self, target: &PollTarget) -> bool {
        self.should_poll_at(target, Utc::now()).await
    }

    pub async fn should_poll_at(&self, target: &PollTarget, now: DateTime<Utc>) -> bool {
        is_due(&self.repo.snapshot(target).await, now)
    }

    /// Recompute and persist the interval for a source whose verdict for this
    /// cycle is `changed`.
    pub async fn adjust_interval(&self, metadata: &mut SourceMetadata, changed: bool) -> u32 {
        let current = metadata.current_poll_interval_minutes;
        let new_interval = next_interval(
            current,
            metadata.consecutive_unchanged_polls,
            changed,
            metadata.min_poll_interval_minutes,
            metadata.max_poll_interval_minutes,
        );
        if new_interval < current {
            info!(source = %metadata.source_name, from = current, to = new_interval, "polling more often");
        } else if new_interval > current {
            info!(source = %metadata.source_name, from = current, to = new_interval, "backing off");
        }
        metadata.current_poll_interval_minutes = new_interval;
        self.repo.save(metadata).await;
        new_interval
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    NotDue,
    Cancelled,
    NotModified { interval_minutes: u32 },
    /// 304 with no fingerprint on record; nothing was detected or adjusted.
    NoBaseline { status: u16 },
    Polled { changed: bool, job_count: u64, interval_minutes: u32 },
    ParseFailed { status: u16, error: String },
    FetchFailed { status: u16, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: usize,
    pub polled: usize,
    pub changed: usize,
    pub not_modified: usize,
    pub not_due: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub outcomes: Vec<SourceOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub source_id: String,
    #[serde(flatten)]
    pub outcome: CycleOutcome,
}

impl SweepSummary {
    fn from_outcomes(started_at: DateTime<Utc>, outcomes: Vec<SourceOutcome>) -> Self {
        let count = |pred: fn(&CycleOutcome) -> bool| outcomes.iter().filter(|o| pred(&o.outcome)).count();
        Self {
            started_at,
            finished_at: Utc::now(),
            sources: outcomes.len(),
            polled: count(|o| {
                matches!(
                    o,
                    CycleOutcome::Polled { .. }
                        | CycleOutcome::NotModified { .. }
                        | CycleOutcome::NoBaseline { .. }
                        | CycleOutcome::ParseFailed { .. }
                        | CycleOutcome::FetchFailed { .. }
                )
            }),
            changed: count(|o| matches!(o, CycleOutcome::Polled { changed: true, .. })),
            not_modified: count(|o| matches!(o, CycleOutcome::NotModified { .. })),
            not_due: count(|o| matches!(o, CycleOutcome::NotDue)),
            failed: count(|o| {
                matches!(o, CycleOutcome::ParseFailed { .. } | CycleOutcome::FetchFailed { .. })
            }),
            cancelled: count(|o| matches!(o, CycleOutcome::Cancelled)),
            outcomes,
        }
    }
}

pub struct RegisteredSource {
    pub config: SourceConfig,
    pub target: PollTarget,
    parser: Box<dyn ListingParser>,
}

impl RegisteredSource {
    pub fn new(config: SourceConfig, global: IntervalBounds) -> Self {
        let target = config.poll_target(global);
        let parser = parser_for(&config.parser);
        Self {
            config,
            target,
            parser,
        }
    }

    pub fn parser_kind(&self) -> &'static str {
        match self.config.parser {
            ParserConfig::Json(_) => "json",
            ParserConfig::Html(_) => "html",
        }
    }
}

/// Runs polling cycles for every enabled source in a registry.
pub struct PollingEngine {
    repo: Arc<MetadataRepository>,
    fetcher: ConditionalFetcher,
    scheduler: AdaptiveScheduler,
    detector: DeltaDetector,
    sources: Vec<RegisteredSource>,
    concurrency: usize,
    tick: Duration,
}

impl PollingEngine {
    pub fn new(
        config: &SyncConfig,
        registry: &SourceRegistry,
        repo: Arc<MetadataRepository>,
    ) -> Result<Self> {
        let fetcher = ConditionalFetcher::new(config.fetcher_config())?;
        let sources = registry
            .enabled()
            .cloned()
            .map(|source| RegisteredSource::new(source, config.bounds))
            .collect();
        Ok(Self {
            scheduler: AdaptiveScheduler::new(repo.clone()),
            repo,
            fetcher,
            detector: DeltaDetector,
            sources,
            concurrency: config.concurrency.max(1),
            tick: Duration::from_secs(config.tick_secs.max(1)),
        })
    }

    pub fn sources(&self) -> &[RegisteredSource] {
        &self.sources
    }

    pub fn repository(&self) -> &Arc<MetadataRepository> {
        &self.repo
    }

    fn source(&self, source_id: &str) -> Option<&RegisteredSource> {
        self.sources.iter().find(|s| s.config.source_id == source_id)
    }

    pub async fn stats(&self, source_id: &str) -> Option<PollingStats> {
        let source = self.source(source_id)?;
        Some(PollingStats::from(&self.repo.snapshot(&source.target).await))
    }

    pub async fn all_stats(&self) -> Vec<(&RegisteredSource, PollingStats)> {
        let mut out = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            out.push((source, PollingStats::from(&self.repo.snapshot(&source.target).await)));
        }
        out
    }

    /// One fetch → detect → adjust → save cycle, holding the source's lock throughout.
    pub async fn poll_source(&self, source: &RegisteredSource, cancel: &CancellationToken) -> CycleOutcome {
        if cancel.is_cancelled() {
            return CycleOutcome::Cancelled;
        }
        let mut metadata = self.repo.lock(&source.target).await;
        if !is_due(&metadata, Utc::now()) {
            return CycleOutcome::NotDue;
        }
        if cancel.is_cancelled() {
            return CycleOutcome::Cancelled;
        }

        let source_id = source.config.source_id.as_str();
        let outcome = match self.fetcher.fetch(&mut metadata).await {
            Ok(FetchOutcome::NotModified) if metadata.content_hash.is_none() => {
                // Nothing to compare against: the origin answered 304 before any listing set was seen.
                warn!(source_id, "304 without a stored fingerprint; next fetch goes unconditional");
                metadata.etag = None;
                metadata.last_modified = None;
                self.repo.save(&metadata).await;
                CycleOutcome::NoBaseline { status: 304 }
            }
            Ok(FetchOutcome::NotModified) => {
                self.detector.record_not_modified(&mut metadata);
                let interval_minutes = self.scheduler.adjust_interval(&mut metadata, false).await;
                CycleOutcome::NotModified { interval_minutes }
            }
            Ok(FetchOutcome::Modified { status, body }) => {
                match source.parser.parse(source_id, &body) {
                    Ok(listings) => {
                        let listings = match source.config.max_listing_age_days {
                            Some(days) => listings_updated_since(
                                listings,
                                Utc::now() - chrono::Duration::days(i64::from(days)),
                            ),
                            None => listings,
                        };
                        let changed = self.detector.detect(&mut metadata, &listings, Utc::now());
                        let interval_minutes =
                            self.scheduler.adjust_interval(&mut metadata, changed).await;
                        CycleOutcome::Polled {
                            changed,
                            job_count: metadata.last_job_count,
                            interval_minutes,
                        }
                    }
                    Err(err) => {
                        warn!(source_id, status, error = %err, "listing parse failed; skipping detection");
                        // Drop validators so the next fetch returns a body we can parse.
                        metadata.etag = None;
                        metadata.last_modified = None;
                        self.repo.save(&metadata).await;
                        CycleOutcome::ParseFailed {
                            status,
                            error: err.to_string(),
                        }
                    }
                }
            }
            Err(err) => {
                warn!(source_id, status = err.status_code(), error = %err, "fetch failed");
                self.repo.save(&metadata).await;
                CycleOutcome::FetchFailed {
                    status: err.status_code(),
                    error: err.to_string(),
                }
            }
        };

        info!(
            source_id,
            status = metadata.last_status_code.unwrap_or_default(),
            response_ms = metadata.last_response_time_ms.unwrap_or_default(),
            interval_minutes = metadata.current_poll_interval_minutes,
            outcome = ?outcome,
            "poll cycle finished"
        );
        outcome
    }

    /// Poll every due source once, concurrently. Failures are per source; cancellation
    /// stops cycles that have not started their fetch yet.
    pub async fn sweep(&self, cancel: &CancellationToken) -> SweepSummary {
        let started_at = Utc::now();
        let polls: Vec<_> = self
            .sources
            .iter()
            .map(|source| async move {
                SourceOutcome {
                    source_id: source.config.source_id.clone(),
                    outcome: self.poll_source(source, cancel).await,
                }
            })
            .collect();
        let outcomes = stream::iter(polls)
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;
        let summary = SweepSummary::from_outcomes(started_at, outcomes);
        info!(
            sources = summary.sources,
            polled = summary.polled,
            changed = summary.changed,
            not_modified = summary.not_modified,
            failed = summary.failed,
            "sweep finished"
        );
        summary
    }

    /// Sweep every tick until `cancel` fires. Returns the number of sweeps run.
    pub async fn run_until_cancelled(&self, cancel: CancellationToken) -> u64 {
        let mut sweeps = 0u64;
        while !cancel.is_cancelled() {
            self.sweep(&cancel).await;
            sweeps += 1;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.tick) => {}
            }
        }
        info!(sweeps, "polling loop stopped");
        sweeps
    }
}

pub async fn engine_from_env() -> Result<PollingEngine> {
    let config = SyncConfig::from_env()?;
    let registry = load_source_registry(config.workspace_root.join("sources.yaml"))?;
    let store = open_metadata_store(&config).await?;
    let repo = Arc::new(MetadataRepository::new(store));
    PollingEngine::new(&config, &registry, repo)
}

pub async fn run_sweep_once_from_env() -> Result<SweepSummary> {
    let engine = engine_from_env().await?;
    Ok(engine.sweep(&CancellationToken::new()).await)
}
