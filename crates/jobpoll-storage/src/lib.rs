//! Durable metadata stores + conditional HTTP fetch for jobpoll.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobpoll_core::{SourceKey, SourceMetadata};
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobpoll-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("metadata encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable key-value home for [`SourceMetadata`], one record per source key.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn load(&self, key: &SourceKey) -> Result<Option<SourceMetadata>, StoreError>;

    async fn save(&self, metadata: &SourceMetadata) -> Result<(), StoreError>;
}

/// One JSON document per source, named by the SHA-256 of its key.
#[derive(Debug, Clone)]
pub struct FileMetadataStore {
    root: PathBuf,
}

impl FileMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &SourceKey) -> PathBuf {
        self.root
            .join(format!("{}.json", sha256_hex(key.as_str().as_bytes())))
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn load(&self, key: &SourceKey) -> Result<Option<SourceMetadata>, StoreError> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    async fn save(&self, metadata: &SourceMetadata) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(metadata)?;
        write_atomic(&self.path_for(&metadata.source_key), &bytes).await
    }
}

/// Replace `path` with `bytes` through a temp file and rename, so readers never see a torn record.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|source| StoreError::Io {
            path: parent.to_path_buf(),
            source,
        })?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let io_err = |source| StoreError::Io {
        path: temp_path.clone(),
        source,
    };

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err)?;
    file.write_all(bytes).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    drop(file);

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

const CREATE_METADATA_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS source_polling_metadata (
    source_key                    TEXT PRIMARY KEY,
    source_url                    TEXT NOT NULL,
    source_name                   TEXT NOT NULL,
    etag                          TEXT,
    last_modified                 TEXT,
    last_poll_at                  TIMESTAMPTZ,
    last_change_at                TIMESTAMPTZ,
    consecutive_unchanged_polls   BIGINT NOT NULL DEFAULT 0,
    total_polls                   BIGINT NOT NULL DEFAULT 0,
    total_changes                 BIGINT NOT NULL DEFAULT 0,
    current_poll_interval_minutes INTEGER NOT NULL,
    min_poll_interval_minutes     INTEGER NOT NULL,
    max_poll_interval_minutes     INTEGER NOT NULL,
    last_status_code              INTEGER,
    last_response_time_ms         BIGINT,
    content_hash                  TEXT,
    last_job_count                BIGINT NOT NULL DEFAULT 0,
    updated_at                    TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

/// Postgres-backed store; one row per source in `source_polling_metadata`.
#[derive(Debug, Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_METADATA_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or_default()
}

fn to_u32(v: i64) -> u32 {
    u32::try_from(v).unwrap_or_default()
}

fn metadata_from_row(row: &PgRow) -> Result<SourceMetadata, sqlx::Error> {
    let source_url: String = row.try_get("source_url")?;
    let status: Option<i32> = row.try_get("last_status_code")?;
    Ok(SourceMetadata {
        source_key: SourceKey::from_url(&row.try_get::<String, _>("source_key")?),
        source_url,
        source_name: row.try_get("source_name")?,
        etag: row.try_get("etag")?,
        last_modified: row.try_get("last_modified")?,
        last_poll_at: row.try_get("last_poll_at")?,
        last_change_at: row.try_get("last_change_at")?,
        consecutive_unchanged_polls: to_u32(row.try_get("consecutive_unchanged_polls")?),
        total_polls: to_u64(row.try_get("total_polls")?),
        total_changes: to_u64(row.try_get("total_changes")?),
        current_poll_interval_minutes: to_u32(row.try_get::<i32, _>("current_poll_interval_minutes")?.into()),
        min_poll_interval_minutes: to_u32(row.try_get::<i32, _>("min_poll_interval_minutes")?.into()),
        max_poll_interval_minutes: to_u32(row.try_get::<i32, _>("max_poll_interval_minutes")?.into()),
        last_status_code: status.and_then(|s| u16::try_from(s).ok()),
        last_response_time_ms: row
            .try_get::<Option<i64>, _>("last_response_time_ms")?
            .map(to_u64),
        content_hash: row.try_get("content_hash")?,
        last_job_count: to_u64(row.try_get("last_job_count")?),
    })
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn load(&self, key: &SourceKey) -> Result<Option<SourceMetadata>, StoreError> {
        let row = sqlx::query("SELECT * FROM source_polling_metadata WHERE source_key = $1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(metadata_from_row).transpose()?)
    }

    async fn save(&self, m: &SourceMetadata) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO source_polling_metadata (
                source_key, source_url, source_name, etag, last_modified,
                last_poll_at, last_change_at, consecutive_unchanged_polls,
                total_polls, total_changes, current_poll_interval_minutes,
                min_poll_interval_minutes, max_poll_interval_minutes,
                last_status_code, last_response_time_ms, content_hash, last_job_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (source_key) DO UPDATE SET
                source_url = EXCLUDED.source_url,
                source_name = EXCLUDED.source_name,
                etag = EXCLUDED.etag,
                last_modified = EXCLUDED.last_modified,
                last_poll_at = EXCLUDED.last_poll_at,
                last_change_at = EXCLUDED.last_change_at,
                consecutive_unchanged_polls = EXCLUDED.consecutive_unchanged_polls,
                total_polls = EXCLUDED.total_polls,
                total_changes = EXCLUDED.total_changes,
                current_poll_interval_minutes = EXCLUDED.current_poll_interval_minutes,
                min_poll_interval_minutes = EXCLUDED.min_poll_interval_minutes,
                max_poll_interval_minutes = EXCLUDED.max_poll_interval_minutes,
                last_status_code = EXCLUDED.last_status_code,
                last_response_time_ms = EXCLUDED.last_response_time_ms,
                content_hash = EXCLUDED.content_hash,
                last_job_count = EXCLUDED.last_job_count,
                updated_at = now()
            "#,
        )
        .bind(m.source_key.as_str())
        .bind(&m.source_url)
        .bind(&m.source_name)
        .bind(m.etag.as_deref())
        .bind(m.last_modified.as_deref())
        .bind(m.last_poll_at)
        .bind(m.last_change_at)
        .bind(i64::from(m.consecutive_unchanged_polls))
        .bind(to_i64(m.total_polls))
        .bind(to_i64(m.total_changes))
        .bind(i32::try_from(m.current_poll_interval_minutes).unwrap_or(i32::MAX))
        .bind(i32::try_from(m.min_poll_interval_minutes).unwrap_or(i32::MAX))
        .bind(i32::try_from(m.max_poll_interval_minutes).unwrap_or(i32::MAX))
        .bind(m.last_status_code.map(i32::from))
        .bind(m.last_response_time_ms.map(to_i64))
        .bind(m.content_hash.as_deref())
        .bind(to_i64(m.last_job_count))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Request pacing shared by every fetch, to stay under origin anti-abuse limits.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucketState {
    /// Credit whole refill periods since `last_refill`; returns the wait until the next token.
    fn refill(&mut self, capacity: u32, refill_every: Duration) -> Duration {
        if refill_every.is_zero() {
            self.tokens = capacity;
            return Duration::ZERO;
        }
        let elapsed = self.last_refill.elapsed();
        let periods = u32::try_from(elapsed.as_nanos() / refill_every.as_nanos()).unwrap_or(u32::MAX);
        if periods > 0 {
            self.tokens = self.tokens.saturating_add(periods).min(capacity);
            self.last_refill += refill_every * periods;
        }
        refill_every.saturating_sub(self.last_refill.elapsed())
    }
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let wait = state.refill(self.capacity, self.refill_every);
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                wait
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "Mozilla/5.0 (compatible; InternshipScraper/1.0)".to_string(),
            concurrency: 8,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// 2xx with a body to hand to the parser.
    Modified { status: u16, body: Vec<u8> },
    /// 304: the origin confirmed our validators.
    NotModified,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    /// Status recorded in metadata; transport-level failures record 0.
    pub fn status_code(&self) -> u16 {
        match self {
            FetchError::HttpStatus { status, .. } => *status,
            FetchError::Timeout { .. } | FetchError::Request(_) => 0,
        }
    }
}

/// Bookkeeping for one request attempt, applied to metadata in a single step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchAttempt {
    pub status_code: u16,
    pub elapsed_ms: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Apply an attempt to metadata. Validators are only replaced by 2xx responses.
pub fn record_attempt(metadata: &mut SourceMetadata, attempt: &FetchAttempt, now: DateTime<Utc>) {
    metadata.last_poll_at = Some(now);
    metadata.total_polls += 1;
    metadata.last_status_code = Some(attempt.status_code);
    metadata.last_response_time_ms = Some(attempt.elapsed_ms);

    if (200..300).contains(&attempt.status_code) {
        if let Some(etag) = &attempt.etag {
            metadata.etag = Some(etag.clone());
        }
        if let Some(last_modified) = &attempt.last_modified {
            metadata.last_modified = Some(last_modified.clone());
        }
    }
}

struct RawResponse {
    status: StatusCode,
    etag: Option<String>,
    last_modified: Option<String>,
    body: Vec<u8>,
}

/// HTTP GET with `If-None-Match` / `If-Modified-Since` derived from stored validators.
#[derive(Debug)]
pub struct ConditionalFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl ConditionalFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            token_bucket,
        })
    }

    /// Fetch the source and record the attempt on `metadata` before returning,
    /// whatever the outcome.
    pub async fn fetch(&self, metadata: &mut SourceMetadata) -> Result<FetchOutcome, FetchError> {
        let _permit = self.limit.acquire().await.ok();
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!(
            "conditional_fetch",
            source = %metadata.source_name,
            url = %metadata.source_url,
            conditional = metadata.etag.is_some() || metadata.last_modified.is_some(),
        );

        let started = Instant::now();
        let result = self.send(metadata).instrument(span).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (attempt, outcome) = match result {
            Ok(raw) => {
                let status = raw.status.as_u16();
                let attempt = FetchAttempt {
                    status_code: status,
                    elapsed_ms,
                    etag: raw.etag,
                    last_modified: raw.last_modified,
                };
                let outcome = if raw.status == StatusCode::NOT_MODIFIED {
                    Ok(FetchOutcome::NotModified)
                } else if raw.status.is_success() {
                    Ok(FetchOutcome::Modified {
                        status,
                        body: raw.body,
                    })
                } else {
                    Err(FetchError::HttpStatus {
                        status,
                        url: metadata.source_url.clone(),
                    })
                };
                (attempt, outcome)
            }
            Err(err) => (
                FetchAttempt {
                    status_code: err.status_code(),
                    elapsed_ms,
                    etag: None,
                    last_modified: None,
                },
                Err(err),
            ),
        };

        record_attempt(metadata, &attempt, Utc::now());
        debug!(
            source = %metadata.source_name,
            status = attempt.status_code,
            elapsed_ms,
            "fetch attempt recorded"
        );
        outcome
    }

    async fn send(&self, metadata: &SourceMetadata) -> Result<RawResponse, FetchError> {
        let url = metadata.source_url.as_str();
        let mut request = self.client.get(url);
        if let Some(etag) = &metadata.etag {
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }
        if let Some(last_modified) = &metadata.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified.as_str());
        }

        let classify = |err: reqwest::Error| {
            if err.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                }
            } else {
                FetchError::Request(err)
            }
        };

        let resp = request.send().await.map_err(classify)?;
        let status = resp.status();
        let header_text = |name: reqwest::header::HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string)
        };
        let etag = header_text(ETAG);
        let last_modified = header_text(LAST_MODIFIED);

        let body = if status.is_success() && status != StatusCode::NOT_MODIFIED {
            resp.bytes().await.map_err(classify)?.to_vec()
        } else {
            Vec::new()
        };

        Ok(RawResponse {
            status,
            etag,
            last_modified,
            body,
        })
    }
}
