//! Cache documents, fetch bookkeeping, raw artifact archive and paced HTTP fetching.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use pulse_core::{lenient_timestamp, EntityKind, PageInfo};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pulse-storage";

/// File the per-record reaction breakdown loop checkpoints into.
pub const REACTIONS_CHECKPOINT_FILE: &str = "posts_reactions_full.json";

/// File holding the last successful fetch time per entity.
pub const FETCH_LEDGER_FILE: &str = "fetch_state.json";

/// Last page-level metrics fetched, served when a live fetch is unavailable.
pub const PAGE_INFO_FILE: &str = "page_info.json";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Writes `bytes` to `path` through a sibling temp file and a rename, so readers
/// never observe a half-written document.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("renaming {} -> {}", temp_path.display(), path.display())
        });
    }
    Ok(())
}

/// JSON envelope for one entity kind's cached records.
///
/// Older cache files name the list after the entity (`posts`, `videos`, ...)
/// and store naive fetch timestamps; both shapes deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheDocument<T> {
    #[serde(with = "lenient_timestamp")]
    pub fetched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityKind>,
    #[serde(default)]
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(alias = "posts", alias = "videos", alias = "reels", alias = "stories")]
    pub records: Vec<T>,
}

impl<T> CacheDocument<T> {
    pub fn new(fetched_at: DateTime<Utc>, entity: Option<EntityKind>, records: Vec<T>) -> Self {
        Self {
            fetched_at,
            entity,
            total: records.len(),
            progress: None,
            records,
        }
    }
}

/// Directory of JSON cache documents, read preferentially over live fetches.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    /// Reads a JSON file under the cache root; a missing file is `Ok(None)`.
    pub async fn read_json<T: DeserializeOwned>(&self, file_name: &str) -> anyhow::Result<Option<T>> {
        read_json_file(&self.path_for(file_name)).await
    }

    pub async fn write_json<T: Serialize>(&self, file_name: &str, value: &T) -> anyhow::Result<PathBuf> {
        let path = self.path_for(file_name);
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {}", path.display()))?;
        write_atomic(&path, &bytes).await?;
        Ok(path)
    }

    pub async fn read_entity<T: DeserializeOwned>(
        &self,
        entity: EntityKind,
    ) -> anyhow::Result<Option<CacheDocument<T>>> {
        self.read_json(&entity.cache_file_name()).await
    }

    pub async fn write_entity<T: Serialize>(
        &self,
        entity: EntityKind,
        document: &CacheDocument<T>,
    ) -> anyhow::Result<PathBuf> {
        self.write_json(&entity.cache_file_name(), document).await
    }

    pub async fn load_ledger(&self) -> anyhow::Result<FetchLedger> {
        Ok(self.read_json(FETCH_LEDGER_FILE).await?.unwrap_or_default())
    }

    pub async fn save_ledger(&self, ledger: &FetchLedger) -> anyhow::Result<()> {
        self.write_json(FETCH_LEDGER_FILE, ledger).await.map(|_| ())
    }

    pub async fn read_page_info(&self) -> anyhow::Result<Option<PageInfo>> {
        self.read_json(PAGE_INFO_FILE).await
    }

    pub async fn write_page_info(&self, info: &PageInfo) -> anyhow::Result<PathBuf> {
        self.write_json(PAGE_INFO_FILE, info).await
    }
}

/// Reads and parses an arbitrary JSON file; a missing file is `Ok(None)`.
pub async fn read_json_file<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let value = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

/// "Last successful fetch" bookkeeping, the only state carried between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchLedger {
    #[serde(default)]
    pub last_success: BTreeMap<EntityKind, DateTime<Utc>>,
}

impl FetchLedger {
    pub fn last_success(&self, entity: EntityKind) -> Option<DateTime<Utc>> {
        self.last_success.get(&entity).copied()
    }

    pub fn mark_success(&mut self, entity: EntityKind, at: DateTime<Utc>) {
        self.last_success.insert(entity, at);
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedArtifact {
    pub content_hash: String,
    /// `<source_id>/<fetch day>/<sha256>.<ext>` below the archive root.
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw source payloads, grouped by source and fetch day.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn location(&self, day: &str, source_id: &str, content_hash: &str, extension: &str) -> PathBuf {
        let extension = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        PathBuf::from(source_id)
            .join(day)
            .join(format!("{content_hash}.{extension}"))
    }

    /// Stores a payload unless the same bytes were already archived for this
    /// source on the same day.
    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedArtifact> {
        let content_hash = sha256_hex(bytes);
        let day = fetched_at.format("%Y-%m-%d").to_string();
        let relative_path = self.location(&day, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes).await?;
        }

        Ok(ArchivedArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Retry schedule for transient HTTP failures: doubling from `base_delay`, capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(2u32.saturating_pow(attempt))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Fixed gap enforced between consecutive upstream calls.
    pub call_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            call_delay: Duration::from_millis(300),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Spaces calls at least `delay` apart. Best effort; there is no backpressure.
#[derive(Debug)]
pub struct CallPacer {
    delay: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl CallPacer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_call: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.delay {
                tokio::time::sleep(self.delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream answered {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
}

impl FetchError {
    /// Response body of a non-success status, for callers that branch on error payloads.
    pub fn body(&self) -> Option<&str> {
        match self {
            FetchError::HttpStatus { body, .. } => Some(body.as_str()),
            FetchError::Request(_) => None,
        }
    }
}

/// Replaces the value of the `access_token` query parameter so URLs can be logged.
pub fn redact_token(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let redacted = query
        .split('&')
        .map(|pair| {
            if pair.starts_with("access_token=") {
                "access_token=REDACTED"
            } else {
                pair
            }
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("{base}?{redacted}")
}

/// Sequential HTTP GETs with a fixed inter-call delay and bounded retries.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: CallPacer,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        if let Some(agent) = config.user_agent.as_deref() {
            builder = builder.user_agent(agent);
        }

        Ok(Self {
            client: builder.build().context("building the HTTP client")?,
            pacer: CallPacer::new(config.call_delay),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url = %redact_token(url));
        self.get_with_retries(url).instrument(span).await
    }

    async fn get_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0u32;
        loop {
            self.pacer.wait_turn().await;
            let retries_left = attempt < self.backoff.max_retries;

            let resp = match self.client.get(url).send().await {
                Ok(resp) => resp,
                Err(err) if retries_left && is_transient_error(&err) => {
                    warn!(attempt, error = %err, "transient request error; retrying");
                    tokio::time::sleep(self.backoff.delay(attempt)).await;
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(FetchError::Request(err)),
            };

            let status = resp.status();
            if status.is_success() {
                let body = resp.bytes().await?.to_vec();
                return Ok(FetchedResponse {
                    status: status.as_u16(),
                    body,
                });
            }
            if retries_left && is_transient_status(status) {
                warn!(attempt, status = status.as_u16(), "transient status; retrying");
                tokio::time::sleep(self.backoff.delay(attempt)).await;
                attempt += 1;
                continue;
            }

            // Graph error payloads arrive on 4xx bodies; the caller inspects them.
            let url = redact_token(resp.url().as_str());
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 6, 12, 0, 0).unwrap()
    }

    #[test]
    fn empty_payload_has_the_well_known_digest() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn archiving_the_same_payload_twice_deduplicates() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        let first = store
            .archive(fetched_at(), "meta-export", "csv", b"Post ID,Publish time\n")
            .await
            .expect("first archive");
        let second = store
            .archive(fetched_at(), "meta-export", "csv", b"Post ID,Publish time\n")
            .await
            .expect("second archive");

        assert!(!first.deduplicated && second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("meta-export/2025-12-06"));
        assert_eq!(first.byte_size, 21);
        assert!(first.absolute_path.is_file());
    }

    #[tokio::test]
    async fn cache_documents_round_trip_and_missing_files_are_none() {
        let dir = tempdir().expect("tempdir");
        let store = CacheStore::new(dir.path());

        let missing: Option<CacheDocument<serde_json::Value>> =
            store.read_entity(EntityKind::Posts).await.expect("read missing");
        assert!(missing.is_none());

        let doc = CacheDocument::new(
            fetched_at(),
            Some(EntityKind::Posts),
            vec![serde_json::json!({"id": "1"})],
        );
        store.write_entity(EntityKind::Posts, &doc).await.expect("write");
        let back: CacheDocument<serde_json::Value> = store
            .read_entity(EntityKind::Posts)
            .await
            .expect("read")
            .expect("present");
        assert_eq!(back, doc);
    }

    #[test]
    fn legacy_cache_shape_deserializes() {
        let text = r#"{
            "fetched_at": "2025-12-06T12:00:00.123456",
            "total_posts": 1,
            "posts": [{"id": "1"}]
        }"#;
        let doc: CacheDocument<serde_json::Value> = serde_json::from_str(text).expect("parse");
        assert_eq!(doc.records.len(), 1);
        assert_eq!(doc.fetched_at.date_naive(), fetched_at().date_naive());
        assert_eq!(doc.entity, None);
    }

    #[tokio::test]
    async fn ledger_persists_last_success_per_entity() {
        let dir = tempdir().expect("tempdir");
        let store = CacheStore::new(dir.path());
        let mut ledger = store.load_ledger().await.expect("empty ledger");
        assert_eq!(ledger.last_success(EntityKind::Reels), None);

        ledger.mark_success(EntityKind::Reels, fetched_at());
        store.save_ledger(&ledger).await.expect("save");
        let reloaded = store.load_ledger().await.expect("reload");
        assert_eq!(reloaded.last_success(EntityKind::Reels), Some(fetched_at()));
    }

    #[tokio::test]
    async fn page_info_is_cached_between_runs() {
        let dir = tempdir().expect("tempdir");
        let store = CacheStore::new(dir.path());
        assert_eq!(store.read_page_info().await.expect("missing is ok"), None);

        let info = PageInfo {
            id: Some("42".into()),
            name: Some("Test Page".into()),
            fan_count: Some(1200),
            followers_count: Some(1350),
            talking_about_count: None,
            overall_star_rating: Some(4.5),
            rating_count: Some(20),
            fetched_at: fetched_at(),
        };
        let path = store.write_page_info(&info).await.expect("write");
        assert_eq!(path, dir.path().join(PAGE_INFO_FILE));
        assert_eq!(store.read_page_info().await.expect("read"), Some(info));
    }

    #[test]
    fn retry_delays_double_until_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(1),
        };
        let delays: Vec<_> = [0, 1, 2, 3, 40].into_iter().map(|a| policy.delay(a)).collect();
        assert_eq!(
            delays,
            [250, 500, 1000, 1000, 1000].map(Duration::from_millis)
        );
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn tokens_are_redacted_from_logged_urls() {
        assert_eq!(
            redact_token("https://graph.example/v21.0/1/posts?limit=25&access_token=SECRET&after=X"),
            "https://graph.example/v21.0/1/posts?limit=25&access_token=REDACTED&after=X"
        );
        assert_eq!(redact_token("https://graph.example/1"), "https://graph.example/1");
    }

    #[tokio::test]
    async fn pacer_spaces_consecutive_calls() {
        let pacer = CallPacer::new(Duration::from_millis(40));
        let started = Instant::now();
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
