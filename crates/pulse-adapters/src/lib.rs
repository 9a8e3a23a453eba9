//! Source adapter contracts and the Graph API, spreadsheet and cache adapters.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use pulse_core::{EntityKind, Record, SchemaError, SourceKind};
use pulse_storage::{read_json_file, CacheDocument, CacheStore};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod graph;
pub mod merge;
pub mod normalize;
pub mod spreadsheet;

pub use graph::{EdgeFetch, GraphApiError, GraphClient, GraphClientConfig, GraphError, GraphErrorKind};
pub use merge::{merge_exports, MergeOutcome};
pub use normalize::{normalize_api_record, normalize_cached_record, page_info_from};
pub use spreadsheet::parse_spreadsheet;

pub const CRATE_NAME: &str = "pulse-adapters";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub fetched_at: DateTime<Utc>,
    /// Lower bound for incremental API fetches.
    pub since: Option<DateTime<Utc>>,
}

impl AdapterContext {
    pub fn new(fetched_at: DateTime<Utc>) -> Self {
        Self {
            fetched_at,
            since: None,
        }
    }
}

/// What a source handed back before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    Json {
        entity: EntityKind,
        items: Vec<JsonValue>,
    },
    Spreadsheet {
        path: PathBuf,
        text: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawBatch {
    pub source_id: String,
    pub kind: SourceKind,
    pub fetched_at: DateTime<Utc>,
    pub payload: RawPayload,
    /// Set when an API fetch stopped before the last page.
    pub interrupted: Option<String>,
}

impl RawBatch {
    pub fn item_count(&self) -> usize {
        match &self.payload {
            RawPayload::Json { entity, items } => items.len(),
            RawPayload::Spreadsheet { text, .. } => text.lines().count().saturating_sub(1),
        }
    }

    /// Bytes and file extension used when archiving this batch.
    pub fn artifact_bytes(&self) -> anyhow::Result<(Vec<u8>, &'static str)> {
        match &self.payload {
            RawPayload::Json { items, .. } => Ok((
                serde_json::to_vec_pretty(items).context("serializing raw items")?,
                "json",
            )),
            RawPayload::Spreadsheet { text, .. } => Ok((text.as_bytes().to_vec(), "csv")),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("malformed spreadsheet: {0}")]
    Csv(#[from] csv::Error),
    #[error("no cache document at {}", .0.display())]
    CacheMissing(PathBuf),
    #[error("source {source_id} cannot normalize a {found} payload")]
    UnexpectedPayload { source_id: String, found: &'static str },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;

    async fn fetch(&self, ctx: &AdapterContext) -> Result<RawBatch, AdapterError>;

    /// Maps every raw item; the first malformed item fails the whole batch.
    fn normalize(&self, batch: &RawBatch) -> Result<Vec<Record>, AdapterError>;
}

fn unexpected(source_id: &str, payload: &RawPayload) -> AdapterError {
    AdapterError::UnexpectedPayload {
        source_id: source_id.to_string(),
        found: match payload {
            RawPayload::Json { .. } => "json",
            RawPayload::Spreadsheet { .. } => "spreadsheet",
        },
    }
}

/// Live Graph API edge.
#[derive(Debug, Clone)]
pub struct GraphApiAdapter {
    source_id: String,
    entity: EntityKind,
    client: Arc<GraphClient>,
}

impl GraphApiAdapter {
    pub fn new(source_id: impl Into<String>, entity: EntityKind, client: Arc<GraphClient>) -> Self {
        Self {
            source_id: source_id.into(),
            entity,
            client,
        }
    }
}

#[async_trait]
impl SourceAdapter for GraphApiAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<RawBatch, AdapterError> {
        let fetch = self.client.fetch_edge(self.entity, ctx.since).await?;
        Ok(RawBatch {
            source_id: self.source_id.clone(),
            kind: SourceKind::Api,
            fetched_at: ctx.fetched_at,
            payload: RawPayload::Json {
                entity: self.entity,
                items: fetch.items,
            },
            interrupted: fetch.interrupted,
        })
    }

    fn normalize(&self, batch: &RawBatch) -> Result<Vec<Record>, AdapterError> {
        match &batch.payload {
            RawPayload::Json { entity, items } => items
                .iter()
                .map(|item| normalize_api_record(*entity, item).map_err(AdapterError::from))
                .collect(),
            other => Err(unexpected(&self.source_id, other)),
        }
    }
}

/// Spreadsheet export on disk.
#[derive(Debug, Clone)]
pub struct SpreadsheetAdapter {
    source_id: String,
    path: PathBuf,
    export_offset: FixedOffset,
}

impl SpreadsheetAdapter {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>, export_offset: FixedOffset) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
            export_offset,
        }
    }
}

#[async_trait]
impl SourceAdapter for SpreadsheetAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Spreadsheet
    }

    /// `fetched_at` of the batch is the export file's modification time.
    async fn fetch(&self, ctx: &AdapterContext) -> Result<RawBatch, AdapterError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let exported_at = tokio::fs::metadata(&self.path)
            .await
            .and_then(|meta| meta.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or(ctx.fetched_at);
        Ok(RawBatch {
            source_id: self.source_id.clone(),
            kind: SourceKind::Spreadsheet,
            fetched_at: exported_at,
            payload: RawPayload::Spreadsheet {
                path: self.path.clone(),
                text,
            },
            interrupted: None,
        })
    }

    fn normalize(&self, batch: &RawBatch) -> Result<Vec<Record>, AdapterError> {
        match &batch.payload {
            RawPayload::Spreadsheet { text, .. } => parse_spreadsheet(text, self.export_offset),
            other => Err(unexpected(&self.source_id, other)),
        }
    }
}

/// Previously written cache document for one entity kind.
#[derive(Debug, Clone)]
pub struct CacheAdapter {
    source_id: String,
    entity: EntityKind,
    path: PathBuf,
}

impl CacheAdapter {
    /// The entity's standard cache file inside `store`.
    pub fn for_entity(source_id: impl Into<String>, entity: EntityKind, store: &CacheStore) -> Self {
        Self::from_path(source_id, entity, store.path_for(&entity.cache_file_name()))
    }

    /// Any cache document on disk, such as an enrichment checkpoint.
    pub fn from_path(source_id: impl Into<String>, entity: EntityKind, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            entity,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SourceAdapter for CacheAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Cache
    }

    /// `fetched_at` of the batch is the cache document's own timestamp.
    async fn fetch(&self, _ctx: &AdapterContext) -> Result<RawBatch, AdapterError> {
        let document: CacheDocument<JsonValue> = read_json_file(&self.path)
            .await?
            .ok_or_else(|| AdapterError::CacheMissing(self.path.clone()))?;
        Ok(RawBatch {
            source_id: self.source_id.clone(),
            kind: SourceKind::Cache,
            fetched_at: document.fetched_at,
            payload: RawPayload::Json {
                entity: self.entity,
                items: document.records,
            },
            interrupted: None,
        })
    }

    fn normalize(&self, batch: &RawBatch) -> Result<Vec<Record>, AdapterError> {
        match &batch.payload {
            RawPayload::Json { entity, items } => items
                .iter()
                .map(|item| normalize_cached_record(*entity, item).map_err(AdapterError::from))
                .collect(),
            other => Err(unexpected(&self.source_id, other)),
        }
    }
}
