//! One sync run: load sources in priority order, reconcile, aggregate, report.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use pulse_adapters::{
    AdapterContext, AdapterError, CacheAdapter, GraphApiAdapter, GraphClient, GraphError,
    GraphErrorKind, RawBatch, SourceAdapter, SpreadsheetAdapter,
};
use pulse_core::{EntityKind, PageInfo, Record, SourceKind};
use pulse_storage::{ArtifactStore, CacheDocument, CacheStore, FetchLedger, REACTIONS_CHECKPOINT_FILE};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::aggregate::{Aggregator, RecordFilter};
use crate::config::{PipelineConfig, SourceConfig, SourceRegistry, MERGED_EXPORT_FILE};
use crate::reconcile::{Reconciler, SourceBatch};
use crate::reports::{
    mark_stale, new_run_id, write_run_reports, write_status, Dashboard, DashboardInput,
    DashboardStatus, Freshness,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Refetch everything from `since` and replace the caches.
    Full,
    /// Fetch from the last successful fetch and overlay onto the caches.
    #[default]
    Incremental,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub mode: RunMode,
    pub skip_download: bool,
    pub dry_run: bool,
    pub filter: RecordFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Loaded,
    /// Live data is incomplete: the fetch stopped before the last page, or
    /// the stored cache it overlays could not be read.
    Partial,
    /// Download skipped; served from cache.
    Cached,
    /// Live fetch failed; served from cache.
    Fallback,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceOutcome {
    pub source_id: String,
    pub kind: SourceKind,
    pub status: SourceStatus,
    pub records: usize,
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: RunMode,
    pub dry_run: bool,
    pub sources: Vec<SourceOutcome>,
    pub records: usize,
    pub overrides: usize,
    pub total_engagement: u64,
    pub freshness: Freshness,
    pub page: Option<PageInfo>,
    pub artifacts_archived: usize,
    pub report_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichSummary {
    pub total: usize,
    pub already_done: usize,
    pub enriched: usize,
    pub failed: usize,
    /// Why the loop stopped before the end, if it did.
    pub stopped: Option<String>,
    pub checkpoint: PathBuf,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no usable source: {}", .reasons.join("; "))]
    NoUsableSource { reasons: Vec<String> },
    #[error("graph api unavailable: {0}")]
    GraphUnavailable(String),
}

/// Live fetch results that replace an entity's cache document.
struct RefreshedCache {
    entity: EntityKind,
    records: Vec<Record>,
    complete: bool,
}

struct LoadedSource {
    outcome: SourceOutcome,
    batch: Option<SourceBatch>,
    raw: Option<RawBatch>,
    refreshed: Option<RefreshedCache>,
    cache_unreadable: bool,
}

impl LoadedSource {
    fn usable(
        source: &SourceConfig,
        status: SourceStatus,
        fetched_at: DateTime<Utc>,
        records: Vec<Record>,
        detail: Option<String>,
    ) -> Self {
        Self {
            outcome: SourceOutcome {
                source_id: source.source_id.clone(),
                kind: source.kind,
                status,
                records: records.len(),
                fetched_at: Some(fetched_at),
                detail,
            },
            batch: Some(SourceBatch::new(
                source.source_id.clone(),
                source.kind,
                fetched_at,
                records,
            )),
            raw: None,
            refreshed: None,
            cache_unreadable: false,
        }
    }

    fn failed(source: &SourceConfig, detail: String) -> Self {
        Self {
            outcome: SourceOutcome {
                source_id: source.source_id.clone(),
                kind: source.kind,
                status: SourceStatus::Failed,
                records: 0,
                fetched_at: None,
                detail: Some(detail),
            },
            batch: None,
            raw: None,
            refreshed: None,
            cache_unreadable: false,
        }
    }
}

async fn read_source(
    adapter: &dyn SourceAdapter,
    ctx: &AdapterContext,
) -> std::result::Result<(RawBatch, Vec<Record>), AdapterError> {
    let raw = adapter.fetch(ctx).await?;
    let records = adapter.normalize(&raw)?;
    Ok((raw, records))
}

pub struct SyncPipeline {
    config: PipelineConfig,
    cache: CacheStore,
    artifacts: ArtifactStore,
    graph: std::result::Result<Arc<GraphClient>, String>,
}

impl SyncPipeline {
    /// Without page credentials, API sources fall back to their caches.
    pub fn new(config: PipelineConfig) -> Self {
        let graph = config
            .graph_client_config()
            .and_then(|graph_config| GraphClient::new(graph_config).map_err(|err| err.to_string()))
            .map(Arc::new);
        Self {
            cache: CacheStore::new(config.cache_path()),
            artifacts: ArtifactStore::new(config.artifacts_path()),
            graph,
            config,
        }
    }

    pub fn with_graph_client(mut self, client: GraphClient) -> Self {
        self.graph = Ok(Arc::new(client));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_once(&self, options: &RunOptions) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = new_run_id(started_at);
        let span = info_span!(
            "sync_run",
            run_id = %run_id,
            mode = ?options.mode,
            dry_run = options.dry_run
        );
        self.run(run_id, started_at, options).instrument(span).await
    }

    async fn run(&self, run_id: String, started_at: DateTime<Utc>, options: &RunOptions) -> Result<RunSummary> {
        let registry = SourceRegistry::load(&self.config.workspace_root).await?;
        let mut ledger = self.cache.load_ledger().await?;
        let ctx = AdapterContext::new(started_at);

        let mut loaded = Vec::new();
        for source in registry.enabled() {
            let result = match source.kind {
                SourceKind::Api => self.load_api_source(source, options, &ledger, &ctx).await,
                SourceKind::Spreadsheet => {
                    let path = source
                        .path
                        .as_deref()
                        .map(|path| self.config.resolve(path))
                        .unwrap_or_else(|| self.config.exports_path().join(MERGED_EXPORT_FILE));
                    let adapter =
                        SpreadsheetAdapter::new(&source.source_id, path, self.config.export_offset);
                    self.load_file_source(source, &adapter, &ctx).await
                }
                SourceKind::Cache => {
                    let entity = source.entity_or_posts();
                    let adapter = match &source.path {
                        Some(path) => {
                            CacheAdapter::from_path(&source.source_id, entity, self.config.resolve(path))
                        }
                        None => CacheAdapter::for_entity(&source.source_id, entity, &self.cache),
                    };
                    self.load_file_source(source, &adapter, &ctx).await
                }
            };
            info!(
                source_id = %source.source_id,
                status = ?result.outcome.status,
                records = result.outcome.records,
                "source loaded"
            );
            loaded.push(result);
        }

        let wants_live_page =
            !options.skip_download && registry.enabled().any(|s| s.kind == SourceKind::Api);
        let (page, page_is_live) = self.load_page_info(wants_live_page).await;

        let outcomes: Vec<SourceOutcome> = loaded.iter().map(|l| l.outcome.clone()).collect();
        let batches: Vec<SourceBatch> = loaded.iter_mut().filter_map(|l| l.batch.take()).collect();

        if batches.is_empty() {
            let mut reasons: Vec<String> = outcomes
                .iter()
                .filter_map(|o| o.detail.as_ref().map(|d| format!("{}: {d}", o.source_id)))
                .collect();
            if reasons.is_empty() {
                reasons.push("no enabled sources".to_string());
            }
            let error = PipelineError::NoUsableSource { reasons };
            warn!(error = %error, "no data available; dashboard marked stale");
            if !options.dry_run {
                mark_stale(&self.config.reports_path(), &run_id, &error.to_string()).await?;
            }
            return Err(error.into());
        }

        let reconciliation = Reconciler.reconcile(&batches);
        for overridden in &reconciliation.overrides {
            debug!(
                id = %overridden.id,
                replaced = %overridden.replaced_source,
                winner = %overridden.winning_source,
                "record overridden"
            );
        }
        let aggregator = Aggregator::new(self.config.report_offset);
        let records = aggregator.apply_filter(&reconciliation.records, &options.filter);
        if !options.filter.is_empty() {
            info!(
                kept = records.len(),
                total = reconciliation.records.len(),
                "record filter applied"
            );
        }
        let unreadable: Vec<String> = loaded
            .iter()
            .filter(|l| l.cache_unreadable)
            .map(|l| l.outcome.source_id.clone())
            .collect();
        let freshness = self.freshness(&outcomes, &batches, unreadable, started_at);
        info!(
            records = records.len(),
            overrides = reconciliation.overrides.len(),
            stale = freshness.stale,
            "reconciled"
        );

        let mut artifacts_archived = 0;
        let mut report_dir = None;
        if options.dry_run {
            info!("dry run; nothing written");
        } else {
            let mut ledger_dirty = false;
            for refreshed in loaded.iter().filter_map(|l| l.refreshed.as_ref()) {
                let document =
                    CacheDocument::new(started_at, Some(refreshed.entity), refreshed.records.clone());
                self.cache.write_entity(refreshed.entity, &document).await?;
                if refreshed.complete {
                    ledger.mark_success(refreshed.entity, started_at);
                    ledger_dirty = true;
                }
            }
            if ledger_dirty {
                self.cache.save_ledger(&ledger).await?;
            }
            if let Some(page) = page.as_ref().filter(|_| page_is_live) {
                self.cache.write_page_info(page).await?;
            }

            for raw in loaded.iter().filter_map(|l| l.raw.as_ref()) {
                let (bytes, ext) = raw.artifact_bytes()?;
                let archived = self
                    .artifacts
                    .archive(raw.fetched_at, &raw.source_id, ext, &bytes)
                    .await?;
                if !archived.deduplicated {
                    artifacts_archived += 1;
                }
            }

            let dashboard = Dashboard::build(DashboardInput {
                run_id: &run_id,
                generated_at: Utc::now(),
                aggregator: &aggregator,
                records: &records,
                top_n: self.config.top_n,
                freshness: freshness.clone(),
                page: page.clone(),
                sources: outcomes.clone(),
                overrides: reconciliation.overrides.len(),
            });
            let reports_root = self.config.reports_path();
            let dir = write_run_reports(&reports_root, &dashboard).await?;
            write_status(
                &reports_root,
                &DashboardStatus {
                    run_id: run_id.clone(),
                    updated_at: Utc::now(),
                    stale: freshness.stale,
                    reason: self.stale_reason(&freshness),
                    data_as_of: freshness.data_as_of,
                    report_dir: Some(dir.display().to_string()),
                },
            )
            .await?;
            info!(report_dir = %dir.display(), "reports written");
            report_dir = Some(dir);
        }

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            mode: options.mode,
            dry_run: options.dry_run,
            sources: outcomes,
            total_engagement: records.iter().map(Record::engagement).sum(),
            records: records.len(),
            overrides: reconciliation.overrides.len(),
            freshness,
            page,
            artifacts_archived,
            report_dir,
        })
    }

    /// Live page metrics when `live` and the fetch succeeds, else the cached
    /// copy. The flag reports whether the result is fresh from the API.
    async fn load_page_info(&self, live: bool) -> (Option<PageInfo>, bool) {
        if live {
            match &self.graph {
                Ok(client) => match client.fetch_page_info().await {
                    Ok(page) => return (Some(page), true),
                    Err(err) => warn!(error = %err, "page info fetch failed; using the cached copy"),
                },
                Err(reason) => debug!(%reason, "no graph client; using cached page info"),
            }
        }
        match self.cache.read_page_info().await {
            Ok(cached) => (cached, false),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "cached page info unreadable; omitting page metrics");
                (None, false)
            }
        }
    }

    async fn load_file_source(
        &self,
        source: &SourceConfig,
        adapter: &dyn SourceAdapter,
        ctx: &AdapterContext,
    ) -> LoadedSource {
        match read_source(adapter, ctx).await {
            Ok((raw, records)) => {
                let mut loaded =
                    LoadedSource::usable(source, SourceStatus::Loaded, raw.fetched_at, records, None);
                loaded.raw = Some(raw);
                loaded
            }
            Err(err) => {
                warn!(source_id = %source.source_id, error = %err, "source failed; continuing without it");
                LoadedSource::failed(source, err.to_string())
            }
        }
    }

    async fn load_api_source(
        &self,
        source: &SourceConfig,
        options: &RunOptions,
        ledger: &FetchLedger,
        ctx: &AdapterContext,
    ) -> LoadedSource {
        let entity = source.entity_or_posts();
        let cache_adapter = CacheAdapter::for_entity(&source.source_id, entity, &self.cache);

        if options.skip_download {
            return match read_source(&cache_adapter, ctx).await {
                Ok((raw, records)) => LoadedSource::usable(
                    source,
                    SourceStatus::Cached,
                    raw.fetched_at,
                    records,
                    Some("download skipped".to_string()),
                ),
                Err(err) => LoadedSource::failed(source, format!("download skipped and {err}")),
            };
        }

        let client = match &self.graph {
            Ok(client) => client.clone(),
            Err(reason) => return self.fall_back(source, &cache_adapter, ctx, reason.clone()).await,
        };
        let since = match options.mode {
            RunMode::Incremental => ledger.last_success(entity).or_else(|| self.config.since_utc()),
            RunMode::Full => self.config.since_utc(),
        };
        let ctx = AdapterContext {
            since,
            ..ctx.clone()
        };
        let adapter = GraphApiAdapter::new(&source.source_id, entity, client);

        let (raw, fresh) = match read_source(&adapter, &ctx).await {
            Ok(fetched) => fetched,
            Err(err) => return self.fall_back(source, &cache_adapter, &ctx, err.to_string()).await,
        };

        let complete = raw.interrupted.is_none();
        let existing = if options.mode == RunMode::Full && complete {
            Ok(Vec::new())
        } else {
            self.cached_records(&cache_adapter, &ctx).await
        };
        let fetched = fresh.len();

        let existing = match existing {
            Ok(existing) => existing,
            Err(err) => {
                // Rewriting the cache from fresh pages alone would drop every stored record.
                warn!(
                    source_id = %source.source_id,
                    path = %cache_adapter.path().display(),
                    error = %err,
                    "existing cache unreadable; leaving it untouched"
                );
                let detail = match &raw.interrupted {
                    Some(reason) => format!("{reason}; existing cache unreadable, not rewritten: {err}"),
                    None => format!("existing cache unreadable, not rewritten: {err}"),
                };
                let mut loaded =
                    LoadedSource::usable(source, SourceStatus::Partial, raw.fetched_at, fresh, Some(detail));
                loaded.raw = Some(raw);
                loaded.cache_unreadable = true;
                return loaded;
            }
        };
        let records = Reconciler.overlay(existing, fresh);
        let detail = raw.interrupted.clone();
        let status = if complete {
            info!(source_id = %source.source_id, fetched, cached = records.len(), "live fetch complete");
            SourceStatus::Loaded
        } else {
            warn!(
                source_id = %source.source_id,
                fetched,
                reason = detail.as_deref().unwrap_or_default(),
                "partial fetch; last-success time not advanced"
            );
            SourceStatus::Partial
        };

        let mut loaded = LoadedSource::usable(source, status, raw.fetched_at, records.clone(), detail);
        loaded.raw = Some(raw);
        loaded.refreshed = Some(RefreshedCache {
            entity,
            records,
            complete,
        });
        loaded
    }

    async fn fall_back(
        &self,
        source: &SourceConfig,
        cache_adapter: &CacheAdapter,
        ctx: &AdapterContext,
        reason: String,
    ) -> LoadedSource {
        warn!(source_id = %source.source_id, reason = %reason, "live fetch unavailable; using cache");
        match read_source(cache_adapter, ctx).await {
            Ok((raw, records)) => LoadedSource::usable(
                source,
                SourceStatus::Fallback,
                raw.fetched_at,
                records,
                Some(reason),
            ),
            Err(err) => LoadedSource::failed(source, format!("{reason}; cache fallback failed: {err}")),
        }
    }

    /// Records already cached for an entity; a missing cache is empty.
    async fn cached_records(
        &self,
        adapter: &CacheAdapter,
        ctx: &AdapterContext,
    ) -> std::result::Result<Vec<Record>, AdapterError> {
        match read_source(adapter, ctx).await {
            Ok((_, records)) => Ok(records),
            Err(AdapterError::CacheMissing(_)) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    fn freshness(
        &self,
        outcomes: &[SourceOutcome],
        batches: &[SourceBatch],
        unreadable_caches: Vec<String>,
        now: DateTime<Utc>,
    ) -> Freshness {
        let data_as_of = batches.iter().map(|batch| batch.fetched_at).max();
        let sources_with = |status: SourceStatus| {
            outcomes
                .iter()
                .filter(|o| o.status == status)
                .map(|o| o.source_id.clone())
                .collect::<Vec<_>>()
        };
        let fallbacks = sources_with(SourceStatus::Fallback);
        // An age limit too large for a duration never expires.
        let too_old = data_as_of.map_or(true, |at| {
            Duration::try_hours(self.config.stale_after_hours).is_some_and(|limit| now - at > limit)
        });
        Freshness {
            data_as_of,
            stale: too_old || !fallbacks.is_empty() || !unreadable_caches.is_empty(),
            fallbacks,
            interrupted: sources_with(SourceStatus::Partial),
            unreadable_caches,
        }
    }

    fn stale_reason(&self, freshness: &Freshness) -> Option<String> {
        if !freshness.stale {
            None
        } else if !freshness.fallbacks.is_empty() {
            Some(format!("served from cache: {}", freshness.fallbacks.join(", ")))
        } else if !freshness.unreadable_caches.is_empty() {
            Some(format!(
                "cached history unreadable: {}",
                freshness.unreadable_caches.join(", ")
            ))
        } else {
            Some(format!(
                "newest data is older than {} hours",
                self.config.stale_after_hours
            ))
        }
    }

    /// Fetches per-type reaction counts for every cached post not yet in the
    /// checkpoint. Progress is saved every `batch_size` posts, so an
    /// interrupted run resumes where it stopped.
    pub async fn enrich_reactions(&self, batch_size: usize) -> Result<EnrichSummary> {
        let client = self.graph.clone().map_err(PipelineError::GraphUnavailable)?;
        let ctx = AdapterContext::new(Utc::now());

        let posts_cache = CacheAdapter::for_entity("posts-cache", EntityKind::Posts, &self.cache);
        let (_, posts) = read_source(&posts_cache, &ctx)
            .await
            .context("loading the posts cache (run `sync` first)")?;

        let checkpoint_path = self.cache.path_for(REACTIONS_CHECKPOINT_FILE);
        let checkpoint =
            CacheAdapter::from_path("reactions-checkpoint", EntityKind::Posts, &checkpoint_path);
        let mut done = match read_source(&checkpoint, &ctx).await {
            Ok((_, records)) => records,
            Err(AdapterError::CacheMissing(_)) => Vec::new(),
            Err(err) => return Err(err).context("loading the reactions checkpoint"),
        };

        let processed: HashSet<String> = done.iter().map(|record| record.id.clone()).collect();
        let total = posts.len();
        let pending: Vec<Record> = posts
            .into_iter()
            .filter(|record| !processed.contains(&record.id))
            .collect();
        let mut summary = EnrichSummary {
            total,
            already_done: total - pending.len(),
            enriched: 0,
            failed: 0,
            stopped: None,
            checkpoint: checkpoint_path,
        };
        info!(total, pending = pending.len(), "enriching reaction breakdowns");

        let page_id = client.config().page_id.clone();
        let batch_size = batch_size.max(1);
        let mut unsaved = 0;
        for mut record in pending {
            let object_id = format!("{page_id}_{}", record.id);
            match client.fetch_reaction_breakdown(&object_id).await {
                Ok(breakdown) => {
                    record.reactions_breakdown = Some(breakdown);
                    done.push(record);
                    summary.enriched += 1;
                    unsaved += 1;
                }
                Err(GraphError::Api(api))
                    if matches!(api.kind, GraphErrorKind::RateLimited | GraphErrorKind::AuthExpired) =>
                {
                    warn!(id = %record.id, error = %api, "stopping; progress is checkpointed");
                    summary.stopped = Some(api.to_string());
                    break;
                }
                Err(err) => {
                    warn!(id = %record.id, error = %err, "reaction breakdown failed");
                    summary.failed += 1;
                }
            }
            if unsaved >= batch_size {
                self.save_checkpoint(&done, total).await?;
                unsaved = 0;
                info!(done = done.len(), total, "checkpoint saved");
            }
        }
        self.save_checkpoint(&done, total).await?;
        Ok(summary)
    }

    async fn save_checkpoint(&self, done: &[Record], total: usize) -> Result<()> {
        let mut document = CacheDocument::new(
            Utc::now(),
            Some(EntityKind::Posts),
            done.iter().collect::<Vec<&Record>>(),
        );
        document.progress = Some(format!("{}/{}", done.len(), total));
        self.cache
            .write_json(REACTIONS_CHECKPOINT_FILE, &document)
            .await?;
        Ok(())
    }
}

/// Cron job running incremental syncs. A trigger that fires while the
/// previous run is still going is skipped.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let cron = pipeline.config().scheduler_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        let running = running.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous scheduled sync still running; skipping");
                return;
            };
            match pipeline.run_once(&RunOptions::default()).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    records = summary.records,
                    stale = summary.freshness.stale,
                    "scheduled sync finished"
                ),
                Err(err) => warn!(error = ?err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Runs scheduled syncs until Ctrl-C.
pub async fn watch(pipeline: Arc<SyncPipeline>) -> Result<()> {
    let cron = pipeline.config().scheduler_cron.clone();
    let mut sched = build_scheduler(pipeline).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %cron, "scheduler started; Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}
