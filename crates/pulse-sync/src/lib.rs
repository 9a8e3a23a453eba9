//! Sync orchestration: configuration, reconciliation, aggregation and reports.

pub mod aggregate;
pub mod config;
pub mod pipeline;
pub mod reconcile;
pub mod reports;

pub use aggregate::{
    best_bucket, growth_series, top_n, Aggregator, BucketKey, BucketSummary, GrowthPoint,
    RecordFilter, Summary, TimeSlot,
};
pub use config::{PipelineConfig, SourceConfig, SourceRegistry, MERGED_EXPORT_FILE, REGISTRY_FILE};
pub use pipeline::{
    build_scheduler, watch, EnrichSummary, PipelineError, RunMode, RunOptions, RunSummary,
    SourceOutcome, SourceStatus, SyncPipeline,
};
pub use reconcile::{Override, Reconciler, Reconciliation, SourceBatch};
pub use reports::{report_index, Dashboard, DashboardStatus, Freshness};

pub const CRATE_NAME: &str = "pulse-sync";

