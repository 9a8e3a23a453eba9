use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use pulse_adapters::merge_exports;
use pulse_core::PostType;
use pulse_sync::{
    report_index, watch, PipelineConfig, RecordFilter, RunMode, RunOptions, RunSummary,
    SyncPipeline, MERGED_EXPORT_FILE,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pulse-cli")]
#[command(about = "Page Engagement Pulse command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, reconcile and write reports (default)
    Sync(SyncArgs),
    /// Merge spreadsheet exports into one deduplicated CSV
    MergeExports {
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Fetch per-type reaction counts for cached posts, resumably
    EnrichReactions {
        #[arg(long, default_value_t = 50)]
        batch_size: usize,
    },
    /// List the newest report runs
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run incremental syncs on the configured cron schedule
    Watch,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Refetch everything and replace the caches
    #[arg(long)]
    full_refresh: bool,
    /// Use cached API data instead of fetching
    #[arg(long)]
    skip_download: bool,
    /// Print the summary without writing anything
    #[arg(long)]
    dry_run: bool,
    /// First day to include (YYYY-MM-DD, report time zone)
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Last day to include (YYYY-MM-DD, report time zone)
    #[arg(long)]
    to: Option<NaiveDate>,
    /// Only include one post type
    #[arg(long = "type", value_parser = parse_post_type)]
    post_type: Option<PostType>,
}

impl SyncArgs {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            mode: if self.full_refresh {
                RunMode::Full
            } else {
                RunMode::Incremental
            },
            skip_download: self.skip_download,
            dry_run: self.dry_run,
            filter: RecordFilter {
                start: self.from,
                end: self.to,
                post_type: self.post_type,
            },
        }
    }
}

fn parse_post_type(raw: &str) -> Result<PostType, String> {
    match PostType::from_label(raw) {
        PostType::Unknown if !raw.trim().eq_ignore_ascii_case("unknown") => {
            let known: Vec<&str> = PostType::ALL.iter().map(|t| t.as_str()).collect();
            Err(format!("unknown post type {raw:?}; expected one of {}", known.join(", ")))
        }
        post_type => Ok(post_type),
    }
}

fn print_run_summary(summary: &RunSummary) {
    println!(
        "sync complete: run_id={} mode={:?} dry_run={}",
        summary.run_id, summary.mode, summary.dry_run
    );
    for source in &summary.sources {
        let detail = source
            .detail
            .as_deref()
            .map(|d| format!(" ({d})"))
            .unwrap_or_default();
        println!(
            "  {:<20} {:<12} {:?}: {} records{}",
            source.source_id,
            source.kind.to_string(),
            source.status,
            source.records,
            detail
        );
    }
    println!(
        "records={} overrides={} engagement={}",
        summary.records, summary.overrides, summary.total_engagement
    );
    if let Some(page) = &summary.page {
        println!(
            "page {}: followers={} talking_about={} (as of {})",
            page.name.as_deref().unwrap_or("unnamed"),
            page.audience().map_or_else(|| "n/a".to_string(), |n| n.to_string()),
            page.talking_about_count
                .map_or_else(|| "n/a".to_string(), |n| n.to_string()),
            page.fetched_at.to_rfc3339()
        );
    }
    let freshness = &summary.freshness;
    if let Some(as_of) = freshness.data_as_of {
        println!("data as of {}", as_of.to_rfc3339());
    }
    if freshness.stale {
        println!("STALE: dashboard data is out of date");
    }
    if let Some(dir) = &summary.report_dir {
        println!("reports: {}", dir.display());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    tracing::debug!(workspace = %config.workspace_root.display(), "configuration loaded");

    match cli.command.unwrap_or_else(|| Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let pipeline = SyncPipeline::new(config);
            let summary = pipeline.run_once(&args.run_options()).await?;
            print_run_summary(&summary);
        }
        Commands::MergeExports { dir, output } => {
            let dir = dir.unwrap_or_else(|| config.exports_path());
            let output = output.unwrap_or_else(|| dir.join(MERGED_EXPORT_FILE));
            let outcome = merge_exports(&dir, &output)
                .await
                .with_context(|| format!("merging exports in {}", dir.display()))?;
            println!(
                "merged {} files: {} rows read, {} written, {} without id, {} columns -> {}",
                outcome.inputs.len(),
                outcome.rows_read,
                outcome.rows_written,
                outcome.rows_without_id,
                outcome.columns.len(),
                outcome.output.display()
            );
            for path in &outcome.skipped {
                println!("  skipped unreadable export {}", path.display());
            }
        }
        Commands::EnrichReactions { batch_size } => {
            let pipeline = SyncPipeline::new(config);
            let summary = pipeline.enrich_reactions(batch_size).await?;
            println!(
                "reactions: {} enriched, {} failed, {} already done of {} posts -> {}",
                summary.enriched,
                summary.failed,
                summary.already_done,
                summary.total,
                summary.checkpoint.display()
            );
            if let Some(reason) = summary.stopped {
                println!("stopped early: {reason}; re-run to resume");
            }
        }
        Commands::Report { runs } => {
            println!("{}", report_index(&config.reports_path(), runs)?);
        }
        Commands::Watch => {
            watch(Arc::new(SyncPipeline::new(config))).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_is_the_default_and_flags_map_to_options() {
        let cli = Cli::parse_from(["pulse-cli"]);
        assert!(cli.command.is_none());

        let cli = Cli::parse_from([
            "pulse-cli",
            "sync",
            "--full-refresh",
            "--dry-run",
            "--from",
            "2025-06-01",
            "--type",
            "reels",
        ]);
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync");
        };
        let options = args.run_options();
        assert_eq!(options.mode, RunMode::Full);
        assert!(options.dry_run);
        assert!(!options.skip_download);
        assert_eq!(options.filter.start, NaiveDate::from_ymd_opt(2025, 6, 1));
        assert_eq!(options.filter.post_type, Some(PostType::Reel));
    }

    #[test]
    fn unknown_post_types_are_rejected() {
        assert!(parse_post_type("carousel").is_err());
        assert_eq!(parse_post_type("unknown"), Ok(PostType::Unknown));
        assert!(Cli::try_parse_from(["pulse-cli", "sync", "--type", "carousel"]).is_err());
    }

    #[test]
    fn subcommand_defaults() {
        let cli = Cli::parse_from(["pulse-cli", "enrich-reactions"]);
        assert!(matches!(cli.command, Some(Commands::EnrichReactions { batch_size: 50 })));
        let cli = Cli::parse_from(["pulse-cli", "report", "--runs", "2"]);
        assert!(matches!(cli.command, Some(Commands::Report { runs: 2 })));
    }
}
