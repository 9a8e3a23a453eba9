//! Files handed to the dashboard: one directory per run plus `status.json`.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use pulse_core::{PageInfo, Record};
use pulse_storage::{read_json_file, sha256_hex, write_atomic};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::aggregate::{
    best_bucket, growth_series, top_n, Aggregator, BucketKey, BucketSummary, GrowthPoint, Summary,
};
use crate::pipeline::SourceOutcome;

pub const STATUS_FILE: &str = "status.json";
pub const DASHBOARD_FILE: &str = "dashboard.json";

/// `20250701T060000Z-1a2b3c4d`: sortable by start time, unique per run.
pub fn new_run_id(started_at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", started_at.format("%Y%m%dT%H%M%SZ"), &suffix[..8])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Freshness {
    pub data_as_of: Option<DateTime<Utc>>,
    pub stale: bool,
    /// Sources whose live fetch failed and were served from cache.
    pub fallbacks: Vec<String>,
    /// Sources whose live data is incomplete: the fetch stopped before the
    /// last page or the stored cache could not be merged in.
    pub interrupted: Vec<String>,
    /// Sources whose stored cache could not be read; it was left untouched.
    #[serde(default)]
    pub unreadable_caches: Vec<String>,
}

/// A record as the dashboard shows it.
#[derive(Debug, Clone, Serialize)]
pub struct RecordView {
    #[serde(flatten)]
    pub record: Record,
    pub engagement: u64,
    pub local_time: String,
}

impl RecordView {
    fn new(record: &Record, aggregator: &Aggregator) -> Self {
        Self {
            record: record.clone(),
            engagement: record.engagement(),
            local_time: local_time_label(record, aggregator),
        }
    }
}

fn local_time_label(record: &Record, aggregator: &Aggregator) -> String {
    aggregator
        .local_time(record.created_at)
        .format("%Y-%m-%d %H:%M")
        .to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub report_offset: String,
    pub freshness: Freshness,
    /// Page-level audience metrics, live or from the last cached fetch.
    pub page: Option<PageInfo>,
    pub sources: Vec<SourceOutcome>,
    pub overrides: usize,
    pub summary: Summary,
    pub series: BTreeMap<BucketKey, Vec<BucketSummary>>,
    pub growth: Vec<GrowthPoint>,
    pub best_weekday: Option<BucketSummary>,
    pub best_time_slot: Option<BucketSummary>,
    pub top: Vec<RecordView>,
    /// Every record, newest first.
    pub records: Vec<RecordView>,
}

pub struct DashboardInput<'a> {
    pub run_id: &'a str,
    pub generated_at: DateTime<Utc>,
    pub aggregator: &'a Aggregator,
    pub records: &'a [Record],
    pub top_n: usize,
    pub freshness: Freshness,
    pub page: Option<PageInfo>,
    pub sources: Vec<SourceOutcome>,
    pub overrides: usize,
}

/// Records sorted newest first; equal timestamps keep their order.
pub fn newest_first(records: &[Record]) -> Vec<Record> {
    let mut sorted = records.to_vec();
    sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    sorted
}

impl Dashboard {
    pub fn build(input: DashboardInput<'_>) -> Self {
        let aggregator = input.aggregator;
        let ordered = newest_first(input.records);
        let series: BTreeMap<BucketKey, Vec<BucketSummary>> = BucketKey::ALL
            .iter()
            .map(|key| (*key, aggregator.aggregate(&ordered, *key)))
            .collect();
        let growth = series
            .get(&BucketKey::IsoWeek)
            .map(|weeks| growth_series(weeks))
            .unwrap_or_default();
        let best = |key: BucketKey| {
            series
                .get(&key)
                .and_then(|buckets| best_bucket(buckets))
                .cloned()
        };

        Self {
            run_id: input.run_id.to_string(),
            generated_at: input.generated_at,
            report_offset: aggregator.offset().to_string(),
            freshness: input.freshness,
            page: input.page,
            sources: input.sources,
            overrides: input.overrides,
            summary: aggregator.summarize(&ordered),
            best_weekday: best(BucketKey::Weekday),
            best_time_slot: best(BucketKey::TimeSlot),
            top: top_n(&ordered, input.top_n)
                .iter()
                .map(|record| RecordView::new(record, aggregator))
                .collect(),
            records: ordered
                .iter()
                .map(|record| RecordView::new(record, aggregator))
                .collect(),
            series,
            growth,
        }
    }
}

#[derive(Debug, Serialize)]
struct PostRow<'a> {
    id: &'a str,
    local_time: &'a str,
    #[serde(rename = "type")]
    post_type: &'static str,
    reactions: u64,
    comments: u64,
    shares: u64,
    engagement: u64,
    views: Option<u64>,
    reach: Option<u64>,
    permalink: Option<&'a str>,
    message: Option<&'a str>,
}

impl<'a> PostRow<'a> {
    fn from_view(view: &'a RecordView) -> Self {
        let record = &view.record;
        Self {
            id: &record.id,
            local_time: &view.local_time,
            post_type: record.post_type.as_str(),
            reactions: record.reactions,
            comments: record.comments,
            shares: record.shares,
            engagement: view.engagement,
            views: record.views,
            reach: record.reach,
            permalink: record.permalink.as_deref(),
            message: record.message.as_deref(),
        }
    }
}

const POST_COLUMNS: [&str; 11] = [
    "id",
    "local_time",
    "type",
    "reactions",
    "comments",
    "shares",
    "engagement",
    "views",
    "reach",
    "permalink",
    "message",
];

const BUCKET_COLUMNS: [&str; 7] = [
    "bucket",
    "count",
    "reactions",
    "comments",
    "shares",
    "engagement",
    "mean_engagement",
];

/// CSV writer whose header row is written up front, so an empty table
/// still carries its columns.
fn csv_with_header(columns: &[&str]) -> Result<csv::Writer<Vec<u8>>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(columns).context("writing csv header")?;
    Ok(writer)
}

fn posts_csv(views: &[RecordView]) -> Result<Vec<u8>> {
    let mut writer = csv_with_header(&POST_COLUMNS)?;
    for view in views {
        writer.serialize(PostRow::from_view(view)).context("serializing post row")?;
    }
    writer.into_inner().context("flushing posts csv")
}

fn buckets_csv(buckets: &[BucketSummary]) -> Result<Vec<u8>> {
    let mut writer = csv_with_header(&BUCKET_COLUMNS)?;
    for bucket in buckets {
        writer.serialize(bucket).context("serializing bucket row")?;
    }
    writer.into_inner().context("flushing bucket csv")
}

pub fn daily_brief_markdown(dashboard: &Dashboard) -> String {
    let summary = &dashboard.summary;
    let freshness = &dashboard.freshness;
    let mut lines = vec![
        "# Page Engagement Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", dashboard.run_id),
        format!("- Generated: {}", dashboard.generated_at.to_rfc3339()),
        format!(
            "- Data as of: {}",
            freshness
                .data_as_of
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string())
        ),
    ];
    if freshness.stale {
        lines.push("- **STALE**: data is older than expected, came from a cache fallback, or misses an unreadable cache".to_string());
    }
    if !freshness.fallbacks.is_empty() {
        lines.push(format!("- Cache fallbacks: {}", freshness.fallbacks.join(", ")));
    }
    if !freshness.interrupted.is_empty() {
        lines.push(format!("- Partial fetches: {}", freshness.interrupted.join(", ")));
    }
    if !freshness.unreadable_caches.is_empty() {
        lines.push(format!(
            "- Unreadable caches (not rewritten): {}",
            freshness.unreadable_caches.join(", ")
        ));
    }

    if let Some(page) = &dashboard.page {
        lines.push(String::new());
        lines.push(format!("## Page: {}", page.name.as_deref().unwrap_or("unnamed")));
        let count = |value: Option<u64>| value.map_or_else(|| "n/a".to_string(), |v| v.to_string());
        lines.push(format!("- Followers: {}", count(page.audience())));
        lines.push(format!("- Talking about (weekly): {}", count(page.talking_about_count)));
        if let Some(rating) = page.overall_star_rating {
            lines.push(format!(
                "- Rating: {rating:.1}/5 ({} reviews)",
                count(page.rating_count)
            ));
        }
        lines.push(format!("- Page metrics as of: {}", page.fetched_at.to_rfc3339()));
    }

    lines.push(String::new());
    lines.push("## Totals".to_string());
    lines.push(format!("- Records: {}", summary.records));
    lines.push(format!(
        "- Engagement: {} ({} reactions, {} comments, {} shares)",
        summary.engagement, summary.reactions, summary.comments, summary.shares
    ));
    lines.push(format!("- Average engagement: {:.1}", summary.avg_engagement));
    if let (Some(first), Some(last)) = (summary.first_day, summary.last_day) {
        lines.push(format!("- Range: {first} to {last}"));
    }
    if let Some(best) = &dashboard.best_weekday {
        lines.push(format!("- Best weekday: {} ({:.1} avg)", best.bucket, best.mean_engagement));
    }
    if let Some(best) = &dashboard.best_time_slot {
        lines.push(format!("- Best time slot: {} ({:.1} avg)", best.bucket, best.mean_engagement));
    }

    lines.push(String::new());
    lines.push("## Sources".to_string());
    for source in &dashboard.sources {
        let mut line = format!(
            "- {} ({}): {:?}, {} records",
            source.source_id, source.kind, source.status, source.records
        );
        if let Some(detail) = &source.detail {
            line.push_str(&format!(" ({detail})"));
        }
        lines.push(line);
    }

    lines.push(String::new());
    lines.push("## Top Posts".to_string());
    for (rank, view) in dashboard.top.iter().take(5).enumerate() {
        lines.push(format!(
            "{}. `{}` {} {}: {} engagement",
            rank + 1,
            view.record.id,
            view.local_time,
            view.record.post_type,
            view.engagement
        ));
    }

    if let Some(latest) = dashboard.growth.last() {
        lines.push(String::new());
        lines.push(format!(
            "Week {}: {} engagement ({:+.1}% week over week)",
            latest.bucket, latest.engagement, latest.change_pct
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_records_parquet(path: &Path, views: &[RecordView]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("created_at", DataType::Utf8, false),
        ArrowField::new("type", DataType::Utf8, false),
        ArrowField::new("reactions", DataType::UInt64, false),
        ArrowField::new("comments", DataType::UInt64, false),
        ArrowField::new("shares", DataType::UInt64, false),
        ArrowField::new("engagement", DataType::UInt64, false),
        ArrowField::new("views", DataType::UInt64, true),
        ArrowField::new("reach", DataType::UInt64, true),
        ArrowField::new("permalink", DataType::Utf8, true),
    ]));
    let records: Vec<&Record> = views.iter().map(|view| &view.record).collect();

    let ids = StringArray::from(records.iter().map(|r| Some(r.id.as_str())).collect::<Vec<_>>());
    let created = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.created_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let types = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.post_type.as_str()))
            .collect::<Vec<_>>(),
    );
    let reactions = UInt64Array::from(records.iter().map(|r| r.reactions).collect::<Vec<_>>());
    let comments = UInt64Array::from(records.iter().map(|r| r.comments).collect::<Vec<_>>());
    let shares = UInt64Array::from(records.iter().map(|r| r.shares).collect::<Vec<_>>());
    let engagement = UInt64Array::from(views.iter().map(|v| v.engagement).collect::<Vec<_>>());
    let view_counts = UInt64Array::from(records.iter().map(|r| r.views).collect::<Vec<_>>());
    let reach = UInt64Array::from(records.iter().map(|r| r.reach).collect::<Vec<_>>());
    let permalinks = StringArray::from(
        records
            .iter()
            .map(|r| r.permalink.as_deref())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(created),
            Arc::new(types),
            Arc::new(reactions),
            Arc::new(comments),
            Arc::new(shares),
            Arc::new(engagement),
            Arc::new(view_counts),
            Arc::new(reach),
            Arc::new(permalinks),
        ],
    )
    .context("building records record batch")?;
    write_parquet(path, batch)
}

fn write_daily_parquet(path: &Path, days: &[BucketSummary]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("day", DataType::Utf8, false),
        ArrowField::new("count", DataType::UInt64, false),
        ArrowField::new("engagement", DataType::UInt64, false),
        ArrowField::new("mean_engagement", DataType::Float64, false),
    ]));
    let labels = StringArray::from(days.iter().map(|d| Some(d.bucket.as_str())).collect::<Vec<_>>());
    let counts = UInt64Array::from(days.iter().map(|d| d.count as u64).collect::<Vec<_>>());
    let engagement = UInt64Array::from(days.iter().map(|d| d.engagement).collect::<Vec<_>>());
    let means = Float64Array::from(days.iter().map(|d| d.mean_engagement).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(labels),
            Arc::new(counts),
            Arc::new(engagement),
            Arc::new(means),
        ],
    )
    .context("building daily record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

async fn write_file(path: PathBuf, bytes: Vec<u8>) -> Result<PathBuf> {
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Writes the run directory `reports_root/<run_id>/` and returns its path.
pub async fn write_run_reports(reports_root: &Path, dashboard: &Dashboard) -> Result<PathBuf> {
    let run_dir = reports_root.join(&dashboard.run_id);
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let dashboard_json = serde_json::to_vec_pretty(dashboard).context("serializing dashboard")?;
    let by_type = dashboard
        .series
        .get(&BucketKey::PostType)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let outputs = [
        ("daily_brief", "daily_brief.md", daily_brief_markdown(dashboard).into_bytes()),
        ("dashboard", DASHBOARD_FILE, dashboard_json),
        ("posts", "posts.csv", posts_csv(&dashboard.records)?),
        ("top_posts", "top_posts.csv", posts_csv(&dashboard.top)?),
        ("by_type", "by_type.csv", buckets_csv(by_type)?),
    ];
    let mut written = Vec::with_capacity(outputs.len());
    for (name, file_name, bytes) in outputs {
        written.push((name, write_file(run_dir.join(file_name), bytes).await?));
    }

    let records_path = snapshot_dir.join("records.parquet");
    let daily_path = snapshot_dir.join("daily.parquet");
    write_records_parquet(&records_path, &dashboard.records)?;
    let days = dashboard
        .series
        .get(&BucketKey::Day)
        .map(Vec::as_slice)
        .unwrap_or_default();
    write_daily_parquet(&daily_path, days)?;

    let mut files = written
        .iter()
        .map(|(name, path)| manifest_entry(name, &run_dir, path))
        .collect::<Result<Vec<_>>>()?;
    files.push(manifest_entry("records", &run_dir, &records_path)?);
    files.push(manifest_entry("daily", &run_dir, &daily_path)?);

    let manifest = SnapshotManifest {
        schema_version: 1,
        files,
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    write_file(manifest_path, bytes).await?;

    Ok(run_dir)
}

/// Pointer the dashboard reads first; updated atomically after every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardStatus {
    pub run_id: String,
    pub updated_at: DateTime<Utc>,
    pub stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub data_as_of: Option<DateTime<Utc>>,
    /// Run directory holding the dashboard to show.
    #[serde(default)]
    pub report_dir: Option<String>,
}

pub async fn read_status(reports_root: &Path) -> Result<Option<DashboardStatus>> {
    read_json_file(&reports_root.join(STATUS_FILE)).await
}

pub async fn write_status(reports_root: &Path, status: &DashboardStatus) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(status).context("serializing dashboard status")?;
    write_atomic(&reports_root.join(STATUS_FILE), &bytes).await
}

/// Marks the dashboard stale while leaving the last good report in place.
pub async fn mark_stale(reports_root: &Path, run_id: &str, reason: &str) -> Result<DashboardStatus> {
    let previous = read_status(reports_root).await?;
    let status = DashboardStatus {
        run_id: run_id.to_string(),
        updated_at: Utc::now(),
        stale: true,
        reason: Some(reason.to_string()),
        data_as_of: previous.as_ref().and_then(|p| p.data_as_of),
        report_dir: previous.and_then(|p| p.report_dir),
    };
    write_status(reports_root, &status).await?;
    Ok(status)
}

/// Markdown listing of the newest `runs` report directories.
pub fn report_index(reports_root: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    dirs.sort();
    dirs.reverse();

    let mut lines = vec!["# Page Engagement Reports".to_string(), String::new()];
    let status_path = reports_root.join(STATUS_FILE);
    if let Ok(text) = std::fs::read_to_string(&status_path) {
        let status: DashboardStatus = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", status_path.display()))?;
        lines.push(format!(
            "Current: `{}`{}",
            status.report_dir.as_deref().unwrap_or("none"),
            if status.stale { " (stale)" } else { "" }
        ));
        if let Some(reason) = status.reason {
            lines.push(format!("Reason: {reason}"));
        }
        lines.push(String::new());
    }

    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        lines.push(format!("## Run `{run_id}`"));

        let dashboard_path = dir.join(DASHBOARD_FILE);
        match std::fs::read_to_string(&dashboard_path) {
            Ok(text) => {
                let value: serde_json::Value = serde_json::from_str(&text)
                    .with_context(|| format!("parsing {}", dashboard_path.display()))?;
                let summary = &value["summary"];
                lines.push(format!("- records: {}", summary["records"].as_u64().unwrap_or(0)));
                lines.push(format!("- engagement: {}", summary["engagement"].as_u64().unwrap_or(0)));
                lines.push(format!(
                    "- data as of: {}",
                    value["freshness"]["data_as_of"].as_str().unwrap_or("unknown")
                ));
                if value["freshness"]["stale"].as_bool().unwrap_or(false) {
                    lines.push("- stale: yes".to_string());
                }
                lines.push(format!("- dashboard: `{}`", dashboard_path.display()));
            }
            Err(_) => lines.push("- incomplete run (no dashboard.json)".to_string()),
        }
        let brief = dir.join("daily_brief.md");
        if brief.exists() {
            lines.push(format!("- daily brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};
    use pulse_core::PostType;
    use tempfile::tempdir;

    fn record(id: &str, day: u32, engagement: u64) -> Record {
        Record {
            id: id.to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 6, day, 10, 0, 0).unwrap(),
            post_type: PostType::Photo,
            reactions: engagement,
            comments: 0,
            shares: 0,
            views: None,
            reach: Some(100),
            permalink: None,
            message: Some("Hello, \"world\"".into()),
            reactions_breakdown: None,
        }
    }

    fn dashboard(records: &[Record]) -> Dashboard {
        let aggregator = Aggregator::new(FixedOffset::east_opt(8 * 3600).unwrap());
        Dashboard::build(DashboardInput {
            run_id: "20250701T000000Z-abcdef12",
            generated_at: Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap(),
            aggregator: &aggregator,
            records,
            top_n: 2,
            freshness: Freshness {
                data_as_of: None,
                stale: false,
                fallbacks: vec![],
                interrupted: vec![],
                unreadable_caches: vec![],
            },
            page: None,
            sources: vec![],
            overrides: 0,
        })
    }

    #[test]
    fn run_ids_sort_by_start_time() {
        let early = new_run_id(Utc.with_ymd_and_hms(2025, 6, 1, 6, 0, 0).unwrap());
        let late = new_run_id(Utc.with_ymd_and_hms(2025, 6, 1, 18, 0, 0).unwrap());
        assert!(early.starts_with("20250601T060000Z-"));
        assert_eq!(early.len(), "20250601T060000Z-".len() + 8);
        assert!(early < late);
    }

    #[test]
    fn dashboard_lists_records_newest_first_with_every_series() {
        let dash = dashboard(&[record("old", 10, 5), record("new", 20, 1), record("mid", 15, 9)]);
        let ids: Vec<&str> = dash.records.iter().map(|v| v.record.id.as_str()).collect();
        assert_eq!(ids, ["new", "mid", "old"]);
        assert_eq!(dash.top[0].record.id, "mid");
        assert_eq!(dash.series.len(), BucketKey::ALL.len());
        assert_eq!(dash.series[&BucketKey::Weekday].len(), 7);
        assert_eq!(dash.report_offset, "+08:00");

        let json = serde_json::to_value(&dash).unwrap();
        assert_eq!(json["records"][0]["engagement"], 1);
        assert_eq!(json["records"][0]["type"], "photo");
        assert!(json["series"]["iso_week"].is_array());
    }

    #[tokio::test]
    async fn run_reports_are_written_with_a_hashed_manifest() {
        let dir = tempdir().unwrap();
        let dash = dashboard(&[record("1", 10, 5), record("2", 20, 1)]);
        let run_dir = write_run_reports(dir.path(), &dash).await.unwrap();

        for name in ["daily_brief.md", "dashboard.json", "posts.csv", "top_posts.csv", "by_type.csv"] {
            assert!(run_dir.join(name).exists(), "missing {name}");
        }
        let posts = std::fs::read_to_string(run_dir.join("posts.csv")).unwrap();
        let mut lines = posts.lines();
        assert_eq!(
            lines.next().unwrap(),
            "id,local_time,type,reactions,comments,shares,engagement,views,reach,permalink,message"
        );
        assert!(lines.next().unwrap().starts_with("2,2025-06-20 18:00,photo,1,0,0,1,,100,,"));

        let manifest: SnapshotManifest = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join("snapshots").join("manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.files.len(), 7);
        let records = manifest.files.iter().find(|f| f.name == "records").unwrap();
        let bytes = std::fs::read(run_dir.join(&records.path)).unwrap();
        assert_eq!(records.sha256, sha256_hex(&bytes));
    }

    #[test]
    fn page_metrics_appear_in_the_brief_and_dashboard() {
        let mut dash = dashboard(&[record("1", 10, 5)]);
        assert!(!daily_brief_markdown(&dash).contains("## Page"));
        assert!(serde_json::to_value(&dash).unwrap()["page"].is_null());

        dash.page = Some(PageInfo {
            id: Some("42".into()),
            name: Some("Test Page".into()),
            fan_count: Some(1200),
            followers_count: None,
            talking_about_count: Some(87),
            overall_star_rating: Some(4.66),
            rating_count: Some(31),
            fetched_at: Utc.with_ymd_and_hms(2025, 6, 30, 9, 0, 0).unwrap(),
        });
        let brief = daily_brief_markdown(&dash);
        assert!(brief.contains("## Page: Test Page"));
        assert!(brief.contains("- Followers: 1200"));
        assert!(brief.contains("- Talking about (weekly): 87"));
        assert!(brief.contains("- Rating: 4.7/5 (31 reviews)"));

        let json = serde_json::to_value(&dash).unwrap();
        assert_eq!(json["page"]["fan_count"], 1200);
        assert_eq!(json["page"]["name"], "Test Page");
    }

    #[test]
    fn empty_tables_still_carry_their_header() {
        let posts = String::from_utf8(posts_csv(&[]).unwrap()).unwrap();
        assert_eq!(posts, format!("{}\n", POST_COLUMNS.join(",")));
        let buckets = String::from_utf8(buckets_csv(&[]).unwrap()).unwrap();
        assert_eq!(
            buckets,
            "bucket,count,reactions,comments,shares,engagement,mean_engagement\n"
        );

        let dash = dashboard(&[record("1", 10, 5)]);
        let rows = String::from_utf8(buckets_csv(&dash.series[&BucketKey::Weekday]).unwrap()).unwrap();
        assert_eq!(rows.lines().count(), 1 + 7);
    }

    #[tokio::test]
    async fn marking_stale_keeps_the_previous_report_dir() {
        let dir = tempdir().unwrap();
        write_status(
            dir.path(),
            &DashboardStatus {
                run_id: "run-1".into(),
                updated_at: Utc::now(),
                stale: false,
                reason: None,
                data_as_of: Some(Utc.with_ymd_and_hms(2025, 6, 30, 0, 0, 0).unwrap()),
                report_dir: Some("reports/run-1".into()),
            },
        )
        .await
        .unwrap();

        let status = mark_stale(dir.path(), "run-2", "no usable source").await.unwrap();
        assert!(status.stale);
        assert_eq!(status.report_dir.as_deref(), Some("reports/run-1"));
        assert_eq!(read_status(dir.path()).await.unwrap(), Some(status));
    }

    #[tokio::test]
    async fn index_lists_newest_runs_first() {
        let dir = tempdir().unwrap();
        let mut first = dashboard(&[record("1", 10, 5)]);
        first.run_id = "20250601T060000Z-aaaaaaaa".into();
        let mut second = dashboard(&[record("1", 10, 5), record("2", 11, 3)]);
        second.run_id = "20250602T060000Z-bbbbbbbb".into();
        write_run_reports(dir.path(), &first).await.unwrap();
        write_run_reports(dir.path(), &second).await.unwrap();

        let index = report_index(dir.path(), 1).unwrap();
        assert!(index.contains("## Run `20250602T060000Z-bbbbbbbb`"));
        assert!(index.contains("- engagement: 8"));
        assert!(!index.contains("20250601T060000Z-aaaaaaaa"));
    }
}
