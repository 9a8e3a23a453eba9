//! Pipeline configuration and the ordered source registry.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use pulse_adapters::graph::{DEFAULT_BASE_URL, DEFAULT_MAX_PAGES};
use pulse_adapters::GraphClientConfig;
use pulse_core::{EntityKind, SourceKind};
use pulse_storage::{BackoffPolicy, HttpClientConfig};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

pub const REGISTRY_FILE: &str = "sources.yaml";

/// File name `merge-exports` writes and the default registry reads.
pub const MERGED_EXPORT_FILE: &str = "page_MERGED_ALL.csv";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub graph_base_url: String,
    pub page_id: Option<String>,
    pub page_token: Option<String>,
    pub workspace_root: PathBuf,
    pub cache_dir: PathBuf,
    pub exports_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub page_size: u32,
    pub call_delay_ms: u64,
    pub http_timeout_secs: u64,
    /// Lower bound for full refreshes.
    pub since: Option<NaiveDate>,
    /// Offset the spreadsheet exporter writes publish times in.
    pub export_offset: FixedOffset,
    /// Offset all time buckets are computed in.
    pub report_offset: FixedOffset,
    pub stale_after_hours: i64,
    pub top_n: usize,
    pub scheduler_cron: String,
    pub user_agent: String,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Malformed values are logged and replaced by `default`.
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env_string(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring malformed setting; using the default");
            default
        }),
    }
}

/// Whole-hour UTC offset; out-of-range values fall back to UTC.
pub fn offset_from_hours(hours: i32) -> FixedOffset {
    hours
        .checked_mul(3600)
        .and_then(FixedOffset::east_opt)
        .unwrap_or_else(|| {
            warn!(hours, "UTC offset out of range; using UTC");
            Utc.fix()
        })
}

impl PipelineConfig {
    /// Defaults rooted at `workspace_root`, with no credentials.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            graph_base_url: DEFAULT_BASE_URL.to_string(),
            page_id: None,
            page_token: None,
            workspace_root: workspace_root.into(),
            cache_dir: PathBuf::from("api_cache"),
            exports_dir: PathBuf::from("exports"),
            reports_dir: PathBuf::from("reports"),
            artifacts_dir: PathBuf::from("artifacts"),
            page_size: 100,
            call_delay_ms: 300,
            http_timeout_secs: 30,
            since: None,
            export_offset: offset_from_hours(-8),
            report_offset: offset_from_hours(8),
            stale_after_hours: 24,
            top_n: 15,
            scheduler_cron: "0 0 6,18 * * *".to_string(),
            user_agent: format!("pulse-bot/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::for_workspace(
            env_string("PULSE_WORKSPACE_ROOT").unwrap_or_else(|| ".".to_string()),
        );
        Self {
            graph_base_url: env_string("PULSE_GRAPH_BASE_URL").unwrap_or(defaults.graph_base_url),
            page_id: env_string("PULSE_PAGE_ID"),
            page_token: env_string("PULSE_PAGE_TOKEN"),
            cache_dir: env_string("PULSE_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            exports_dir: env_string("PULSE_EXPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.exports_dir),
            reports_dir: env_string("PULSE_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            artifacts_dir: env_string("PULSE_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            page_size: env_parse("PULSE_PAGE_SIZE", defaults.page_size),
            call_delay_ms: env_parse("PULSE_CALL_DELAY_MS", defaults.call_delay_ms),
            http_timeout_secs: env_parse("PULSE_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            since: env_string("PULSE_SINCE").and_then(|v| {
                NaiveDate::parse_from_str(&v, "%Y-%m-%d")
                    .map_err(|err| warn!(value = %v, error = %err, "ignoring malformed PULSE_SINCE"))
                    .ok()
            }),
            export_offset: offset_from_hours(env_parse("PULSE_EXPORT_UTC_OFFSET_HOURS", -8)),
            report_offset: offset_from_hours(env_parse("PULSE_REPORT_UTC_OFFSET_HOURS", 8)),
            stale_after_hours: env_parse("PULSE_STALE_AFTER_HOURS", defaults.stale_after_hours),
            top_n: env_parse("PULSE_TOP_N", defaults.top_n),
            scheduler_cron: env_string("PULSE_SCHEDULER_CRON").unwrap_or(defaults.scheduler_cron),
            user_agent: env_string("PULSE_USER_AGENT").unwrap_or(defaults.user_agent),
            workspace_root: defaults.workspace_root,
        }
    }

    /// Resolves a configured path against the workspace root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    pub fn cache_path(&self) -> PathBuf {
        self.resolve(&self.cache_dir)
    }

    pub fn exports_path(&self) -> PathBuf {
        self.resolve(&self.exports_dir)
    }

    pub fn reports_path(&self) -> PathBuf {
        self.resolve(&self.reports_dir)
    }

    pub fn artifacts_path(&self) -> PathBuf {
        self.resolve(&self.artifacts_dir)
    }

    pub fn since_utc(&self) -> Option<DateTime<Utc>> {
        self.since
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            call_delay: Duration::from_millis(self.call_delay_ms),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Graph client settings, or why the API cannot be used.
    pub fn graph_client_config(&self) -> std::result::Result<GraphClientConfig, String> {
        let page_id = self.page_id.clone().ok_or("PULSE_PAGE_ID is not set")?;
        let token = self.page_token.clone().ok_or("PULSE_PAGE_TOKEN is not set")?;
        Ok(GraphClientConfig {
            base_url: self.graph_base_url.clone(),
            page_size: self.page_size,
            max_pages: DEFAULT_MAX_PAGES,
            http: self.http_config(),
            ..GraphClientConfig::new(page_id, token)
        })
    }
}

fn default_enabled() -> bool {
    true
}

/// One upstream. Registry order is priority: later sources win on conflicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl SourceConfig {
    /// Entity kind for api/cache sources; spreadsheets always hold posts.
    pub fn entity_or_posts(&self) -> EntityKind {
        self.entity.unwrap_or(EntityKind::Posts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    /// Posts cache, then the merged spreadsheet export, then the live posts API.
    pub fn builtin() -> Self {
        Self {
            sources: vec![
                SourceConfig {
                    source_id: "posts-cache".into(),
                    display_name: "Cached posts".into(),
                    enabled: true,
                    kind: SourceKind::Cache,
                    entity: Some(EntityKind::Posts),
                    path: None,
                    notes: None,
                },
                SourceConfig {
                    source_id: "meta-export".into(),
                    display_name: "Merged spreadsheet export".into(),
                    enabled: true,
                    kind: SourceKind::Spreadsheet,
                    entity: None,
                    path: Some(PathBuf::from("exports").join(MERGED_EXPORT_FILE)),
                    notes: None,
                },
                SourceConfig {
                    source_id: "posts-api".into(),
                    display_name: "Graph API posts".into(),
                    enabled: true,
                    kind: SourceKind::Api,
                    entity: Some(EntityKind::Posts),
                    path: None,
                    notes: None,
                },
            ],
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    /// Reads `sources.yaml` under `workspace_root`, or the built-in registry if absent.
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(REGISTRY_FILE);
        match fs::read_to_string(&path).await {
            Ok(text) => Self::from_yaml(&text).with_context(|| format!("loading {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::builtin()),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.source_id.as_str()) {
                bail!("duplicate source_id {}", source.source_id);
            }
            match source.kind {
                SourceKind::Api if source.entity.is_none() => {
                    bail!("api source {} needs an entity", source.source_id)
                }
                SourceKind::Spreadsheet if source.path.is_none() => {
                    bail!("spreadsheet source {} needs a path", source.source_id)
                }
                SourceKind::Cache if source.entity.is_none() && source.path.is_none() => {
                    bail!("cache source {} needs an entity or a path", source.source_id)
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|source| source.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_orders_cache_then_export_then_api() {
        let registry = SourceRegistry::builtin();
        registry.validate().unwrap();
        let kinds: Vec<SourceKind> = registry.enabled().map(|s| s.kind).collect();
        assert_eq!(kinds, [SourceKind::Cache, SourceKind::Spreadsheet, SourceKind::Api]);
    }

    #[test]
    fn yaml_registry_keeps_declared_order_and_defaults_enabled() {
        let registry = SourceRegistry::from_yaml(
            r#"
sources:
  - source_id: reels-api
    display_name: Reels
    kind: api
    entity: reels
  - source_id: old-export
    display_name: Old export
    kind: spreadsheet
    path: exports/old.csv
    enabled: false
"#,
        )
        .unwrap();
        assert_eq!(registry.sources[0].source_id, "reels-api");
        assert!(registry.sources[0].enabled);
        assert_eq!(registry.enabled().count(), 1);
    }

    #[test]
    fn sample_registry_is_valid() {
        let registry = SourceRegistry::from_yaml(include_str!("../../../sources.yaml")).unwrap();
        let last = registry.enabled().last().unwrap();
        assert_eq!(last.source_id, "posts-api");
        assert!(registry.enabled().all(|s| s.source_id != "reactions-checkpoint"));
    }

    #[test]
    fn registry_rejects_api_source_without_entity() {
        let err = SourceRegistry::from_yaml(
            "sources:\n  - source_id: x\n    display_name: X\n    kind: api\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("needs an entity"));
    }

    #[tokio::test]
    async fn missing_registry_file_uses_builtin() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(SourceRegistry::load(dir.path()).await.unwrap(), SourceRegistry::builtin());
    }

    #[test]
    fn credentials_are_required_for_the_graph_client() {
        let mut config = PipelineConfig::for_workspace("/tmp/pulse");
        assert!(config.graph_client_config().is_err());
        config.page_id = Some("42".into());
        config.page_token = Some("tok".into());
        let graph = config.graph_client_config().unwrap();
        assert_eq!(graph.page_size, 100);
        assert_eq!(config.cache_path(), PathBuf::from("/tmp/pulse/api_cache"));
    }

    #[test]
    fn offsets_out_of_range_fall_back_to_utc() {
        assert_eq!(offset_from_hours(8).local_minus_utc(), 8 * 3600);
        assert_eq!(offset_from_hours(99).local_minus_utc(), 0);
        assert_eq!(offset_from_hours(-8).local_minus_utc(), -8 * 3600);
        assert_eq!(offset_from_hours(i32::MAX).local_minus_utc(), 0);
        assert_eq!(offset_from_hours(i32::MIN).local_minus_utc(), 0);
    }

    #[test]
    fn malformed_numbers_keep_the_default() {
        std::env::set_var("PULSE_TEST_MALFORMED_PAGE_SIZE", "lots");
        assert_eq!(env_parse("PULSE_TEST_MALFORMED_PAGE_SIZE", 100u32), 100);
        std::env::set_var("PULSE_TEST_MALFORMED_PAGE_SIZE", " 25 ");
        assert_eq!(env_parse("PULSE_TEST_MALFORMED_PAGE_SIZE", 100u32), 25);
        std::env::remove_var("PULSE_TEST_MALFORMED_PAGE_SIZE");
        assert_eq!(env_parse("PULSE_TEST_MALFORMED_PAGE_SIZE", 100u32), 100);
    }
}
