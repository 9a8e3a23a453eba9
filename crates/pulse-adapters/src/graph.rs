//! Paginated Graph API client.
//!
//! Responses are checked for an `{"error": {...}}` payload whether or not the
//! HTTP status signalled failure. Oversized pages are retried with a smaller
//! `limit`; other upstream errors end the phase. Anything fetched before the
//! phase ended is returned with `interrupted` set.

use chrono::{DateTime, Utc};
use pulse_core::{EntityKind, PageInfo, ReactionBreakdown};
use pulse_storage::{redact_token, FetchError, HttpClientConfig, HttpFetcher};
use reqwest::Url;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

use crate::normalize::{breakdown_from, page_info_from};

pub const DEFAULT_BASE_URL: &str = "https://graph.facebook.com/v21.0";
pub const DEFAULT_MAX_PAGES: usize = 200;

/// Page sizes tried in order when the API asks for less data per call.
pub const PAGE_SIZE_STEPS: [u32; 4] = [100, 50, 25, 10];

const REACTION_BREAKDOWN_FIELDS: &str = "reactions.type(LIKE).summary(total_count).as(like),\
reactions.type(LOVE).summary(total_count).as(love),\
reactions.type(HAHA).summary(total_count).as(haha),\
reactions.type(WOW).summary(total_count).as(wow),\
reactions.type(SAD).summary(total_count).as(sad),\
reactions.type(ANGRY).summary(total_count).as(angry)";

const PAGE_INFO_FIELDS: &str =
    "id,name,fan_count,followers_count,talking_about_count,overall_star_rating,rating_count";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphErrorKind {
    DataTooLarge,
    RateLimited,
    AuthExpired,
    Other,
}

impl GraphErrorKind {
    pub fn classify(message: &str, code: Option<i64>) -> Self {
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("reduce the amount") || code == Some(1) {
            return GraphErrorKind::DataTooLarge;
        }
        match code {
            Some(4 | 17 | 32 | 613) => GraphErrorKind::RateLimited,
            Some(190) => GraphErrorKind::AuthExpired,
            _ if lowered.contains("rate limit") || lowered.contains("too many calls") => {
                GraphErrorKind::RateLimited
            }
            _ => GraphErrorKind::Other,
        }
    }
}

/// Structured error payload returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("graph api error ({kind:?}, code {code:?}): {message}")]
pub struct GraphApiError {
    pub message: String,
    pub code: Option<i64>,
    pub kind: GraphErrorKind,
}

impl GraphApiError {
    pub fn from_payload(value: &JsonValue) -> Option<Self> {
        let error = value.get("error")?;
        let message = error
            .get("message")
            .and_then(JsonValue::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let code = error.get("code").and_then(JsonValue::as_i64);
        Some(Self {
            kind: GraphErrorKind::classify(&message, code),
            message,
            code,
        })
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Api(#[from] GraphApiError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid json from {url}: {source}")]
    InvalidJson {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid graph url {0}")]
    Url(String),
    #[error("building http client: {0}")]
    Client(String),
    #[error("graph client is missing {0}")]
    MissingCredential(&'static str),
}

#[derive(Debug, Clone)]
pub struct GraphClientConfig {
    pub base_url: String,
    pub page_id: String,
    pub access_token: String,
    pub page_size: u32,
    pub max_pages: usize,
    pub http: HttpClientConfig,
}

impl GraphClientConfig {
    pub fn new(page_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            page_id: page_id.into(),
            access_token: access_token.into(),
            page_size: PAGE_SIZE_STEPS[0],
            max_pages: DEFAULT_MAX_PAGES,
            http: HttpClientConfig::default(),
        }
    }
}

/// Items collected for one edge, plus why collection stopped early, if it did.
#[derive(Debug, Clone)]
pub struct EdgeFetch {
    pub entity: EntityKind,
    pub items: Vec<JsonValue>,
    pub pages: usize,
    pub interrupted: Option<String>,
}

impl EdgeFetch {
    pub fn is_complete(&self) -> bool {
        self.interrupted.is_none()
    }
}

#[derive(Debug)]
pub struct GraphClient {
    http: HttpFetcher,
    config: GraphClientConfig,
}

fn edge_path(entity: EntityKind) -> &'static str {
    match entity {
        EntityKind::Posts => "posts",
        EntityKind::Videos => "videos",
        EntityKind::Reels => "video_reels",
        EntityKind::Stories => "stories",
    }
}

fn edge_fields(entity: EntityKind) -> Option<&'static str> {
    match entity {
        EntityKind::Posts => Some(
            "id,message,created_time,shares,permalink_url,status_type,\
             reactions.summary(true),comments.summary(true)",
        ),
        EntityKind::Videos => Some(
            "id,title,description,created_time,length,views,permalink_url,\
             likes.summary(true),comments.summary(true)",
        ),
        EntityKind::Reels => Some(
            "id,description,created_time,permalink_url,likes.summary(true),comments.summary(true)",
        ),
        EntityKind::Stories => None,
    }
}

/// Next page size below `current`, if any.
pub fn smaller_page_size(current: u32) -> Option<u32> {
    PAGE_SIZE_STEPS.iter().copied().find(|&size| size < current)
}

/// Rewrites the `limit` query parameter, keeping every other parameter (cursor included).
pub fn with_limit(url: &str, limit: u32) -> Result<String, GraphError> {
    let mut parsed = Url::parse(url).map_err(|_| GraphError::Url(redact_token(url)))?;
    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| key != "limit")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    {
        let mut query = parsed.query_pairs_mut();
        query.clear();
        for (key, value) in &pairs {
            query.append_pair(key, value);
        }
        query.append_pair("limit", &limit.to_string());
    }
    Ok(parsed.to_string())
}

fn next_page_url(body: &JsonValue) -> Option<String> {
    body.get("paging")?
        .get("next")?
        .as_str()
        .filter(|next| !next.is_empty())
        .map(ToString::to_string)
}

impl GraphClient {
    pub fn new(config: GraphClientConfig) -> Result<Self, GraphError> {
        if config.page_id.trim().is_empty() {
            return Err(GraphError::MissingCredential("page id"));
        }
        if config.access_token.trim().is_empty() {
            return Err(GraphError::MissingCredential("access token"));
        }
        let http = HttpFetcher::new(config.http.clone())
            .map_err(|err| GraphError::Client(format!("{err:#}")))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &GraphClientConfig {
        &self.config
    }

    fn object_url(&self, path: &str) -> Result<Url, GraphError> {
        let raw = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        Url::parse(&raw).map_err(|_| GraphError::Url(raw))
    }

    pub fn edge_url(
        &self,
        entity: EntityKind,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<String, GraphError> {
        let mut url = self.object_url(&format!("{}/{}", self.config.page_id, edge_path(entity)))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(fields) = edge_fields(entity) {
                query.append_pair("fields", fields);
            }
            query.append_pair("limit", &limit.to_string());
            if let Some(since) = since {
                query.append_pair("since", &since.timestamp().to_string());
            }
            query.append_pair("access_token", &self.config.access_token);
        }
        Ok(url.to_string())
    }

    async fn get_json(&self, url: &str) -> Result<JsonValue, GraphError> {
        let body = match self.http.fetch_bytes("graph-api", url).await {
            Ok(resp) => resp.body,
            Err(FetchError::HttpStatus {
                status,
                url: failed_url,
                body,
            }) => {
                let payload = serde_json::from_str::<JsonValue>(&body)
                    .ok()
                    .and_then(|value| GraphApiError::from_payload(&value));
                return Err(match payload {
                    Some(api) => GraphError::Api(api),
                    None => GraphError::Fetch(FetchError::HttpStatus {
                        status,
                        url: failed_url,
                        body,
                    }),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let value: JsonValue =
            serde_json::from_slice(&body).map_err(|source| GraphError::InvalidJson {
                url: redact_token(url),
                source,
            })?;
        if let Some(api) = GraphApiError::from_payload(&value) {
            return Err(api.into());
        }
        Ok(value)
    }

    /// Walks every page of one edge of the configured page.
    ///
    /// Fails only if nothing could be fetched; later failures produce a partial result.
    pub async fn fetch_edge(
        &self,
        entity: EntityKind,
        since: Option<DateTime<Utc>>,
    ) -> Result<EdgeFetch, GraphError> {
        let mut page_size = self.config.page_size.max(1);
        let mut url = self.edge_url(entity, since, page_size)?;
        let mut fetch = EdgeFetch {
            entity,
            items: Vec::new(),
            pages: 0,
            interrupted: None,
        };

        loop {
            if fetch.pages >= self.config.max_pages {
                warn!(%entity, pages = fetch.pages, "page limit reached; stopping pagination");
                break;
            }

            match self.get_json(&url).await {
                Ok(body) => {
                    let batch = body
                        .get("data")
                        .and_then(JsonValue::as_array)
                        .cloned()
                        .unwrap_or_default();
                    fetch.pages += 1;
                    info!(%entity, page = fetch.pages, items = batch.len(), "fetched page");
                    if batch.is_empty() {
                        break;
                    }
                    fetch.items.extend(batch);
                    match next_page_url(&body) {
                        Some(next) => url = next,
                        None => break,
                    }
                }
                Err(err) => {
                    if let GraphError::Api(api) = &err {
                        if api.kind == GraphErrorKind::DataTooLarge {
                            if let Some(smaller) = smaller_page_size(page_size) {
                                warn!(%entity, from = page_size, to = smaller, "response too large; reducing page size");
                                page_size = smaller;
                                url = with_limit(&url, page_size)?;
                                continue;
                            }
                        }
                    }
                    if fetch.pages == 0 {
                        return Err(err);
                    }
                    warn!(%entity, pages = fetch.pages, error = %err, "fetch interrupted; keeping pages fetched so far");
                    fetch.interrupted = Some(err.to_string());
                    break;
                }
            }
        }

        Ok(fetch)
    }

    /// Audience metrics of the configured page.
    pub async fn fetch_page_info(&self) -> Result<PageInfo, GraphError> {
        let mut url = self.object_url(&self.config.page_id)?;
        url.query_pairs_mut()
            .append_pair("fields", PAGE_INFO_FIELDS)
            .append_pair("access_token", &self.config.access_token);
        let body = self.get_json(url.as_str()).await?;
        let page = page_info_from(&body, Utc::now());
        info!(name = ?page.name, audience = ?page.audience(), "fetched page info");
        Ok(page)
    }

    /// Per-type reaction counts for one object.
    pub async fn fetch_reaction_breakdown(&self, object_id: &str) -> Result<ReactionBreakdown, GraphError> {
        let mut url = self.object_url(object_id)?;
        url.query_pairs_mut()
            .append_pair("fields", REACTION_BREAKDOWN_FIELDS)
            .append_pair("access_token", &self.config.access_token);
        let body = self.get_json(url.as_str()).await?;
        Ok(breakdown_from(&body).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_payloads_classify_by_message_and_code() {
        let too_large = json!({"error": {"message": "Please reduce the amount of data you're asking for, then retry your request", "code": 1}});
        assert_eq!(
            GraphApiError::from_payload(&too_large).unwrap().kind,
            GraphErrorKind::DataTooLarge
        );
        let throttled = json!({"error": {"message": "Application request limit reached", "code": 4}});
        assert_eq!(
            GraphApiError::from_payload(&throttled).unwrap().kind,
            GraphErrorKind::RateLimited
        );
        let expired = json!({"error": {"message": "Error validating access token", "code": 190}});
        assert_eq!(
            GraphApiError::from_payload(&expired).unwrap().kind,
            GraphErrorKind::AuthExpired
        );
        assert!(GraphApiError::from_payload(&json!({"data": []})).is_none());
    }

    #[test]
    fn page_sizes_step_down_then_stop() {
        assert_eq!(smaller_page_size(100), Some(50));
        assert_eq!(smaller_page_size(50), Some(25));
        assert_eq!(smaller_page_size(25), Some(10));
        assert_eq!(smaller_page_size(10), None);
        assert_eq!(smaller_page_size(70), Some(50));
    }

    #[test]
    fn limit_rewrite_keeps_cursor_and_token() {
        let rewritten = with_limit(
            "https://graph.example/v21.0/1/posts?limit=100&after=QVFI&access_token=tok",
            50,
        )
        .unwrap();
        let parsed = Url::parse(&rewritten).unwrap();
        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("after".into(), "QVFI".into())));
        assert!(pairs.contains(&("access_token".into(), "tok".into())));
        assert!(pairs.contains(&("limit".into(), "50".into())));
        assert_eq!(pairs.iter().filter(|(k, _)| k == "limit").count(), 1);
    }

    #[test]
    fn edge_urls_carry_fields_limit_and_since() {
        let client = GraphClient::new(GraphClientConfig {
            base_url: "https://graph.example/v21.0/".into(),
            ..GraphClientConfig::new("42", "tok")
        })
        .unwrap();
        let since = DateTime::from_timestamp(1_749_981_600, 0).unwrap();
        let url = Url::parse(&client.edge_url(EntityKind::Reels, Some(since), 25).unwrap()).unwrap();
        assert_eq!(url.path(), "/v21.0/42/video_reels");
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(query.contains(&("limit".into(), "25".into())));
        assert!(query.contains(&("since".into(), "1749981600".into())));
    }

    #[test]
    fn missing_credentials_are_rejected_up_front() {
        let err = GraphClient::new(GraphClientConfig::new("", "tok")).unwrap_err();
        assert!(matches!(err, GraphError::MissingCredential("page id")));
    }
}
