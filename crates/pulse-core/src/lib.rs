//! Core domain model for page engagement records.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pulse-core";

/// Longest `message` kept on a record; the text is display-only.
pub const MESSAGE_MAX_CHARS: usize = 200;

/// Canonical content category of a record.
///
/// Declaration order is the display order used by post-type aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostType {
    Photo,
    Video,
    Reel,
    Text,
    Shared,
    Story,
    Unknown,
}

impl PostType {
    pub const ALL: [PostType; 7] = [
        PostType::Photo,
        PostType::Video,
        PostType::Reel,
        PostType::Text,
        PostType::Shared,
        PostType::Story,
        PostType::Unknown,
    ];

    /// Maps a free-text source label (Graph `status_type`, spreadsheet `Post type`,
    /// or a canonical name) onto a post type. Unrecognized labels map to `Unknown`.
    pub fn from_label(label: &str) -> Self {
        let normalized = label
            .trim()
            .to_ascii_lowercase()
            .replace([' ', '-'], "_");
        match normalized.as_str() {
            "photo" | "photos" | "added_photos" | "image" | "album" => PostType::Photo,
            "video" | "videos" | "added_video" | "live" | "live_video" => PostType::Video,
            "reel" | "reels" | "video_reel" => PostType::Reel,
            "text" | "status" | "mobile_status_update" | "wall_post" => PostType::Text,
            "shared" | "shared_story" | "link" | "links" | "share" => PostType::Shared,
            "story" | "stories" => PostType::Story,
            _ => PostType::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PostType::Photo => "photo",
            PostType::Video => "video",
            PostType::Reel => "reel",
            PostType::Text => "text",
            PostType::Shared => "shared",
            PostType::Story => "story",
            PostType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-reaction-type counts, available only for sources that fetched them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReactionBreakdown {
    pub like: u64,
    pub love: u64,
    pub haha: u64,
    pub wow: u64,
    pub sad: u64,
    pub angry: u64,
}

impl ReactionBreakdown {
    pub fn total(&self) -> u64 {
        self.like + self.love + self.haha + self.wow + self.sad + self.angry
    }
}

/// Page-level audience metrics at one point in time.
///
/// Every metric is optional: the API omits fields the token cannot read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followers_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub talking_about_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_star_rating: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating_count: Option<u64>,
    #[serde(with = "lenient_timestamp")]
    pub fetched_at: DateTime<Utc>,
}

impl PageInfo {
    /// Followers as the page reports them, falling back to page likes.
    pub fn audience(&self) -> Option<u64> {
        self.followers_count.or(self.fan_count)
    }
}

/// Canonical post/video/reel/story with engagement counters.
///
/// Engagement is derived from the three counters on demand and is never
/// stored, so serializing a record does not emit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub post_type: PostType,
    pub reactions: u64,
    pub comments: u64,
    pub shares: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub views: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reach: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permalink: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions_breakdown: Option<ReactionBreakdown>,
}

impl Record {
    pub fn engagement(&self) -> u64 {
        self.reactions + self.comments + self.shares
    }
}

/// Which kind of upstream produced a batch of records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Api,
    Spreadsheet,
    Cache,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Api => "api",
            SourceKind::Spreadsheet => "spreadsheet",
            SourceKind::Cache => "cache",
        })
    }
}

/// Entity families exposed by the Graph API, one cache file each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Posts,
    Videos,
    Reels,
    Stories,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Posts => "posts",
            EntityKind::Videos => "videos",
            EntityKind::Reels => "reels",
            EntityKind::Stories => "stories",
        }
    }

    pub fn cache_file_name(self) -> String {
        format!("{}.json", self.as_str())
    }

    /// Type assigned when the source payload carries no usable category.
    pub fn default_post_type(self) -> PostType {
        match self {
            EntityKind::Posts => PostType::Unknown,
            EntityKind::Videos => PostType::Video,
            EntityKind::Reels => PostType::Reel,
            EntityKind::Stories => PostType::Story,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw record could not be mapped onto the canonical shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("{origin} record is missing required field `{field}`")]
    MissingField { origin: SourceKind, field: String },
    #[error("{origin} row {row} has no value for required field `{field}`")]
    MissingCell {
        origin: SourceKind,
        field: String,
        row: usize,
    },
    #[error("{origin} field `{field}` has unparsable timestamp {value:?}")]
    InvalidTimestamp {
        origin: SourceKind,
        field: String,
        value: String,
    },
    #[error("{origin} record is not a JSON object")]
    NotAnObject { origin: SourceKind },
}

/// Normalizes an identifier into its cross-source comparable form.
///
/// Graph post ids are compound (`<page>_<post>`) while spreadsheet exports
/// carry only the post part, so compound ids reduce to their suffix.
/// Spreadsheet numeric coercion can also leave a trailing `.0`.
///
/// Applying it to its own output returns the same id.
pub fn canonical_id(raw: &str) -> String {
    fn strip(s: &str) -> &str {
        s.trim_matches(|c: char| c.is_whitespace() || c == '"' || c == '\'')
    }
    let cleaned = strip(raw);
    let post = match cleaned.rsplit_once('_') {
        Some((_, suffix)) if !strip(suffix).is_empty() => strip(suffix),
        _ => cleaned,
    };
    let post = match post.strip_suffix(".0") {
        Some(digits) if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => digits,
        _ => post,
    };
    post.to_string()
}

/// Parses the timestamp shapes seen across sources into UTC.
///
/// Accepts RFC 3339, Graph's `+0000` offsets, naive ISO date-times (taken as
/// UTC), bare dates (midnight UTC) and Unix seconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
    }
    if raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
    }
    None
}

/// Coerces a source counter to a non-negative integer; NaN and negatives become 0.
pub fn counter_from_f64(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.round() as u64
    } else {
        0
    }
}

pub fn counter_from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Truncates display text to [`MESSAGE_MAX_CHARS`] characters; blank text becomes `None`.
pub fn display_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let truncated: String = trimmed.chars().take(MESSAGE_MAX_CHARS).collect();
    Some(truncated.trim_end().to_string())
}

/// Serde adapter for timestamps written by older tooling without an offset.
pub mod lenient_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| D::Error::custom(format!("unparsable timestamp {raw:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(id: &str) -> Record {
        Record {
            id: id.to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 6, 15, 10, 0, 0).unwrap(),
            post_type: PostType::Photo,
            reactions: 5,
            comments: 1,
            shares: 2,
            views: None,
            reach: Some(40),
            permalink: None,
            message: Some("hello".into()),
            reactions_breakdown: None,
        }
    }

    #[test]
    fn page_info_reads_cache_files_from_older_tooling() {
        let info: PageInfo = serde_json::from_str(
            r#"{"name": "Juan365", "fan_count": 12000, "talking_about_count": 310,
                "overall_star_rating": 4.6, "rating_count": 88, "id": "746586875138185",
                "fetched_at": "2025-06-30T09:15:00.123456"}"#,
        )
        .unwrap();
        assert_eq!(info.name.as_deref(), Some("Juan365"));
        assert_eq!(info.followers_count, None);
        assert_eq!(info.audience(), Some(12000));
        assert_eq!(
            info.fetched_at,
            Utc.with_ymd_and_hms(2025, 6, 30, 9, 15, 0).unwrap() + chrono::Duration::microseconds(123_456)
        );

        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("followers_count").is_none());
        assert_eq!(json["rating_count"], 88);
    }

    #[test]
    fn engagement_is_sum_of_counters() {
        assert_eq!(sample("A").engagement(), 8);
    }

    #[test]
    fn serialized_record_has_no_engagement_field() {
        let value = serde_json::to_value(sample("A")).unwrap();
        assert!(value.get("engagement").is_none());
        assert_eq!(value["type"], "photo");
        assert!(value.get("views").is_none());
    }

    #[test]
    fn post_type_labels_map_case_insensitively() {
        assert_eq!(PostType::from_label("added_photos"), PostType::Photo);
        assert_eq!(PostType::from_label("Photos"), PostType::Photo);
        assert_eq!(PostType::from_label("Reels"), PostType::Reel);
        assert_eq!(PostType::from_label("mobile_status_update"), PostType::Text);
        assert_eq!(PostType::from_label("Shared story"), PostType::Shared);
        assert_eq!(PostType::from_label("Links"), PostType::Shared);
        assert_eq!(PostType::from_label("created_event"), PostType::Unknown);
        assert_eq!(PostType::from_label(""), PostType::Unknown);
    }

    #[test]
    fn canonical_id_reduces_compound_and_coerced_ids() {
        assert_eq!(canonical_id("746586875138185_122148"), "122148");
        assert_eq!(canonical_id(" 122148 "), "122148");
        assert_eq!(canonical_id("122148.0"), "122148");
        assert_eq!(canonical_id("\"122148\""), "122148");
        assert_eq!(canonical_id("abc.0x"), "abc.0x");
        assert_eq!(canonical_id("trailing_"), "trailing_");
        assert_eq!(canonical_id("746586875138185_122148.0"), "122148");
    }

    #[test]
    fn canonical_id_is_stable_when_reapplied() {
        for raw in [
            "1_2.0",
            "746586875138185_122148",
            "'122148.0'",
            "a_\"5\"",
            " \"77_88\" ",
            "trailing_",
            "1_.0",
        ] {
            let once = canonical_id(raw);
            assert_eq!(canonical_id(&once), once, "{raw:?}");
        }
    }

    #[test]
    fn timestamps_parse_from_every_source_shape() {
        let expected = Utc.with_ymd_and_hms(2025, 6, 15, 10, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2025-06-15T10:00:00+0000"), Some(expected));
        assert_eq!(
            parse_timestamp("2025-06-15T10:00:00.250+0000"),
            Some(expected + chrono::Duration::milliseconds(250))
        );
        assert_eq!(parse_timestamp("2025-06-15T10:00:00+00:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-06-15T18:00:00+08:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-06-15T10:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-06-15T10:00:00.000000"), Some(expected));
        assert_eq!(parse_timestamp("1749981600"), Some(expected));
        assert_eq!(
            parse_timestamp("2025-06-15"),
            Some(Utc.with_ymd_and_hms(2025, 6, 15, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp("06/15/2025 10:00"), None);
        assert_eq!(parse_timestamp("  "), None);
    }

    #[test]
    fn counters_never_go_negative() {
        assert_eq!(counter_from_f64(f64::NAN), 0);
        assert_eq!(counter_from_f64(-3.0), 0);
        assert_eq!(counter_from_f64(7.0), 7);
        assert_eq!(counter_from_i64(-1), 0);
        assert_eq!(counter_from_i64(12), 12);
    }

    #[test]
    fn display_text_truncates_on_char_boundaries() {
        let long = "é".repeat(250);
        assert_eq!(display_text(&long).unwrap().chars().count(), MESSAGE_MAX_CHARS);
        assert_eq!(display_text("   "), None);

        let cut_at_space = format!("{} tail", "a".repeat(MESSAGE_MAX_CHARS - 1));
        let once = display_text(&cut_at_space).unwrap();
        assert_eq!(once, "a".repeat(MESSAGE_MAX_CHARS - 1));
        assert_eq!(display_text(&once), Some(once));
    }
}
