//! JSON record normalizers for Graph API payloads and cached documents.

use chrono::{DateTime, Utc};
use pulse_core::{
    canonical_id, counter_from_f64, counter_from_i64, display_text, parse_timestamp, EntityKind,
    PageInfo, PostType, ReactionBreakdown, Record, SchemaError, SourceKind,
};
use serde_json::Value as JsonValue;

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn first_present<'a>(
    value: &'a JsonValue,
    keys: &[&'static str],
) -> Option<(&'static str, &'a JsonValue)> {
    keys.iter()
        .find_map(|&key| value.get(key).filter(|v| !v.is_null()).map(|v| (key, v)))
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Reads a counter that may be a bare number, a numeric string, a Graph
/// `{summary: {total_count}}` edge, or a `{count}` object. Anything else is 0.
pub(crate) fn counter_value(value: &JsonValue) -> u64 {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .map(counter_from_i64)
            .or_else(|| n.as_f64().map(counter_from_f64))
            .unwrap_or(0),
        JsonValue::String(s) => s
            .trim()
            .replace(',', "")
            .parse::<f64>()
            .map(counter_from_f64)
            .unwrap_or(0),
        JsonValue::Object(_) => json_path(value, &["summary", "total_count"])
            .or_else(|| value.get("count"))
            .or_else(|| value.get("total_count"))
            .map(counter_value)
            .unwrap_or(0),
        _ => 0,
    }
}

fn counter_at(value: &JsonValue, keys: &[&str]) -> u64 {
    keys.iter()
        .find_map(|key| value.get(*key).filter(|v| !v.is_null()))
        .map(counter_value)
        .unwrap_or(0)
}

fn optional_counter_at(value: &JsonValue, keys: &[&str]) -> Option<u64> {
    keys.iter()
        .find_map(|key| value.get(*key).filter(|v| !v.is_null()))
        .map(counter_value)
}

fn text_at(value: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(JsonValue::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn message_at(value: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(JsonValue::as_str).and_then(display_text))
}

fn timestamp_value(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => parse_timestamp(s),
        JsonValue::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

fn required_id(value: &JsonValue, keys: &[&'static str], origin: SourceKind) -> Result<String, SchemaError> {
    let id = first_present(value, keys)
        .and_then(|(_, v)| scalar_text(v))
        .map(|raw| canonical_id(&raw))
        .filter(|id| !id.is_empty());
    id.ok_or_else(|| SchemaError::MissingField {
        origin,
        field: keys.join("|"),
    })
}

fn required_timestamp(
    value: &JsonValue,
    keys: &[&'static str],
    origin: SourceKind,
) -> Result<DateTime<Utc>, SchemaError> {
    let Some((field, raw)) = first_present(value, keys) else {
        return Err(SchemaError::MissingField {
            origin,
            field: keys.join("|"),
        });
    };
    timestamp_value(raw).ok_or_else(|| SchemaError::InvalidTimestamp {
        origin,
        field: field.to_string(),
        value: scalar_text(raw).unwrap_or_else(|| raw.to_string()),
    })
}

/// Picks up per-type reaction counts in any of the shapes sources use:
/// Graph aliases (`like: {summary: {total_count}}`), flat numbers, or `like_count`.
pub(crate) fn breakdown_from(value: &JsonValue) -> Option<ReactionBreakdown> {
    let count = |name: &str| -> Option<u64> {
        value
            .get(name)
            .or_else(|| value.get(format!("{name}_count")))
            .filter(|v| !v.is_null())
            .map(counter_value)
    };
    let parts = [
        count("like"),
        count("love"),
        count("haha"),
        count("wow"),
        count("sad"),
        count("angry"),
    ];
    if parts.iter().all(Option::is_none) {
        return None;
    }
    let [like, love, haha, wow, sad, angry] = parts.map(|p| p.unwrap_or(0));
    Some(ReactionBreakdown {
        like,
        love,
        haha,
        wow,
        sad,
        angry,
    })
}

/// Maps one Graph API item of the given entity kind onto a canonical record.
pub fn normalize_api_record(entity: EntityKind, raw: &JsonValue) -> Result<Record, SchemaError> {
    let origin = SourceKind::Api;
    if !raw.is_object() {
        return Err(SchemaError::NotAnObject { origin });
    }

    let record = match entity {
        EntityKind::Posts => Record {
            id: required_id(raw, &["id"], origin)?,
            created_at: required_timestamp(raw, &["created_time"], origin)?,
            post_type: raw
                .get("status_type")
                .and_then(JsonValue::as_str)
                .map(PostType::from_label)
                .unwrap_or_else(|| entity.default_post_type()),
            reactions: counter_at(raw, &["reactions"]),
            comments: counter_at(raw, &["comments"]),
            shares: counter_at(raw, &["shares"]),
            views: None,
            reach: None,
            permalink: text_at(raw, &["permalink_url"]),
            message: message_at(raw, &["message"]),
            reactions_breakdown: breakdown_from(raw),
        },
        EntityKind::Videos => Record {
            id: required_id(raw, &["id"], origin)?,
            created_at: required_timestamp(raw, &["created_time"], origin)?,
            post_type: entity.default_post_type(),
            reactions: counter_at(raw, &["reactions", "likes"]),
            comments: counter_at(raw, &["comments"]),
            shares: counter_at(raw, &["shares"]),
            views: optional_counter_at(raw, &["views"]),
            reach: None,
            permalink: text_at(raw, &["permalink_url"]),
            message: message_at(raw, &["title", "description"]),
            reactions_breakdown: breakdown_from(raw),
        },
        EntityKind::Reels => Record {
            id: required_id(raw, &["id"], origin)?,
            created_at: required_timestamp(raw, &["created_time"], origin)?,
            post_type: entity.default_post_type(),
            reactions: counter_at(raw, &["likes", "reactions"]),
            comments: counter_at(raw, &["comments"]),
            shares: counter_at(raw, &["shares"]),
            views: optional_counter_at(raw, &["views"]),
            reach: None,
            permalink: text_at(raw, &["permalink_url"]),
            message: message_at(raw, &["description"]),
            reactions_breakdown: None,
        },
        EntityKind::Stories => Record {
            id: required_id(raw, &["post_id", "media_id", "id"], origin)?,
            created_at: required_timestamp(raw, &["creation_time"], origin)?,
            post_type: entity.default_post_type(),
            reactions: 0,
            comments: 0,
            shares: 0,
            views: None,
            reach: None,
            permalink: text_at(raw, &["url"]),
            message: None,
            reactions_breakdown: None,
        },
    };
    Ok(record)
}

/// Maps a record read back from an entity's cache document. Both freshly
/// serialized records and older hand-written cache shapes are accepted; any
/// stored `engagement` total is ignored. Records without a type field take the
/// entity's default type.
pub fn normalize_cached_record(entity: EntityKind, raw: &JsonValue) -> Result<Record, SchemaError> {
    let origin = SourceKind::Cache;
    if !raw.is_object() {
        return Err(SchemaError::NotAnObject { origin });
    }

    let post_type = raw
        .get("type")
        .or_else(|| raw.get("post_type"))
        .or_else(|| raw.get("status_type"))
        .and_then(JsonValue::as_str)
        .map(PostType::from_label)
        .unwrap_or_else(|| entity.default_post_type());

    let reactions_breakdown = match raw.get("reactions_breakdown") {
        Some(nested) if nested.is_object() => breakdown_from(nested),
        _ => breakdown_from(raw),
    };

    Ok(Record {
        id: required_id(raw, &["id", "post_id"], origin)?,
        created_at: required_timestamp(raw, &["created_at", "created_time", "creation_time"], origin)?,
        post_type,
        reactions: counter_at(raw, &["reactions", "likes"]),
        comments: counter_at(raw, &["comments"]),
        shares: counter_at(raw, &["shares"]),
        views: optional_counter_at(raw, &["views"]),
        reach: optional_counter_at(raw, &["reach"]),
        permalink: text_at(raw, &["permalink", "permalink_url", "url"]),
        message: message_at(raw, &["message", "title", "description"]),
        reactions_breakdown,
    })
}

/// Page-level metrics from a Graph page object; absent or null fields stay `None`.
pub fn page_info_from(raw: &JsonValue, fetched_at: DateTime<Utc>) -> PageInfo {
    let overall_star_rating = raw
        .get("overall_star_rating")
        .and_then(|value| match value {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .filter(|rating| rating.is_finite());
    PageInfo {
        id: raw.get("id").and_then(scalar_text),
        name: text_at(raw, &["name"]),
        fan_count: optional_counter_at(raw, &["fan_count"]),
        followers_count: optional_counter_at(raw, &["followers_count"]),
        talking_about_count: optional_counter_at(raw, &["talking_about_count"]),
        overall_star_rating,
        rating_count: optional_counter_at(raw, &["rating_count"]),
        fetched_at,
    }
}
