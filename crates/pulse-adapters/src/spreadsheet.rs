//! Spreadsheet export normalizer.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use csv::StringRecord;
use pulse_core::{
    canonical_id, counter_from_f64, display_text, PostType, Record, SchemaError, SourceKind,
};

use crate::AdapterError;

/// Publish times are exported in this exact shape; nothing is auto-detected.
pub const EXPORT_TIME_FORMAT: &str = "%m/%d/%Y %H:%M";

pub const POST_ID_HEADER: &str = "Post ID";
pub const PUBLISH_TIME_HEADER: &str = "Publish time";

/// Column positions resolved from the header row.
#[derive(Debug, Clone)]
struct Columns {
    id: usize,
    published: usize,
    reactions: Option<usize>,
    comments: Option<usize>,
    shares: Option<usize>,
    views: Option<usize>,
    reach: Option<usize>,
    post_type: Option<usize>,
    permalink: Option<usize>,
    title: Option<usize>,
    description: Option<usize>,
}

fn find_column(headers: &StringRecord, name: &str) -> Option<usize> {
    headers
        .iter()
        .position(|header| header.trim().eq_ignore_ascii_case(name))
}

impl Columns {
    fn resolve(headers: &StringRecord) -> Result<Self, SchemaError> {
        let required = |name: &str| {
            find_column(headers, name).ok_or_else(|| SchemaError::MissingField {
                origin: SourceKind::Spreadsheet,
                field: name.to_string(),
            })
        };
        Ok(Self {
            id: required(POST_ID_HEADER)?,
            published: required(PUBLISH_TIME_HEADER)?,
            reactions: find_column(headers, "Reactions"),
            comments: find_column(headers, "Comments"),
            shares: find_column(headers, "Shares"),
            views: find_column(headers, "Views"),
            reach: find_column(headers, "Reach"),
            post_type: find_column(headers, "Post type"),
            permalink: find_column(headers, "Permalink"),
            title: find_column(headers, "Title"),
            description: find_column(headers, "Description"),
        })
    }
}

fn cell(row: &StringRecord, index: Option<usize>) -> Option<&str> {
    index
        .and_then(|i| row.get(i))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Blank, non-numeric, NaN and negative cells all count as zero.
fn counter_cell(row: &StringRecord, index: Option<usize>) -> u64 {
    optional_counter_cell(row, index).unwrap_or(0)
}

fn optional_counter_cell(row: &StringRecord, index: Option<usize>) -> Option<u64> {
    cell(row, index).map(|raw| {
        raw.replace(',', "")
            .parse::<f64>()
            .map(counter_from_f64)
            .unwrap_or(0)
    })
}

/// Parses an export publish time in the exporter's local offset.
pub fn parse_publish_time(raw: &str, export_offset: FixedOffset) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), EXPORT_TIME_FORMAT).ok()?;
    export_offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parses a spreadsheet export into canonical records.
///
/// `row` numbers in errors count the header as row 1.
pub fn parse_spreadsheet(text: &str, export_offset: FixedOffset) -> Result<Vec<Record>, AdapterError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader.headers()?.clone();
    let columns = Columns::resolve(&headers)?;

    let mut records = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row?;
        if row.iter().all(|value| value.trim().is_empty()) {
            continue;
        }
        let row_number = index + 2;

        let id = cell(&row, Some(columns.id))
            .map(canonical_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SchemaError::MissingCell {
                origin: SourceKind::Spreadsheet,
                field: POST_ID_HEADER.to_string(),
                row: row_number,
            })?;

        let published = cell(&row, Some(columns.published)).ok_or_else(|| SchemaError::MissingCell {
            origin: SourceKind::Spreadsheet,
            field: PUBLISH_TIME_HEADER.to_string(),
            row: row_number,
        })?;
        let created_at = parse_publish_time(published, export_offset).ok_or_else(|| {
            SchemaError::InvalidTimestamp {
                origin: SourceKind::Spreadsheet,
                field: PUBLISH_TIME_HEADER.to_string(),
                value: published.to_string(),
            }
        })?;

        records.push(Record {
            id,
            created_at,
            post_type: cell(&row, columns.post_type)
                .map(PostType::from_label)
                .unwrap_or(PostType::Unknown),
            reactions: counter_cell(&row, columns.reactions),
            comments: counter_cell(&row, columns.comments),
            shares: counter_cell(&row, columns.shares),
            views: optional_counter_cell(&row, columns.views),
            reach: optional_counter_cell(&row, columns.reach),
            permalink: cell(&row, columns.permalink).map(ToString::to_string),
            message: cell(&row, columns.title)
                .or_else(|| cell(&row, columns.description))
                .and_then(display_text),
            reactions_breakdown: None,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacific() -> FixedOffset {
        FixedOffset::west_opt(8 * 3600).unwrap()
    }

    const EXPORT: &str = "\u{feff}Post ID,Title,Publish time,Post type,Permalink,Reactions,Comments,Shares,Reach\n\
122148,Weekend market,06/15/2025 02:00,Photos,https://example.com/p/122148,41,7,3,900\n\
122149.0,,06/20/2025 18:30,Reels,,12,,NaN,\n";

    #[test]
    fn export_rows_normalize_with_explicit_time_format() {
        let records = parse_spreadsheet(EXPORT, pacific()).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.id, "122148");
        assert_eq!(first.post_type, PostType::Photo);
        assert_eq!(first.engagement(), 51);
        assert_eq!(first.reach, Some(900));
        assert_eq!(first.message.as_deref(), Some("Weekend market"));
        assert_eq!(first.created_at.to_rfc3339(), "2025-06-15T10:00:00+00:00");

        let second = &records[1];
        assert_eq!(second.id, "122149");
        assert_eq!(second.post_type, PostType::Reel);
        assert_eq!((second.reactions, second.comments, second.shares), (12, 0, 0));
        assert_eq!(second.reach, None);
        assert_eq!(second.message, None);
    }

    #[test]
    fn missing_publish_time_column_fails_the_source() {
        let err = parse_spreadsheet("Post ID,Reactions\n1,5\n", pacific()).unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Schema(SchemaError::MissingField { ref field, .. }) if field == PUBLISH_TIME_HEADER
        ));
    }

    #[test]
    fn blank_publish_time_names_the_row() {
        let err = parse_spreadsheet("Post ID,Publish time\n1,06/15/2025 02:00\n2,\n", pacific())
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Schema(SchemaError::MissingCell { row: 3, .. })
        ));
    }

    #[test]
    fn iso_dates_are_not_guessed() {
        let err = parse_spreadsheet("Post ID,Publish time\n1,2025-06-15 02:00\n", pacific())
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Schema(SchemaError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn missing_counter_columns_default_to_zero() {
        let records = parse_spreadsheet("Post ID,Publish time\n1,06/15/2025 02:00\n", pacific()).unwrap();
        assert_eq!(records[0].engagement(), 0);
        assert_eq!(records[0].post_type, PostType::Unknown);
    }
}
