//! Merges a directory of spreadsheet exports into one deduplicated export.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDateTime;
use pulse_core::canonical_id;
use pulse_storage::write_atomic;
use tracing::{info, warn};

use crate::spreadsheet::{EXPORT_TIME_FORMAT, POST_ID_HEADER, PUBLISH_TIME_HEADER};

/// Files whose names contain this marker are merge outputs and never inputs.
pub const MERGED_MARKER: &str = "MERGED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inputs: Vec<PathBuf>,
    /// Inputs that could not be read or parsed; their rows are not merged.
    pub skipped: Vec<PathBuf>,
    pub rows_read: usize,
    pub rows_written: usize,
    pub rows_without_id: usize,
    pub columns: Vec<String>,
    pub output: PathBuf,
}

struct Row {
    id: String,
    cells: HashMap<String, String>,
}

/// Export files in `dir`, oldest first (modification time, then name).
pub fn export_inputs(dir: &Path, output: &Path) -> Result<Vec<PathBuf>> {
    let mut inputs: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        let is_csv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        let is_merged = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.to_ascii_uppercase().contains(MERGED_MARKER));
        if !is_csv || is_merged || path == output {
            continue;
        }
        let modified = fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .with_context(|| format!("reading metadata of {}", path.display()))?;
        inputs.push((modified, path));
    }
    inputs.sort();
    Ok(inputs.into_iter().map(|(_, path)| path).collect())
}

/// One export's header row and data rows.
struct ParsedExport {
    headers: Vec<String>,
    rows: Vec<Row>,
}

fn parse_export(text: &str) -> Result<ParsedExport> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .context("reading header row")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("parsing row {}", index + 2))?;
        let cells: HashMap<String, String> = headers
            .iter()
            .cloned()
            .zip(row.iter().map(ToString::to_string))
            .collect();
        let id = cells
            .get(POST_ID_HEADER)
            .map(|raw| canonical_id(raw))
            .unwrap_or_default();
        rows.push(Row { id, cells });
    }
    Ok(ParsedExport { headers, rows })
}

async fn read_export(path: &Path) -> Result<ParsedExport> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let text = String::from_utf8(bytes).with_context(|| format!("decoding {}", path.display()))?;
    parse_export(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Unions every export in `dir` into `output`.
///
/// Later files win on duplicate `Post ID`s; rows are ordered newest publish
/// time first with unparsable times last. Columns appear in first-seen order.
/// An unreadable export is skipped and reported; the merge fails only when no
/// export could be read. The output is replaced atomically.
pub async fn merge_exports(dir: &Path, output: &Path) -> Result<MergeOutcome> {
    let inputs = export_inputs(dir, output)?;
    let mut columns: Vec<String> = Vec::new();
    let mut rows = Vec::new();
    let mut skipped = Vec::new();
    for path in &inputs {
        let export = match read_export(path).await {
            Ok(export) => export,
            Err(err) => {
                warn!(file = %path.display(), error = %format!("{err:#}"), "skipping unreadable export");
                skipped.push(path.clone());
                continue;
            }
        };
        info!(file = %path.display(), rows = export.rows.len(), "read export");
        for header in export.headers {
            if !columns.contains(&header) {
                columns.push(header);
            }
        }
        rows.extend(export.rows);
    }
    if skipped.len() == inputs.len() {
        bail!("no readable export in {}", dir.display());
    }
    let rows_read = rows.len();

    let rows_without_id = rows.iter().filter(|row| row.id.is_empty()).count();
    if rows_without_id > 0 {
        warn!(rows = rows_without_id, "dropping export rows without a post id");
    }

    let mut last_index: HashMap<&str, usize> = HashMap::new();
    for (index, row) in rows.iter().enumerate() {
        if !row.id.is_empty() {
            last_index.insert(row.id.as_str(), index);
        }
    }
    let mut kept: Vec<&Row> = rows
        .iter()
        .enumerate()
        .filter(|(index, row)| last_index.get(row.id.as_str()) == Some(index))
        .map(|(_, row)| row)
        .collect();

    let publish_key = |row: &Row| -> Option<NaiveDateTime> {
        row.cells
            .get(PUBLISH_TIME_HEADER)
            .and_then(|raw| NaiveDateTime::parse_from_str(raw.trim(), EXPORT_TIME_FORMAT).ok())
    };
    kept.sort_by(|a, b| publish_key(*b).cmp(&publish_key(*a)));

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&columns)?;
    for row in &kept {
        writer.write_record(
            columns
                .iter()
                .map(|column| row.cells.get(column).map(String::as_str).unwrap_or("")),
        )?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| anyhow!("serializing merged export: {}", err.error()))?;
    write_atomic(output, &bytes).await?;

    Ok(MergeOutcome {
        inputs,
        skipped,
        rows_read,
        rows_written: kept.len(),
        rows_without_id,
        columns,
        output: output.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn write_export(dir: &Path, name: &str, body: &str, age_secs: u64) {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
    }

    #[tokio::test]
    async fn later_exports_win_and_rows_sort_newest_first() {
        let dir = tempdir().unwrap();
        write_export(
            dir.path(),
            "b_old.csv",
            "Post ID,Publish time,Reactions\n1,06/15/2025 02:00,5\n2,06/20/2025 09:00,2\n",
            3_600,
        );
        write_export(
            dir.path(),
            "a_new.csv",
            "Post ID,Publish time,Reactions,Reach\n1,06/15/2025 02:00,7,300\n3,07/01/2025 12:00,1,10\n",
            60,
        );
        write_export(
            dir.path(),
            "Page_MERGED_ALL.csv",
            "Post ID,Publish time,Reactions\n1,06/15/2025 02:00,999\n",
            0,
        );

        let output = dir.path().join("merged").join("Page_MERGED_ALL.csv");
        let outcome = merge_exports(dir.path(), &output).await.unwrap();
        assert_eq!(outcome.inputs.len(), 2);
        assert!(outcome.skipped.is_empty());
        assert!(outcome.inputs[0].ends_with("b_old.csv"));
        assert_eq!(outcome.rows_read, 4);
        assert_eq!(outcome.rows_written, 3);
        assert_eq!(outcome.columns, ["Post ID", "Publish time", "Reactions", "Reach"]);

        let written = fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines[0], "Post ID,Publish time,Reactions,Reach");
        assert_eq!(lines[1], "3,07/01/2025 12:00,1,10");
        assert_eq!(lines[2], "2,06/20/2025 09:00,2,");
        assert_eq!(lines[3], "1,06/15/2025 02:00,7,300");
    }

    #[tokio::test]
    async fn unparsable_publish_times_sort_last() {
        let dir = tempdir().unwrap();
        write_export(
            dir.path(),
            "export.csv",
            "Post ID,Publish time\n1,not a date\n2,06/20/2025 09:00\n",
            10,
        );
        let output = dir.path().join("out.csv");
        merge_exports(dir.path(), &output).await.unwrap();
        let written = fs::read_to_string(&output).unwrap();
        let ids: Vec<&str> = written
            .lines()
            .skip(1)
            .map(|line| line.split(',').next().unwrap())
            .collect();
        assert_eq!(ids, ["2", "1"]);
    }

    #[tokio::test]
    async fn unreadable_exports_are_skipped() {
        let dir = tempdir().unwrap();
        write_export(
            dir.path(),
            "good.csv",
            "Post ID,Publish time,Reactions\n1,06/15/2025 02:00,5\n",
            120,
        );
        let bad = dir.path().join("bad.csv");
        fs::write(&bad, b"Post ID,Publish time\n2,\xff\xfe\n").unwrap();

        let output = dir.path().join("out.csv");
        let outcome = merge_exports(dir.path(), &output).await.unwrap();
        assert_eq!(outcome.skipped, [bad]);
        assert_eq!(outcome.rows_written, 1);
        let written = fs::read_to_string(&output).unwrap();
        assert_eq!(written, "Post ID,Publish time,Reactions\n1,06/15/2025 02:00,5\n");
    }

    #[tokio::test]
    async fn merge_fails_when_no_export_is_readable() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("bad.csv"), b"\xff\xfe").unwrap();
        let output = dir.path().join("out.csv");
        let err = merge_exports(dir.path(), &output).await.unwrap_err();
        assert!(err.to_string().contains("no readable export"));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn output_replaces_the_previous_merge_without_leftovers() {
        let dir = tempdir().unwrap();
        write_export(dir.path(), "a.csv", "Post ID,Publish time\n1,06/15/2025 02:00\n", 60);
        let out_dir = dir.path().join("merged");
        let output = out_dir.join("page_MERGED_ALL.csv");
        fs::create_dir_all(&out_dir).unwrap();
        fs::write(&output, "stale contents that are longer than the merge result\n").unwrap();

        merge_exports(dir.path(), &output).await.unwrap();
        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            "Post ID,Publish time\n1,06/15/2025 02:00\n"
        );
        let leftovers: Vec<_> = fs::read_dir(&out_dir).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }
}
