//! Priority-ordered, record-granularity reconciliation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use pulse_core::{Record, SourceKind};
use serde::Serialize;

/// Normalized records from one source, tagged for the override trace.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBatch {
    pub source_id: String,
    pub kind: SourceKind,
    pub fetched_at: DateTime<Utc>,
    pub records: Vec<Record>,
}

impl SourceBatch {
    pub fn new(
        source_id: impl Into<String>,
        kind: SourceKind,
        fetched_at: DateTime<Utc>,
        records: Vec<Record>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            fetched_at,
            records,
        }
    }
}

/// A record that a later source replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Override {
    pub id: String,
    pub replaced_source: String,
    pub winning_source: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    pub records: Vec<Record>,
    pub overrides: Vec<Override>,
}

impl Reconciliation {
    pub fn total_engagement(&self) -> u64 {
        self.records.iter().map(Record::engagement).sum()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler;

impl Reconciler {
    /// Merges batches given in ascending priority.
    ///
    /// Each id keeps the position of its first appearance; a later occurrence
    /// replaces the stored record entirely, never field by field.
    pub fn reconcile(&self, batches: &[SourceBatch]) -> Reconciliation {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut slots: Vec<(Record, &str)> = Vec::new();
        let mut overrides = Vec::new();

        for batch in batches {
            for record in &batch.records {
                match index.get(&record.id) {
                    Some(&slot) => {
                        let (stored, origin) = &mut slots[slot];
                        if *origin != batch.source_id {
                            overrides.push(Override {
                                id: record.id.clone(),
                                replaced_source: origin.to_string(),
                                winning_source: batch.source_id.clone(),
                            });
                        }
                        *stored = record.clone();
                        *origin = batch.source_id.as_str();
                    }
                    None => {
                        index.insert(record.id.clone(), slots.len());
                        slots.push((record.clone(), batch.source_id.as_str()));
                    }
                }
            }
        }

        Reconciliation {
            records: slots.into_iter().map(|(record, _)| record).collect(),
            overrides,
        }
    }

    /// `fresher` over `existing`, for refreshing a cache document.
    pub fn overlay(&self, existing: Vec<Record>, fresher: Vec<Record>) -> Vec<Record> {
        let now = Utc::now();
        self.reconcile(&[
            SourceBatch::new("existing", SourceKind::Cache, now, existing),
            SourceBatch::new("fresher", SourceKind::Api, now, fresher),
        ])
        .records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pulse_core::PostType;

    fn record(id: &str, reactions: u64, comments: u64, shares: u64) -> Record {
        Record {
            id: id.to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 6, 15, 10, 0, 0).unwrap(),
            post_type: PostType::Photo,
            reactions,
            comments,
            shares,
            views: None,
            reach: None,
            permalink: None,
            message: None,
            reactions_breakdown: None,
        }
    }

    fn batch(source_id: &str, records: Vec<Record>) -> SourceBatch {
        SourceBatch::new(
            source_id,
            SourceKind::Spreadsheet,
            Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap(),
            records,
        )
    }

    #[test]
    fn later_duplicate_wins_and_total_is_eleven() {
        let outcome = Reconciler.reconcile(&[
            batch("export", vec![record("A", 5, 1, 0)]),
            batch("api", vec![record("A", 7, 1, 1), record("B", 2, 0, 0)]),
        ]);

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].id, "A");
        assert_eq!(outcome.records[0].engagement(), 9);
        assert_eq!(outcome.records[1].id, "B");
        assert_eq!(outcome.records[1].engagement(), 2);
        assert_eq!(outcome.total_engagement(), 11);
        assert_eq!(
            outcome.overrides,
            vec![Override {
                id: "A".into(),
                replaced_source: "export".into(),
                winning_source: "api".into(),
            }]
        );
    }

    #[test]
    fn higher_priority_record_replaces_every_field() {
        let mut low = record("A", 100, 50, 25);
        low.reach = Some(9_000);
        low.message = Some("old caption".into());
        let high = record("A", 1, 0, 0);

        let outcome = Reconciler.reconcile(&[batch("low", vec![low]), batch("high", vec![high.clone()])]);
        assert_eq!(outcome.records, vec![high]);
    }

    #[test]
    fn reconciliation_is_idempotent() {
        let first = Reconciler.reconcile(&[
            batch("a", vec![record("A", 5, 1, 0), record("C", 1, 1, 1)]),
            batch("b", vec![record("B", 2, 0, 0), record("A", 7, 1, 1)]),
        ]);
        let again = Reconciler.reconcile(&[
            batch("out", first.records.clone()),
            batch("out-again", first.records.clone()),
        ]);
        assert_eq!(again.records, first.records);
    }

    #[test]
    fn no_batches_reconcile_to_nothing() {
        let outcome = Reconciler.reconcile(&[]);
        assert!(outcome.records.is_empty());
        assert!(outcome.overrides.is_empty());
    }

    #[test]
    fn overlay_keeps_existing_order_and_appends_new_ids() {
        let merged = Reconciler.overlay(
            vec![record("1", 1, 0, 0), record("2", 1, 0, 0)],
            vec![record("3", 3, 0, 0), record("1", 9, 0, 0)],
        );
        let ids: Vec<&str> = merged.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3"]);
        assert_eq!(merged[0].reactions, 9);
    }
}
