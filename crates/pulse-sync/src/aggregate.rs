//! Bucketed engagement statistics.
//!
//! Time buckets are computed in a fixed report offset. Weekday and time-slot
//! buckets always cover their whole domain, zero-filled.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Timelike, Utc, Weekday};
use pulse_core::{PostType, Record};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKey {
    Day,
    IsoWeek,
    Month,
    PostType,
    Weekday,
    TimeSlot,
}

impl BucketKey {
    pub const ALL: [BucketKey; 6] = [
        BucketKey::Day,
        BucketKey::IsoWeek,
        BucketKey::Month,
        BucketKey::PostType,
        BucketKey::Weekday,
        BucketKey::TimeSlot,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BucketKey::Day => "day",
            BucketKey::IsoWeek => "iso_week",
            BucketKey::Month => "month",
            BucketKey::PostType => "post_type",
            BucketKey::Weekday => "weekday",
            BucketKey::TimeSlot => "time_slot",
        }
    }
}

pub const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

pub fn weekday_label(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeSlot {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeSlot {
    pub const ALL: [TimeSlot; 4] = [
        TimeSlot::Morning,
        TimeSlot::Afternoon,
        TimeSlot::Evening,
        TimeSlot::Night,
    ];

    /// Morning 06-12, Afternoon 12-18, Evening 18-22, Night otherwise.
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            6..=11 => TimeSlot::Morning,
            12..=17 => TimeSlot::Afternoon,
            18..=21 => TimeSlot::Evening,
            _ => TimeSlot::Night,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TimeSlot::Morning => "Morning (6AM-12PM)",
            TimeSlot::Afternoon => "Afternoon (12PM-6PM)",
            TimeSlot::Evening => "Evening (6PM-10PM)",
            TimeSlot::Night => "Night (10PM-6AM)",
        }
    }

    fn index(self) -> usize {
        match self {
            TimeSlot::Morning => 0,
            TimeSlot::Afternoon => 1,
            TimeSlot::Evening => 2,
            TimeSlot::Night => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSummary {
    pub bucket: String,
    pub count: usize,
    pub reactions: u64,
    pub comments: u64,
    pub shares: u64,
    pub engagement: u64,
    pub mean_engagement: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    count: usize,
    reactions: u64,
    comments: u64,
    shares: u64,
}

impl Accumulator {
    fn add(&mut self, record: &Record) {
        self.count += 1;
        self.reactions += record.reactions;
        self.comments += record.comments;
        self.shares += record.shares;
    }

    fn finish(self, bucket: impl Into<String>) -> BucketSummary {
        let engagement = self.reactions + self.comments + self.shares;
        BucketSummary {
            bucket: bucket.into(),
            count: self.count,
            reactions: self.reactions,
            comments: self.comments,
            shares: self.shares,
            engagement,
            mean_engagement: if self.count == 0 {
                0.0
            } else {
                engagement as f64 / self.count as f64
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub records: usize,
    pub reactions: u64,
    pub comments: u64,
    pub shares: u64,
    pub engagement: u64,
    pub views: u64,
    pub reach: u64,
    pub avg_reactions: f64,
    pub avg_comments: f64,
    pub avg_shares: f64,
    pub avg_engagement: f64,
    pub by_type: BTreeMap<PostType, usize>,
    pub first_day: Option<NaiveDate>,
    pub last_day: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrowthPoint {
    pub bucket: String,
    pub engagement: u64,
    pub change_pct: f64,
}

/// Inclusive date range and type filter, evaluated in the report offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub post_type: Option<PostType>,
}

impl RecordFilter {
    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none() && self.post_type.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    offset: FixedOffset,
}

impl Aggregator {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn local_time(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        at.with_timezone(&self.offset)
    }

    pub fn local_date(&self, record: &Record) -> NaiveDate {
        self.local_time(record.created_at).date_naive()
    }

    fn time_bucket(&self, record: &Record, key: BucketKey) -> String {
        let local = self.local_time(record.created_at);
        match key {
            BucketKey::Day => local.format("%Y-%m-%d").to_string(),
            BucketKey::IsoWeek => {
                let week = local.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            BucketKey::Month => local.format("%Y-%m").to_string(),
            BucketKey::PostType => record.post_type.to_string(),
            BucketKey::Weekday => weekday_label(local.weekday()).to_string(),
            BucketKey::TimeSlot => TimeSlot::from_hour(local.hour()).label().to_string(),
        }
    }

    /// Buckets `records` by `key`.
    ///
    /// Day, week and month buckets ascend chronologically and list only
    /// occupied buckets; post types follow declaration order; weekday and
    /// time-slot buckets are always complete.
    pub fn aggregate(&self, records: &[Record], key: BucketKey) -> Vec<BucketSummary> {
        match key {
            BucketKey::Day | BucketKey::IsoWeek | BucketKey::Month => {
                let mut buckets: BTreeMap<String, Accumulator> = BTreeMap::new();
                for record in records {
                    buckets
                        .entry(self.time_bucket(record, key))
                        .or_default()
                        .add(record);
                }
                buckets
                    .into_iter()
                    .map(|(bucket, acc)| acc.finish(bucket))
                    .collect()
            }
            BucketKey::PostType => {
                let mut buckets: BTreeMap<PostType, Accumulator> = BTreeMap::new();
                for record in records {
                    buckets.entry(record.post_type).or_default().add(record);
                }
                buckets
                    .into_iter()
                    .map(|(post_type, acc)| acc.finish(post_type.as_str()))
                    .collect()
            }
            BucketKey::Weekday => {
                let mut buckets = [Accumulator::default(); 7];
                for record in records {
                    let day = self.local_time(record.created_at).weekday();
                    buckets[day.num_days_from_monday() as usize].add(record);
                }
                WEEKDAYS
                    .iter()
                    .zip(buckets)
                    .map(|(day, acc)| acc.finish(weekday_label(*day)))
                    .collect()
            }
            BucketKey::TimeSlot => {
                let mut buckets = [Accumulator::default(); 4];
                for record in records {
                    let slot = TimeSlot::from_hour(self.local_time(record.created_at).hour());
                    buckets[slot.index()].add(record);
                }
                TimeSlot::ALL
                    .iter()
                    .zip(buckets)
                    .map(|(slot, acc)| acc.finish(slot.label()))
                    .collect()
            }
        }
    }

    pub fn summarize(&self, records: &[Record]) -> Summary {
        let mut total = Accumulator::default();
        let mut by_type = BTreeMap::new();
        let mut views = 0;
        let mut reach = 0;
        for record in records {
            total.add(record);
            *by_type.entry(record.post_type).or_insert(0) += 1;
            views += record.views.unwrap_or(0);
            reach += record.reach.unwrap_or(0);
        }
        let dates = records.iter().map(|record| self.local_date(record));
        let per_record = |value: u64| {
            if records.is_empty() {
                0.0
            } else {
                value as f64 / records.len() as f64
            }
        };
        let totals = total.finish("all");
        Summary {
            records: totals.count,
            reactions: totals.reactions,
            comments: totals.comments,
            shares: totals.shares,
            engagement: totals.engagement,
            views,
            reach,
            avg_reactions: per_record(totals.reactions),
            avg_comments: per_record(totals.comments),
            avg_shares: per_record(totals.shares),
            avg_engagement: totals.mean_engagement,
            by_type,
            first_day: dates.clone().min(),
            last_day: dates.max(),
        }
    }

    pub fn apply_filter(&self, records: &[Record], filter: &RecordFilter) -> Vec<Record> {
        records
            .iter()
            .filter(|record| {
                let day = self.local_date(record);
                filter.start.map_or(true, |start| day >= start)
                    && filter.end.map_or(true, |end| day <= end)
                    && filter.post_type.map_or(true, |t| record.post_type == t)
            })
            .cloned()
            .collect()
    }
}

/// Highest-engagement records; ties keep input order.
pub fn top_n(records: &[Record], n: usize) -> Vec<Record> {
    let mut ranked: Vec<&Record> = records.iter().collect();
    ranked.sort_by(|a, b| b.engagement().cmp(&a.engagement()));
    ranked.into_iter().take(n).cloned().collect()
}

/// Week-over-week engagement change in percent. The first week, and any week
/// following a zero-engagement week, reads 0.
pub fn growth_series(weeks: &[BucketSummary]) -> Vec<GrowthPoint> {
    let mut previous: Option<u64> = None;
    weeks
        .iter()
        .map(|week| {
            let change_pct = match previous {
                Some(prev) if prev > 0 => {
                    (week.engagement as f64 - prev as f64) / prev as f64 * 100.0
                }
                _ => 0.0,
            };
            previous = Some(week.engagement);
            GrowthPoint {
                bucket: week.bucket.clone(),
                engagement: week.engagement,
                change_pct,
            }
        })
        .collect()
}

/// Occupied bucket with the highest mean engagement; the earliest wins ties.
pub fn best_bucket(buckets: &[BucketSummary]) -> Option<&BucketSummary> {
    buckets
        .iter()
        .filter(|bucket| bucket.count > 0)
        .fold(None, |best: Option<&BucketSummary>, bucket| match best {
            Some(current) if current.mean_engagement >= bucket.mean_engagement => Some(current),
            _ => Some(bucket),
        })
}
