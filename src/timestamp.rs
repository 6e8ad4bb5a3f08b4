//! Calendar bucketing and interval predicates over sample timestamps (C11).
//!
//! Grounded on `original_source/skvoz/aggregation/util/timestamps.py`
//! (`group_by_*`, `filter_by_interval`). Per the Design Notes Open
//! Question, all bucketing here is fixed to UTC rather than the
//! original's naive local time.

use chrono::{DateTime, Datelike, Utc};

/// The calendar unit named by a `GROUP BY <unit>` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl BucketUnit {
    /// Parses a (plural-stripped, lowercased) TDQL time-unit identifier.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "minute" => Some(BucketUnit::Minute),
            "hour" => Some(BucketUnit::Hour),
            "day" => Some(BucketUnit::Day),
            "week" => Some(BucketUnit::Week),
            "month" => Some(BucketUnit::Month),
            "year" => Some(BucketUnit::Year),
            _ => None,
        }
    }
}

/// The bucket key produced for one sample. Every unit but `year` formats to
/// a calendar string; `year` stays an integer per spec.md's table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BucketKey {
    Named(String),
    Year(i32),
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BucketKey::Named(s) => write!(f, "{s}"),
            BucketKey::Year(y) => write!(f, "{y}"),
        }
    }
}

fn datetime_from_secs(ts_seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts_seconds, 0).unwrap_or_else(|| DateTime::from_timestamp(0, 0).unwrap())
}

/// Computes the bucket key for a given unix-second timestamp under `unit`.
pub fn bucket_key(unit: BucketUnit, ts_seconds: i64) -> BucketKey {
    let d = datetime_from_secs(ts_seconds);
    match unit {
        BucketUnit::Minute => BucketKey::Named(d.format("%Y-%m-%d-%H.%M").to_string()),
        BucketUnit::Hour => BucketKey::Named(d.format("%Y-%m-%d-%H").to_string()),
        BucketUnit::Day => BucketKey::Named(d.format("%Y-%m-%d").to_string()),
        BucketUnit::Week => BucketKey::Named(d.format("%Y-%W").to_string()),
        BucketUnit::Month => BucketKey::Named(d.format("%Y-%m").to_string()),
        BucketUnit::Year => BucketKey::Year(d.year()),
    }
}

/// Chunks a timestamp-ascending stream into `(bucket_key, items)` groups,
/// lazily: each `next()` call pulls only as many upstream items as belong
/// to the current bucket, mirroring `timestamps.py`'s `_group_by_date`
/// generator-of-generators without materializing the whole stream.
pub struct GroupByTime<I, T>
where
    I: Iterator<Item = (i64, T)>,
{
    unit: BucketUnit,
    inner: std::iter::Peekable<I>,
}

impl<I, T> GroupByTime<I, T>
where
    I: Iterator<Item = (i64, T)>,
{
    pub fn new(unit: BucketUnit, inner: I) -> Self {
        Self {
            unit,
            inner: inner.peekable(),
        }
    }
}

impl<I, T> Iterator for GroupByTime<I, T>
where
    I: Iterator<Item = (i64, T)>,
{
    type Item = (BucketKey, Vec<(i64, T)>);

    fn next(&mut self) -> Option<Self::Item> {
        let (first_ts, first_val) = self.inner.next()?;
        let key = bucket_key(self.unit, first_ts);
        let mut group = vec![(first_ts, first_val)];

        while let Some((ts, _)) = self.inner.peek() {
            if bucket_key(self.unit, *ts) != key {
                break;
            }
            group.push(self.inner.next().unwrap());
        }

        Some((key, group))
    }
}

/// Keeps samples with `start <= t <= end` (or `t >= start` when `end` is
/// absent). Grounded on `timestamps.py`'s `filter_by_interval`.
pub fn filter_by_interval<I, T>(
    inner: I,
    start_seconds: i64,
    end_seconds: Option<i64>,
) -> impl Iterator<Item = (i64, T)>
where
    I: Iterator<Item = (i64, T)>,
{
    inner.filter(move |(ts, _)| match end_seconds {
        Some(end) => *ts >= start_seconds && *ts <= end,
        None => *ts >= start_seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_key_formats_match_spec_table() {
        // 2023-03-14 15:09:26 UTC
        let ts = 1678806566;
        assert_eq!(
            bucket_key(BucketUnit::Minute, ts),
            BucketKey::Named("2023-03-14-15.09".to_string())
        );
        assert_eq!(
            bucket_key(BucketUnit::Hour, ts),
            BucketKey::Named("2023-03-14-15".to_string())
        );
        assert_eq!(
            bucket_key(BucketUnit::Day, ts),
            BucketKey::Named("2023-03-14".to_string())
        );
        assert_eq!(bucket_key(BucketUnit::Year, ts), BucketKey::Year(2023));
    }

    #[test]
    fn group_by_time_emits_strictly_increasing_keys() {
        let samples: Vec<(i64, &str)> = vec![
            (1678806566, "a"),
            (1678806567, "b"),
            (1678806627, "c"), // next minute
            (1678806628, "d"),
        ];
        let groups: Vec<_> =
            GroupByTime::new(BucketUnit::Minute, samples.into_iter()).collect();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].1.len(), 2);
        assert!(groups[0].0 < groups[1].0);
    }

    #[test]
    fn filter_by_interval_open_ended() {
        let samples: Vec<(i64, i32)> = vec![(1, 0), (5, 1), (10, 2)];
        let kept: Vec<_> = filter_by_interval(samples.into_iter(), 5, None).collect();
        assert_eq!(kept, vec![(5, 1), (10, 2)]);
    }

    #[test]
    fn filter_by_interval_closed() {
        let samples: Vec<(i64, i32)> = vec![(1, 0), (5, 1), (10, 2), (20, 3)];
        let kept: Vec<_> = filter_by_interval(samples.into_iter(), 5, Some(10)).collect();
        assert_eq!(kept, vec![(5, 1), (10, 2)]);
    }
}
