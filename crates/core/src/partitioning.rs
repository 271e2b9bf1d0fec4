//! Time partitioning of trend store parts.
//!
//! A partition holds one contiguous, half-open time interval of rows and is
//! physically a separate backing table named `<part_name>_<index>`. The
//! index function is pure and monotonic non-decreasing in the timestamp, so
//! a row's partition can always be recomputed from its timestamp alone.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Reference point for partition index 0. Kept as an offset in seconds from
/// the Unix epoch for deployments whose historical partition boundaries were
/// cut in a local timezone crossing a day boundary; 0 means UTC-normalized.
pub const EPOCH_OFFSET_SECONDS: i64 = 0;

/// Pure partitioning math for one trend store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partitioning {
    partition_size: i64,
}

/// One partition: an index and the half-open interval it covers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Partition index, `floor(unix_seconds / partition_size)`
    pub index: i64,
    /// Inclusive interval start
    pub start: DateTime<Utc>,
    /// Exclusive interval end
    pub end: DateTime<Utc>,
}

impl Partitioning {
    /// Partitioning with the given partition size in seconds.
    pub fn from_seconds(partition_size: i64) -> StorageResult<Partitioning> {
        if partition_size <= 0 {
            return Err(StorageError::PackageShape(format!(
                "partition size must be positive, got {partition_size}"
            )));
        }
        Ok(Partitioning { partition_size })
    }

    /// Partitioning with the given partition size.
    pub fn new(partition_size: Duration) -> StorageResult<Partitioning> {
        Partitioning::from_seconds(partition_size.num_seconds())
    }

    /// The partition size in seconds.
    pub fn partition_size(&self) -> i64 {
        self.partition_size
    }

    /// The index of the partition containing `timestamp`.
    pub fn index(&self, timestamp: DateTime<Utc>) -> i64 {
        (timestamp.timestamp() - EPOCH_OFFSET_SECONDS).div_euclid(self.partition_size)
    }

    /// The half-open interval `[index*size, (index+1)*size)` covered by a
    /// partition index.
    pub fn interval(&self, index: i64) -> Partition {
        let start = index * self.partition_size + EPOCH_OFFSET_SECONDS;
        let end = start + self.partition_size;
        Partition {
            index,
            // Boundaries derived from real timestamps stay far inside
            // chrono's representable range.
            start: DateTime::from_timestamp(start, 0)
                .expect("partition boundary outside representable time range"),
            end: DateTime::from_timestamp(end, 0)
                .expect("partition boundary outside representable time range"),
        }
    }

    /// The partition containing `timestamp`.
    pub fn partition_for(&self, timestamp: DateTime<Utc>) -> Partition {
        self.interval(self.index(timestamp))
    }

    /// All partition indexes overlapping the half-open interval
    /// `[start, end)`, in ascending order.
    pub fn indexes_for_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<i64> {
        if end <= start {
            return Vec::new();
        }
        let first = self.index(start);
        let last = self.index(end - Duration::seconds(1));
        (first..=last).collect()
    }
}

impl Partition {
    /// The backing table name for this partition of the given part.
    pub fn table_name(&self, part_name: &str) -> String {
        format!("{}_{}", part_name, self.index)
    }

    /// Whether a timestamp falls inside this partition's interval.
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_interval_contains_its_timestamp() {
        let partitioning = Partitioning::from_seconds(86_400).unwrap();
        for s in [
            "2023-05-01T00:00:00Z",
            "2023-05-01T14:05:00Z",
            "2023-05-01T23:59:59Z",
            "1969-12-31T23:00:00Z",
        ] {
            let t = ts(s);
            let partition = partitioning.partition_for(t);
            assert!(partition.contains(t), "{s} not in {partition:?}");
        }
    }

    #[test]
    fn test_index_monotonic_non_decreasing() {
        let partitioning = Partitioning::from_seconds(900).unwrap();
        let mut previous = i64::MIN;
        let base = ts("2023-05-01T00:00:00Z");
        for offset in (0..86_400).step_by(300) {
            let index = partitioning.index(base + Duration::seconds(offset));
            assert!(index >= previous);
            previous = index;
        }
    }

    #[test]
    fn test_boundary_is_half_open() {
        let partitioning = Partitioning::from_seconds(3600).unwrap();
        let boundary = ts("2023-05-01T15:00:00Z");
        let before = partitioning.partition_for(boundary - Duration::seconds(1));
        let at = partitioning.partition_for(boundary);
        assert_eq!(before.index + 1, at.index);
        assert_eq!(before.end, at.start);
        assert!(!before.contains(boundary));
        assert!(at.contains(boundary));
    }

    #[test]
    fn test_pre_epoch_floors_downward() {
        let partitioning = Partitioning::from_seconds(86_400).unwrap();
        let t = ts("1969-12-31T12:00:00Z");
        let partition = partitioning.partition_for(t);
        assert_eq!(partition.index, -1);
        assert!(partition.contains(t));
    }

    #[test]
    fn test_table_name() {
        let partitioning = Partitioning::from_seconds(86_400).unwrap();
        let partition = partitioning.partition_for(ts("2023-05-01T14:05:00Z"));
        assert_eq!(
            partition.table_name("node_main_15m"),
            format!("node_main_15m_{}", partition.index)
        );
    }

    #[test]
    fn test_indexes_for_range() {
        let partitioning = Partitioning::from_seconds(3600).unwrap();
        let start = ts("2023-05-01T14:00:00Z");
        let indexes = partitioning.indexes_for_range(start, start + Duration::hours(3));
        assert_eq!(indexes.len(), 3);
        assert_eq!(indexes[0], partitioning.index(start));
        assert!(partitioning
            .indexes_for_range(start, start)
            .is_empty());
    }
}
