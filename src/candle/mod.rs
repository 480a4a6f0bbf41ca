//! Per-minute statistics model.
//!
//! A [`Candle`] compresses one minute of access-log records into per-node
//! [`Info`] summaries. The synthetic `"all"` node aggregates every real
//! node so cluster-wide totals never require a second pass.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the synthetic node that aggregates all real nodes.
pub const ALL_NODE: &str = "all";

/// Initial minimum answer time, larger than any realistic latency.
const MIN_SENTINEL: Duration = Duration::from_secs(3600);

/// One access-log record after parsing. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub source_ip: String,
    pub file_name: String,
    pub dest_node: String,
    pub timestamp: DateTime<Utc>,
    pub answer_time: Duration,
}

/// Running download statistics for a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    pub volume: u64,
    #[serde(with = "duration_nanos")]
    pub min_answer_time: Duration,
    #[serde(with = "duration_nanos")]
    pub mean_answer_time: Duration,
    #[serde(with = "duration_nanos")]
    pub max_answer_time: Duration,
    pub files: HashMap<String, u64>,
}

impl Info {
    /// Creates empty node statistics with the min sentinel in place.
    pub fn new() -> Self {
        Self {
            volume: 0,
            min_answer_time: MIN_SENTINEL,
            mean_answer_time: Duration::ZERO,
            max_answer_time: Duration::ZERO,
            files: HashMap::new(),
        }
    }

    /// Folds one answer time into the running statistics.
    ///
    /// The mean stays exact under integer nanosecond arithmetic:
    /// `mean = (mean * volume + answer_time) / (volume + 1)`.
    pub fn update(&mut self, answer_time: Duration) {
        if self.min_answer_time > answer_time {
            self.min_answer_time = answer_time;
        }
        if self.max_answer_time < answer_time {
            self.max_answer_time = answer_time;
        }

        let total = self.mean_answer_time.as_nanos() * u128::from(self.volume)
            + answer_time.as_nanos();
        self.mean_answer_time = duration_from_nanos(total / u128::from(self.volume + 1));
        self.volume += 1;
    }
}

impl Default for Info {
    fn default() -> Self {
        Self::new()
    }
}

/// One minute (or one rollup bucket) of per-node statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub nodes: HashMap<String, Info>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub start_minute: DateTime<Utc>,
}

impl Candle {
    /// Creates an empty candle at the Unix epoch.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            start_minute: DateTime::UNIX_EPOCH,
        }
    }

    /// Applies a record to its destination node and to the `"all"` node.
    ///
    /// The caller truncates `record.timestamp` to minute resolution before
    /// relying on `start_minute` for bucketing.
    pub fn update(&mut self, record: &LogRecord) {
        for name in [record.dest_node.as_str(), ALL_NODE] {
            let info = self.nodes.entry(name.to_string()).or_default();
            info.update(record.answer_time);
            *info.files.entry(record.file_name.clone()).or_insert(0) += 1;
        }
        self.start_minute = record.timestamp;
    }

    /// Returns true when no record has been applied.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for Candle {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncates a timestamp to whole-minute resolution.
pub fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let aligned = secs - secs.rem_euclid(60);
    DateTime::from_timestamp(aligned, 0).unwrap_or(ts)
}

pub(crate) fn duration_from_nanos(nanos: u128) -> Duration {
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Durations cross the wire as integer nanoseconds.
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ip: &str, file: &str, node: &str, secs: i64, answer: Duration) -> LogRecord {
        LogRecord {
            source_ip: ip.to_string(),
            file_name: file.to_string(),
            dest_node: node.to_string(),
            timestamp: DateTime::from_timestamp(secs, 0).expect("valid timestamp"),
            answer_time: answer,
        }
    }

    #[test]
    fn test_new_info_holds_sentinels() {
        let info = Info::new();
        assert_eq!(info.volume, 0);
        assert_eq!(info.min_answer_time, Duration::from_secs(3600));
        assert_eq!(info.mean_answer_time, Duration::ZERO);
        assert_eq!(info.max_answer_time, Duration::ZERO);
        assert!(info.files.is_empty());
    }

    #[test]
    fn test_info_update_tracks_exact_stats() {
        let mut info = Info::new();
        for millis in [6_000u64, 3_000, 9_000] {
            info.update(Duration::from_millis(millis));
        }

        assert_eq!(info.volume, 3);
        assert_eq!(info.min_answer_time, Duration::from_secs(3));
        assert_eq!(info.max_answer_time, Duration::from_secs(9));
        assert_eq!(info.mean_answer_time, Duration::from_secs(6));
    }

    #[test]
    fn test_info_mean_is_running_integer_mean() {
        let mut info = Info::new();
        info.update(Duration::from_nanos(1));
        info.update(Duration::from_nanos(2));
        // (0*0 + 1)/1 = 1, then (1*1 + 2)/2 = 1 under integer division.
        assert_eq!(info.mean_answer_time, Duration::from_nanos(1));
    }

    #[test]
    fn test_candle_update_mirrors_into_all_node() {
        let mut candle = Candle::new();
        candle.update(&record("1.1.1.1", "/a.mp3", "n1", 120, Duration::from_secs(1)));
        candle.update(&record("2.2.2.2", "/b.mp3", "n2", 120, Duration::from_secs(3)));

        assert_eq!(candle.nodes.len(), 3);
        assert_eq!(candle.nodes["n1"].volume, 1);
        assert_eq!(candle.nodes["n2"].volume, 1);

        let all = &candle.nodes[ALL_NODE];
        assert_eq!(all.volume, 2);
        assert_eq!(all.min_answer_time, Duration::from_secs(1));
        assert_eq!(all.max_answer_time, Duration::from_secs(3));
        assert_eq!(all.mean_answer_time, Duration::from_secs(2));
        assert_eq!(all.files["/a.mp3"], 1);
        assert_eq!(all.files["/b.mp3"], 1);
    }

    #[test]
    fn test_all_node_volume_equals_sum_of_real_nodes() {
        let mut candle = Candle::new();
        for i in 0..10 {
            let node = if i % 2 == 0 { "n1" } else { "n2" };
            candle.update(&record(
                &format!("10.0.0.{i}"),
                "/f.bin",
                node,
                60,
                Duration::from_millis(100),
            ));
        }

        let real_sum: u64 = candle
            .nodes
            .iter()
            .filter(|(name, _)| name.as_str() != ALL_NODE)
            .map(|(_, info)| info.volume)
            .sum();
        assert_eq!(candle.nodes[ALL_NODE].volume, real_sum);
        assert_eq!(candle.nodes[ALL_NODE].files["/f.bin"], 10);
    }

    #[test]
    fn test_truncate_to_minute_drops_seconds() {
        let ts = DateTime::from_timestamp(90, 500_000_000).expect("valid timestamp");
        let truncated = truncate_to_minute(ts);
        assert_eq!(truncated.timestamp(), 60);
        assert_eq!(truncated.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn test_candle_wire_shape_round_trips() {
        let mut candle = Candle::new();
        candle.update(&record("1.1.1.1", "/a.mp3", "n1", 180, Duration::from_secs(2)));

        let value = serde_json::to_value(&candle).expect("serialize");
        assert_eq!(value["startMinute"], 180);
        assert_eq!(value["nodes"]["n1"]["volume"], 1);
        assert_eq!(value["nodes"]["n1"]["meanAnswerTime"], 2_000_000_000u64);
        assert_eq!(value["nodes"]["n1"]["files"]["/a.mp3"], 1);

        let back: Candle = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, candle);
    }
}
