//! Range-queryable persistent candle store.
//!
//! Candles are keyed by their start minute as Unix seconds in a
//! fixed-width, sign-aware big-endian encoding, so bytewise key order is
//! numeric order and inclusive range scans come back ascending.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::candle::Candle;

/// Name of the logical collection holding candles.
const STATS_TREE: &str = "stats";

/// Capacity of the streamed-load channel.
const STREAM_BUFFER: usize = 16;

/// Engine failures. "No matching entries" is not an error and surfaces
/// as an empty result instead.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage engine failure")]
    Engine(#[from] sled::Error),

    #[error("candle serialization failure")]
    Serialize(#[from] serde_json::Error),
}

/// Persistence contract for candles: save by start minute, load a period.
pub trait Engine: Send + Sync {
    /// Persists a candle, overwriting any entry for the same start minute.
    fn save(&self, candle: &Candle) -> Result<(), StoreError>;

    /// Returns every candle with `start_minute` in the inclusive period,
    /// ascending. Never nil: an empty period yields an empty vec.
    fn load(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError>;
}

/// Encodes Unix seconds so bytewise order matches numeric order.
///
/// Big-endian with the sign bit flipped; unpadded decimal text would
/// misorder ranges spanning a power-of-ten boundary.
fn encode_key(unix_seconds: i64) -> [u8; 8] {
    ((unix_seconds as u64) ^ (1 << 63)).to_be_bytes()
}

/// sled-backed persistent store.
///
/// sled gives single-writer/multi-reader isolation natively, so writers
/// from the ingestion pipeline and readers from query handlers share one
/// instance without an external lock.
pub struct SledStore {
    // Held so the tree outlives no underlying database handle.
    _db: sled::Db,
    tree: sled::Tree,
}

impl SledStore {
    /// Opens (or creates) the backing file and the stats collection.
    ///
    /// Fails loudly on an inaccessible or structurally invalid file; no
    /// silent partial state.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        info!(path = %path.as_ref().display(), "opening persistent candle store");
        let db = sled::open(path)?;
        let tree = db.open_tree(STATS_TREE)?;
        Ok(Self { _db: db, tree })
    }

    /// Streams candles for the inclusive period through a channel.
    ///
    /// The scan runs on a blocking thread and stops promptly when the
    /// token is cancelled or the receiver is dropped, without draining
    /// the rest of the range. An engine failure is delivered as the
    /// final item.
    pub fn load_stream(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<Candle, StoreError>> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let tree = self.tree.clone();
        let lo = encode_key(period_start.timestamp());
        let hi = encode_key(period_end.timestamp());

        tokio::task::spawn_blocking(move || {
            for item in tree.range(lo..=hi) {
                if cancel.is_cancelled() {
                    debug!("candle stream cancelled mid-scan");
                    return;
                }

                let out = item
                    .map_err(StoreError::from)
                    .and_then(|(_, value)| Ok(serde_json::from_slice(&value)?));
                let failed = out.is_err();

                if tx.blocking_send(out).is_err() {
                    // Receiver gone; abandon the scan.
                    return;
                }
                if failed {
                    return;
                }
            }
        });

        rx
    }
}

impl Engine for SledStore {
    fn save(&self, candle: &Candle) -> Result<(), StoreError> {
        let key = encode_key(candle.start_minute.timestamp());
        let value = serde_json::to_vec(candle)?;
        self.tree.insert(key, value)?;

        // A candle is only saved once it is on disk; a failed flush is an
        // engine failure, not a warning.
        self.tree.flush()?;
        debug!(start_minute = candle.start_minute.timestamp(), "saved candle");
        Ok(())
    }

    fn load(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError> {
        let lo = encode_key(period_start.timestamp());
        let hi = encode_key(period_end.timestamp());

        let mut result = Vec::new();
        for item in self.tree.range(lo..=hi) {
            let (_, value) = item?;
            result.push(serde_json::from_slice(&value)?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::candle::LogRecord;

    fn open_store() -> (tempfile::TempDir, SledStore) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = SledStore::open(dir.path().join("candles.db")).expect("open store");
        (dir, store)
    }

    fn candle_at(minute: i64) -> Candle {
        let mut candle = Candle::new();
        candle.update(&LogRecord {
            source_ip: "1.1.1.1".to_string(),
            file_name: "/a.mp3".to_string(),
            dest_node: "n1".to_string(),
            timestamp: DateTime::from_timestamp(minute * 60, 0).expect("valid timestamp"),
            answer_time: Duration::from_millis(250),
        });
        candle
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("valid timestamp")
    }

    #[test]
    fn test_key_encoding_orders_like_numbers() {
        // Unpadded decimal would order "999999999" after "1000000000".
        let pairs = [(999_999_999i64, 1_000_000_000i64), (-61, -60), (-1, 0), (59, 60)];
        for (a, b) in pairs {
            assert!(encode_key(a) < encode_key(b), "{a} must sort before {b}");
        }
    }

    #[test]
    fn test_save_then_point_load_returns_exactly_one() {
        let (_dir, store) = open_store();
        let candle = candle_at(5);
        store.save(&candle).expect("save");

        let loaded = store
            .load(candle.start_minute, candle.start_minute)
            .expect("load");
        assert_eq!(loaded, vec![candle]);
    }

    #[test]
    fn test_save_overwrites_same_minute() {
        let (_dir, store) = open_store();
        let first = candle_at(5);
        let mut second = candle_at(5);
        second.update(&LogRecord {
            source_ip: "2.2.2.2".to_string(),
            file_name: "/b.mp3".to_string(),
            dest_node: "n2".to_string(),
            timestamp: ts(300),
            answer_time: Duration::from_millis(100),
        });

        store.save(&first).expect("save");
        store.save(&second).expect("save");

        let loaded = store.load(ts(300), ts(300)).expect("load");
        assert_eq!(loaded, vec![second]);
    }

    #[test]
    fn test_range_load_is_ascending_and_complete() {
        let (_dir, store) = open_store();
        // Save out of order on purpose.
        for minute in [3i64, 0, 4, 1, 2] {
            store.save(&candle_at(minute)).expect("save");
        }

        let loaded = store.load(ts(0), ts(4 * 60)).expect("load");
        assert_eq!(loaded.len(), 5);
        for (i, candle) in loaded.iter().enumerate() {
            assert_eq!(candle.start_minute.timestamp(), i as i64 * 60);
        }
    }

    #[test]
    fn test_range_bounds_are_inclusive() {
        let (_dir, store) = open_store();
        for minute in 0..4 {
            store.save(&candle_at(minute)).expect("save");
        }

        let loaded = store.load(ts(60), ts(120)).expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].start_minute.timestamp(), 60);
        assert_eq!(loaded[1].start_minute.timestamp(), 120);
    }

    #[test]
    fn test_empty_range_returns_empty_not_error() {
        let (_dir, store) = open_store();
        store.save(&candle_at(100)).expect("save");

        let loaded = store.load(ts(0), ts(60)).expect("load");
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_load_stream_delivers_ascending() {
        let (_dir, store) = open_store();
        for minute in 0..3 {
            store.save(&candle_at(minute)).expect("save");
        }

        let mut rx = store.load_stream(ts(0), ts(180), CancellationToken::new());
        let mut minutes = Vec::new();
        while let Some(candle) = rx.recv().await {
            minutes.push(candle.expect("stream item").start_minute.timestamp());
        }
        assert_eq!(minutes, vec![0, 60, 120]);
    }

    #[tokio::test]
    async fn test_load_stream_stops_on_cancel() {
        let (_dir, store) = open_store();
        for minute in 0..100 {
            store.save(&candle_at(minute)).expect("save");
        }

        let cancel = CancellationToken::new();
        let mut rx = store.load_stream(ts(0), ts(100 * 60), cancel.clone());

        let first = rx.recv().await.expect("first item").expect("stream item");
        assert_eq!(first.start_minute.timestamp(), 0);

        cancel.cancel();
        let mut remaining = 0;
        while rx.recv().await.is_some() {
            remaining += 1;
        }
        // The scan stops well before draining the full range; at most the
        // channel buffer was already in flight.
        assert!(remaining <= STREAM_BUFFER + 1, "got {remaining} items after cancel");
    }
}
