//! Minute-boundary aggregation of the record stream.
//!
//! The [`Aggregator`] buffers records for the in-flight minute and seals
//! them into one [`Candle`] when the first record of a later minute
//! arrives. Sealing replays the buffer in arrival order and counts repeat
//! (file, source IP) pairs within the minute only once.
//!
//! Emission therefore trails the stream by one record: the final minute
//! stays pending until [`Aggregator::flush`] is called at shutdown.

pub mod rollup;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::candle::{truncate_to_minute, Candle, LogRecord};

/// Errors produced while feeding the aggregator.
#[derive(Error, Debug)]
pub enum AggregateError {
    /// A record regressed to a minute earlier than the highest one seen.
    /// Bucket membership would be undefined, so the record is refused.
    #[error("record at {got} arrived after minute {current} was opened")]
    OutOfOrder {
        got: DateTime<Utc>,
        current: DateTime<Utc>,
    },
}

/// Turns an ordered record stream into one candle per distinct minute.
///
/// Not safe for concurrent use: exactly one sequential consumer must own
/// an instance (one per log source).
#[derive(Debug, Default)]
pub struct Aggregator {
    pending: Vec<LogRecord>,
    // Highest minute ever seen; outlives flush() so a regressed record
    // can never overwrite an already-sealed minute.
    last_minute: Option<DateTime<Utc>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records buffered for the in-flight minute.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Buffers a record, returning the previous minute's candle when the
    /// record opens a new minute.
    ///
    /// Input must be non-decreasing in time; a record older than the
    /// buffered minute is rejected rather than silently re-bucketed.
    pub fn store(&mut self, mut record: LogRecord) -> Result<Option<Candle>, AggregateError> {
        record.timestamp = truncate_to_minute(record.timestamp);

        if let Some(current) = self.last_minute {
            if record.timestamp < current {
                return Err(AggregateError::OutOfOrder {
                    got: record.timestamp,
                    current,
                });
            }
        }

        let closed = match self.pending.last() {
            Some(last) if record.timestamp != last.timestamp => Some(self.seal()),
            _ => None,
        };

        self.last_minute = Some(record.timestamp);
        self.pending.push(record);
        Ok(closed)
    }

    /// Finalizes the pending minute, if any.
    ///
    /// Without this the tail minute would only surface once a record from
    /// a later minute arrived; call it on shutdown so the tail is not lost.
    pub fn flush(&mut self) -> Option<Candle> {
        if self.pending.is_empty() {
            return None;
        }
        Some(self.seal())
    }

    fn seal(&mut self) -> Candle {
        let mut candle = Candle::new();
        // Keyed on (minute, file, ip) so dedup stays correct even if the
        // seen-set ever outlives a single buffered minute.
        let mut seen: HashSet<(DateTime<Utc>, String, String)> = HashSet::new();

        for record in self.pending.drain(..) {
            let key = (
                record.timestamp,
                record.file_name.clone(),
                record.source_ip.clone(),
            );
            if seen.insert(key) {
                candle.update(&record);
            }
        }

        candle
    }
}
