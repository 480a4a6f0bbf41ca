//! Rollup of minute candles into coarser reporting buckets.
//!
//! Pure and stateless over its input slice. The per-node merge rule is
//! associative and commutative for volume, min, max and file counts, and
//! holds for the mean up to integer-nanosecond truncation, so repeated
//! rollups over the same leaf set agree regardless of grouping.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::candle::{duration_from_nanos, Candle, Info};

/// Errors produced while rolling up candles.
#[derive(Error, Debug)]
pub enum RollupError {
    /// Input candles must already be minute-aligned; misaligned input
    /// would silently land in the wrong bucket.
    #[error("candle at {start} is not minute-aligned")]
    MisalignedCandle { start: DateTime<Utc> },
}

/// Buckets minute candles into `interval`-wide candles, ascending.
///
/// The interval is floor-truncated to whole minutes and clamped to a
/// minimum of one minute. Buckets start at the earliest `start_minute`
/// and are half-open; buckets no input candle falls into are omitted.
/// Empty input yields empty output. A 1-minute rollup is the identity
/// transform over an ascending input sequence.
pub fn rollup(candles: &[Candle], interval: Duration) -> Result<Vec<Candle>, RollupError> {
    let mut result = Vec::new();
    if candles.is_empty() {
        return Ok(result);
    }

    for candle in candles {
        let start = candle.start_minute;
        if start.timestamp().rem_euclid(60) != 0 || start.timestamp_subsec_nanos() != 0 {
            return Err(RollupError::MisalignedCandle { start });
        }
    }

    let interval_minutes = (interval.as_secs() / 60).max(1);
    let step = chrono::Duration::seconds(interval_minutes as i64 * 60);

    let first = candles
        .iter()
        .map(|c| c.start_minute)
        .min()
        .expect("input is non-empty");
    let last = candles
        .iter()
        .map(|c| c.start_minute)
        .max()
        .expect("input is non-empty");

    let mut bucket_start = first;
    while bucket_start <= last {
        let bucket_end = bucket_start + step;

        let mut bucket = Candle::new();
        bucket.start_minute = bucket_start;
        for candle in candles {
            if candle.start_minute >= bucket_start && candle.start_minute < bucket_end {
                merge_candle(&mut bucket, candle);
            }
        }

        if !bucket.is_empty() {
            result.push(bucket);
        }
        bucket_start = bucket_end;
    }

    Ok(result)
}

fn merge_candle(target: &mut Candle, source: &Candle) {
    for (name, info) in &source.nodes {
        merge_info(target.nodes.entry(name.clone()).or_default(), info);
    }
}

/// Merges `other` into `info` with volume-weighted mean.
///
/// The mean is combined before volumes are summed into `info`; a
/// zero-volume side contributes nothing, so merging a fresh `Info`
/// reduces to a copy. Both sides empty is a no-op.
fn merge_info(info: &mut Info, other: &Info) {
    let total_volume = info.volume + other.volume;
    if total_volume == 0 {
        return;
    }

    let weighted = info.mean_answer_time.as_nanos() * u128::from(info.volume)
        + other.mean_answer_time.as_nanos() * u128::from(other.volume);
    info.mean_answer_time = duration_from_nanos(weighted / u128::from(total_volume));

    if info.min_answer_time > other.min_answer_time {
        info.min_answer_time = other.min_answer_time;
    }
    if info.max_answer_time < other.max_answer_time {
        info.max_answer_time = other.max_answer_time;
    }
    for (file, count) in &other.files {
        *info.files.entry(file.clone()).or_insert(0) += count;
    }
    info.volume = total_volume;
}
