//! Read path: load a period from the store and roll it up on demand.
//!
//! This is the seam the (out-of-scope) request layer calls into; the
//! parameters arrive already validated.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::aggregate::rollup::{rollup, RollupError};
use crate::candle::Candle;
use crate::store::{Engine, StoreError};

/// Validated query inputs from the request layer.
#[derive(Debug, Clone)]
pub struct QueryParams {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Reporting bucket width; whole minutes, minimum one.
    pub aggregate: Duration,
}

impl QueryParams {
    /// Builds params with the request-layer defaults: `to` = now,
    /// `aggregate` = one minute.
    pub fn new(from: DateTime<Utc>) -> Self {
        Self {
            from,
            to: Utc::now(),
            aggregate: Duration::from_secs(60),
        }
    }
}

/// Read-path failures.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Rollup(#[from] RollupError),
}

/// Loads candles for the period and re-buckets them when the requested
/// interval is coarser than one minute.
///
/// An empty period yields an empty, never-nil sequence.
pub fn candles_for_period<E: Engine>(
    engine: &E,
    params: &QueryParams,
) -> Result<Vec<Candle>, QueryError> {
    let candles = engine.load(params.from, params.to)?;

    if params.aggregate > Duration::from_secs(60) {
        return Ok(rollup(&candles, params.aggregate)?);
    }

    Ok(candles)
}
