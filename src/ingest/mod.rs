//! Log ingestion pipeline.
//!
//! One pipeline per log source: a line-splitting stage tails the source
//! file and hands complete lines through a single-consumer queue to a
//! parse + aggregate + save stage. The [`Aggregator`] is owned by that
//! single consumer, which is the whole concurrency story on the write
//! path; the store handles concurrent readers on its own.

pub mod parse;

use std::io::SeekFrom;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::Aggregator;
use crate::candle::Candle;
use crate::config::{ParserConfig, SourceConfig};
use crate::export::health::HealthMetrics;
use crate::ingest::parse::Parser;
use crate::store::Engine;

/// Read chunk size for the tailing stage.
const READ_CHUNK: usize = 8 * 1024;

/// Capacity of the line queue between the two stages.
const LINE_QUEUE: usize = 1024;

/// Splits a byte stream into lines, buffering partial input across reads.
///
/// Complete lines are handed off through an mpsc queue; the trailing
/// fragment stays in the buffer until its newline arrives.
pub struct LineExtractor {
    tx: mpsc::Sender<String>,
    buf: Vec<u8>,
}

impl LineExtractor {
    /// Creates an extractor and the receiving end of its line queue.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                buf: Vec::new(),
            },
            rx,
        )
    }

    /// Appends a chunk, sending every complete line to the consumer.
    ///
    /// Returns `Err` once the consumer has gone away.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), mpsc::error::SendError<String>> {
        self.buf.extend_from_slice(chunk);

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            // CRLF sources leave a trailing carriage return.
            let end = if pos > 0 && self.buf[pos - 1] == b'\r' {
                pos - 1
            } else {
                pos
            };
            let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
            self.buf.drain(..=pos);
            self.tx.send(line).await?;
        }

        Ok(())
    }
}

/// Tails one access-log source into the candle store.
pub struct Ingester<E: Engine> {
    source: SourceConfig,
    parser_cfg: ParserConfig,
    engine: Arc<E>,
    health: Arc<HealthMetrics>,
}

impl<E: Engine + 'static> Ingester<E> {
    pub fn new(
        source: SourceConfig,
        parser_cfg: ParserConfig,
        engine: Arc<E>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            source,
            parser_cfg,
            engine,
            health,
        }
    }

    /// Runs the pipeline until the source closes or the token cancels.
    ///
    /// On the way out the pending minute is flushed and saved so the tail
    /// of the stream is not lost.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let parser = Parser::new(&self.parser_cfg.pattern, &self.parser_cfg.date_format)
            .context("building log parser")?;

        info!(path = %self.source.path.display(), "starting log ingestion");

        let (extractor, mut lines) = LineExtractor::new(LINE_QUEUE);

        let reader_cancel = cancel.clone();
        let source = self.source.clone();
        let reader = tokio::spawn(async move {
            if let Err(e) = tail_file(&source, extractor, reader_cancel).await {
                error!(error = %e, path = %source.path.display(), "log tail failed");
            }
        });

        let mut aggregator = Aggregator::new();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
            };
            self.consume_line(&parser, &mut aggregator, &line);
        }

        // Finalize the in-flight minute; without this the tail minute
        // would need a later record to ever surface.
        if let Some(candle) = aggregator.flush() {
            self.save_candle(&candle);
        }
        self.health.pending_records.set(0.0);

        reader.await.context("joining log tail task")?;
        info!("log ingestion stopped");

        Ok(())
    }

    fn consume_line(&self, parser: &Parser, aggregator: &mut Aggregator, line: &str) {
        self.health.lines_received.inc();

        let record = match parser.parse(line) {
            Ok(record) => record,
            Err(e) => {
                self.health.parse_errors.inc();
                debug!(error = %e, "skipping unparseable line");
                return;
            }
        };
        self.health.records_parsed.inc();

        match aggregator.store(record) {
            Ok(Some(candle)) => self.save_candle(&candle),
            Ok(None) => {}
            Err(e) => {
                self.health.records_rejected.inc();
                warn!(error = %e, "dropping out-of-order record");
            }
        }
        self.health.pending_records.set(aggregator.pending_len() as f64);
    }

    /// Saves a finalized candle. A failure is reported and the candle is
    /// dropped: persistence is at-most-once, there are no retries.
    fn save_candle(&self, candle: &Candle) {
        match self.engine.save(candle) {
            Ok(()) => self.health.candles_saved.inc(),
            Err(e) => {
                self.health.candle_save_errors.inc();
                error!(
                    error = %e,
                    start_minute = candle.start_minute.timestamp(),
                    "saving candle failed, candle dropped",
                );
            }
        }
    }
}

/// Tails a file into the extractor: read to EOF, then poll for growth.
async fn tail_file(
    source: &SourceConfig,
    mut extractor: LineExtractor,
    cancel: CancellationToken,
) -> Result<()> {
    let mut file = tokio::fs::File::open(&source.path)
        .await
        .with_context(|| format!("opening log source {}", source.path.display()))?;

    if !source.from_start {
        file.seek(SeekFrom::End(0))
            .await
            .context("seeking to end of log source")?;
    }

    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = file.read(&mut chunk) => read.context("reading log source")?,
        };

        if n == 0 {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(source.poll_interval) => continue,
            }
        }

        if extractor.write(&chunk[..n]).await.is_err() {
            // Consumer gone; nothing left to feed.
            return Ok(());
        }
    }
}
