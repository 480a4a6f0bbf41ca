use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for ingestion and store health.
///
/// All metrics use the "logcandle" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total log lines received from the source.
    pub lines_received: Counter,
    /// Total lines parsed into records.
    pub records_parsed: Counter,
    /// Total lines that did not parse.
    pub parse_errors: Counter,
    /// Total records rejected for arriving out of order.
    pub records_rejected: Counter,
    /// Total candles persisted.
    pub candles_saved: Counter,
    /// Total candle save failures (candle dropped, at-most-once).
    pub candle_save_errors: Counter,
    /// Records buffered for the in-flight minute.
    pub pending_records: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let lines_received = Counter::with_opts(
            Opts::new("lines_received_total", "Total log lines received from the source.")
                .namespace("logcandle"),
        )?;
        let records_parsed = Counter::with_opts(
            Opts::new("records_parsed_total", "Total lines parsed into records.")
                .namespace("logcandle"),
        )?;
        let parse_errors = Counter::with_opts(
            Opts::new("parse_errors_total", "Total lines that did not parse.")
                .namespace("logcandle"),
        )?;
        let records_rejected = Counter::with_opts(
            Opts::new(
                "records_rejected_total",
                "Total records rejected for arriving out of order.",
            )
            .namespace("logcandle"),
        )?;
        let candles_saved = Counter::with_opts(
            Opts::new("candles_saved_total", "Total candles persisted.").namespace("logcandle"),
        )?;
        let candle_save_errors = Counter::with_opts(
            Opts::new("candle_save_errors_total", "Total candle save failures.")
                .namespace("logcandle"),
        )?;
        let pending_records = Gauge::with_opts(
            Opts::new(
                "pending_records",
                "Records buffered for the in-flight minute.",
            )
            .namespace("logcandle"),
        )?;

        registry.register(Box::new(lines_received.clone()))?;
        registry.register(Box::new(records_parsed.clone()))?;
        registry.register(Box::new(parse_errors.clone()))?;
        registry.register(Box::new(records_rejected.clone()))?;
        registry.register(Box::new(candles_saved.clone()))?;
        registry.register(Box::new(candle_save_errors.clone()))?;
        registry.register(Box::new(pending_records.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            lines_received,
            records_parsed,
            parse_errors,
            records_rejected,
            candles_saved,
            candle_save_errors,
            pending_records,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
