// sensor-rollup scheduler - Periodic rollup runner
//
// Licensed under AGPL-3.0. See LICENSE file for details.

//! # Rollup Scheduler
//!
//! Loads raw samples from CSV, runs one rollup tick per period on a fixed
//! interval and serves Prometheus metrics plus the rollup history over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! # Roll up a dataset once and print the reports
//! rollup-scheduler --csv samples.csv --once
//!
//! # Tick every 30 seconds, serve on a custom port
//! rollup-scheduler --csv samples.csv --tick-secs 30 --port 9090
//! ```

mod ingest;
mod metrics;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use clap::Parser;
use sensor_rollup::{
    boundary_datetime, MemoryStore, PeriodType, RollupConfig, RollupEngine, RollupError,
    RunReport, SensorId, SeriesPoint, SeriesQuery, Timestamp,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use ingest::{load_csv, DatasetInfo};
use metrics::encode_metrics;

/// Sensor rollup scheduler
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "9100")]
    port: u16,

    /// CSV file with raw samples (sensor_id,container_id,measuring_at,value)
    #[arg(short, long)]
    csv: Option<PathBuf>,

    /// Seconds between two ticks of the same period
    #[arg(short, long, default_value = "60")]
    tick_secs: u64,

    /// Run every period once, print the reports as JSON and exit
    #[arg(long)]
    once: bool,

    /// Periods to roll up, in minutes (default: 30, 60, 360, 720, 1440)
    #[arg(long = "period")]
    periods: Vec<i64>,

    /// Sensors processed concurrently per tick
    #[arg(long, default_value = "8")]
    concurrency: usize,

    /// Upper bound on each store call, in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Maximum windows closed per sensor per tick
    #[arg(long)]
    max_catch_up: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn rollup_config(&self) -> Result<RollupConfig, RollupError> {
        let mut config = RollupConfig {
            max_concurrency: self.concurrency,
            store_timeout: Duration::from_millis(self.timeout_ms),
            max_catch_up_buckets: self.max_catch_up,
            ..Default::default()
        };
        if !self.periods.is_empty() {
            config.periods = self
                .periods
                .iter()
                .map(|m| PeriodType::try_from(*m))
                .collect::<Result<_, _>>()?;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Outcome of the last tick of one period.
#[derive(Debug, Clone, Serialize)]
struct TickStatus {
    period: PeriodType,
    finished_at_secs: u64,
    duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<RunReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl TickStatus {
    fn new(period: PeriodType, result: &Result<RunReport, RollupError>, elapsed: Duration) -> Self {
        let finished_at_secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            period,
            finished_at_secs,
            duration_ms: elapsed.as_millis() as u64,
            report: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(|e| e.to_string()),
        }
    }
}

/// Application state shared across handlers and tick loops.
struct AppState {
    engine: RollupEngine<MemoryStore>,
    query: SeriesQuery<MemoryStore>,
    dataset: Option<DatasetInfo>,
    ticks: RwLock<BTreeMap<PeriodType, TickStatus>>,
    start_time: Instant,
}

impl AppState {
    /// Run one tick and publish its outcome.
    async fn tick(&self, period: PeriodType, shutdown: watch::Receiver<bool>) -> TickStatus {
        let started = Instant::now();
        let result = self.engine.run_rollup_with_shutdown(period, shutdown).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(report) => {
                metrics::record_report(report, elapsed);
                if !report.failed.is_empty() {
                    warn!(
                        "period {}: sensors {:?} will be retried next tick",
                        period,
                        report.failed_ids()
                    );
                }
            }
            Err(e) => {
                error!("period {}: tick failed: {}", period, e);
                metrics::record_fatal(period, e.kind(), elapsed);
            }
        }

        let status = TickStatus::new(period, &result, elapsed);
        self.ticks.write().await.insert(period, status.clone());
        status
    }
}

/// Tick `period` every `every` until shutdown.
async fn tick_loop(
    state: Arc<AppState>,
    period: PeriodType,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }
        state.tick(period, shutdown.clone()).await;
    }
    info!("period {}: tick loop stopped", period);
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Rollup scheduler v{}", env!("CARGO_PKG_VERSION"));

    let config = match args.rollup_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let store = Arc::new(MemoryStore::new());
    let dataset = match &args.csv {
        Some(path) => match load_csv(path, &store) {
            Ok(info) => {
                metrics::set_samples_loaded(info.sample_count);
                Some(info)
            }
            Err(e) => {
                error!("Failed to load dataset: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => {
            info!("No dataset specified, starting with an empty store");
            None
        }
    };

    let periods = config.ordered_periods();
    let engine = match RollupEngine::with_config(Arc::clone(&store), config) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let state = Arc::new(AppState {
        engine,
        query: SeriesQuery::new(store),
        dataset,
        ticks: RwLock::new(BTreeMap::new()),
        start_time: Instant::now(),
    });

    if args.once {
        return run_once(&state, &periods).await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown requested, letting running sensors finish");
        shutdown_tx.send_replace(true);
    });

    let every = Duration::from_secs(args.tick_secs.max(1));
    let mut loops = Vec::new();
    for period in periods {
        loops.push(tokio::spawn(tick_loop(
            Arc::clone(&state),
            period,
            every,
            shutdown_rx.clone(),
        )));
    }

    // Build router
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/sensors/:id/latest", get(latest_handler))
        .route("/sensors/:id/history/:period", get(history_handler))
        .with_state(Arc::clone(&state));

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Starting server on http://{}", addr);
    info!("Metrics endpoint: http://{}/metrics", addr);

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };
    let mut server_shutdown = shutdown_rx.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                let stop = *server_shutdown.borrow_and_update();
                if stop || server_shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
    if let Err(e) = served {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    for handle in loops {
        if let Err(e) = handle.await {
            warn!("Tick loop ended abnormally: {}", e);
        }
    }
    ExitCode::SUCCESS
}

/// Run every period once in ascending order and print the statuses.
async fn run_once(state: &AppState, periods: &[PeriodType]) -> ExitCode {
    let (_keep_open, shutdown) = watch::channel(false);
    let mut statuses = Vec::new();
    for period in periods {
        statuses.push(state.tick(*period, shutdown.clone()).await);
    }

    match serde_json::to_string_pretty(&statuses) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize reports: {}", e),
    }
    info!("{}", state.engine.metrics().report());

    if statuses.iter().any(|s| s.error.is_some()) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Maps library errors to HTTP status codes.
struct ApiError(RollupError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            RollupError::InvalidPeriod(_) => StatusCode::BAD_REQUEST,
            RollupError::SensorNotFound(_) => StatusCode::NOT_FOUND,
            RollupError::StoreUnavailable(_) | RollupError::Timeout { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RollupError> for ApiError {
    fn from(e: RollupError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), self.0.to_string()).into_response()
    }
}

/// Metrics handler - returns Prometheus text format.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = encode_metrics();
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Status information response.
#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_secs: u64,
    failure_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    dataset: Option<DatasetInfo>,
    ticks: Vec<TickStatus>,
}

/// Status handler - returns JSON status information.
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let ticks = state.ticks.read().await.values().cloned().collect();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        failure_rate: state.engine.metrics().failure_rate(),
        dataset: state.dataset.clone(),
        ticks,
    })
}

/// A point with its boundary rendered as RFC 3339.
#[derive(Serialize)]
struct PointResponse {
    measuring_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    time: Option<String>,
    value: String,
}

impl From<SeriesPoint> for PointResponse {
    fn from(point: SeriesPoint) -> Self {
        Self {
            measuring_at: point.measuring_at,
            time: boundary_datetime(point.measuring_at).map(|t| t.to_rfc3339()),
            value: point.value.to_string(),
        }
    }
}

/// Latest raw value of a sensor.
async fn latest_handler(
    State(state): State<Arc<AppState>>,
    Path(sensor_id): Path<SensorId>,
) -> Result<Json<PointResponse>, ApiError> {
    state
        .query
        .latest_value(sensor_id, None)
        .await?
        .map(|p| Json(p.into()))
        .ok_or(ApiError(RollupError::SensorNotFound(sensor_id)))
}

/// Stored rollups of a sensor for one period.
async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path((sensor_id, minutes)): Path<(SensorId, i64)>,
) -> Result<Json<Vec<PointResponse>>, ApiError> {
    let period = PeriodType::try_from(minutes)?;
    let points = state.query.history(sensor_id, period, None, None).await?;
    Ok(Json(points.into_iter().map(PointResponse::from).collect()))
}
