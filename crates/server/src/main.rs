//! Peer-Bench: peer benchmarking service
//!
//! Usage:
//!   peer-bench serve --port 3001   - HTTP API with the refresh scheduler running
//!   peer-bench tick                - Run one scheduler tick and print its report
//!   peer-bench stats               - Print benchmark / queue statistics

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use engine::{
    catalog, AddressMetrics, BenchmarkError, JobPriority, JobStatus, RefreshScheduler, ScoreBreakdown,
    ScoreInputs, SchedulerConfig, SchedulerConfigUpdate, TickOutcome, TransactionSummary,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_DB_PATH: &str = "data/benchmarks.db";
const DEFAULT_JOB_LIMIT: u32 = 50;

#[derive(Parser)]
#[command(name = "peer-bench")]
#[command(about = "Peer-group percentile benchmarking with background refresh", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the HTTP API and the refresh scheduler
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
    /// Run a single scheduler tick (no web server)
    Tick,
    /// Print benchmark and job queue statistics
    Stats,
}

#[derive(Clone)]
struct AppState {
    scheduler: Arc<RefreshScheduler>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,persistence=debug,peer_bench=debug,sqlx=warn")
    } else {
        EnvFilter::new("info,engine=info,persistence=info,peer_bench=info,sqlx=warn")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Serve { host, port } => {
            cmd_serve(&host, port).await?;
        }
        Commands::Tick => {
            cmd_tick().await?;
        }
        Commands::Stats => {
            cmd_stats().await?;
        }
    }

    Ok(())
}

fn db_path() -> String {
    std::env::var("PEER_BENCH_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string())
}

/// Open the database and build the scheduler handle from the environment
async fn open_scheduler() -> anyhow::Result<(String, Arc<RefreshScheduler>)> {
    let db_path = db_path();
    let db = persistence::Database::new(&db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!("Database initialized: {}", db_path);

    let config = SchedulerConfig::from_env();
    let scheduler = RefreshScheduler::with_stored_inputs(db.pool_clone(), config)
        .map_err(|e| anyhow::anyhow!("Scheduler initialization failed: {}", e))?;

    Ok((db_path, Arc::new(scheduler)))
}

// ============================================================================
// Serve command - Axum web server
// ============================================================================

async fn cmd_serve(host: &str, port: u16) -> anyhow::Result<()> {
    info!("Peer-Bench v{} starting...", APP_VERSION);

    let (db_path, scheduler) = open_scheduler().await?;
    let config = scheduler.get_config();

    let scheduler_handle = tokio::spawn(Arc::clone(&scheduler).run());

    let state = AppState {
        scheduler: Arc::clone(&scheduler),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/benchmarks/:address", get(api_get_benchmark))
        .route("/benchmarks/:address/refresh", post(api_refresh_benchmark))
        .route("/scores", post(api_record_score))
        .route("/classify", post(api_classify))
        .route("/stats", get(api_stats))
        .route("/config", get(api_get_config).put(api_update_config))
        .route("/peer-groups", get(api_peer_groups))
        .route("/peer-groups/:id/snapshot", get(api_peer_group_snapshot))
        .route("/peer-groups/:id/refresh", post(api_refresh_peer_group))
        .route("/peer-groups/:id/recalc", post(api_recalc_peer_group))
        .route("/jobs", get(api_jobs))
        .route("/scheduler/tick", post(api_tick))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Peer-Bench v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health                      - Health check");
    println!("  GET  /api/benchmarks/:address         - Peer benchmark for an address");
    println!("  POST /api/benchmarks/:address/refresh - Schedule a refresh");
    println!("  POST /api/scores                      - Push a live score update");
    println!("  POST /api/classify                    - Classify metrics into a peer group");
    println!("  GET  /api/stats                       - Benchmark / queue statistics");
    println!("  GET  /api/config                      - Scheduler config");
    println!("  PUT  /api/config                      - Update scheduler config");
    println!("  GET  /api/peer-groups                 - Peer group catalog");
    println!("  GET  /api/peer-groups/:id/snapshot    - Active distribution snapshot");
    println!("  POST /api/peer-groups/:id/refresh     - Schedule a snapshot refresh");
    println!("  GET  /api/jobs                        - Recent jobs (?status=&limit=)");
    println!("  POST /api/scheduler/tick              - Run a tick now");
    println!("\n  Database: {}", db_path);
    println!(
        "  Tick every {}s, stale after {}s, batch {}",
        config.update_frequency_seconds, config.stale_threshold_seconds, config.batch_size
    );
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Ctrl+C received, shutting down...");
        })
        .await?;

    scheduler.cancel();
    let _ = scheduler_handle.await;

    Ok(())
}

// ============================================================================
// Tick / stats commands - CLI mode
// ============================================================================

async fn cmd_tick() -> anyhow::Result<()> {
    let (db_path, scheduler) = open_scheduler().await?;
    println!("\n=== Peer-Bench v{} ===", APP_VERSION);
    println!("Database: {}\n", db_path);

    match scheduler.tick().await? {
        TickOutcome::Ran(report) => {
            println!("  Reaped stuck jobs:      {}", report.reaped);
            println!("  Marked stale:           {}", report.marked_stale);
            println!("  Updates enqueued:       {}", report.updates_enqueued);
            println!("  Snapshot refreshes:     {}", report.snapshot_refreshes_enqueued);
            println!("  Jobs dequeued:          {}", report.dequeued);
            println!("  Executions:             {}", report.executions);
            println!(
                "  Completed / requeued / failed: {} / {} / {}",
                report.completed, report.requeued, report.failed
            );
            println!(
                "  Took {} ms",
                (report.finished_at - report.started_at).num_milliseconds()
            );
        }
        TickOutcome::Skipped => println!("  Tick skipped: another tick is in progress"),
    }

    Ok(())
}

async fn cmd_stats() -> anyhow::Result<()> {
    let (db_path, scheduler) = open_scheduler().await?;
    let stats = scheduler.get_stats().await?;

    println!("\n=== Peer-Bench v{} ===", APP_VERSION);
    println!("Database: {}\n", db_path);
    println!("  Benchmarks:          {}", stats.total_benchmarks);
    println!("  Stale:               {}", stats.stale_count);
    println!("  Pending jobs:        {}", stats.pending_jobs);
    println!("  Running jobs:        {}", stats.running_jobs);
    println!("  Failed jobs:         {}", stats.failed_jobs);
    println!("  Active peer groups:  {}", stats.active_peer_group_count);
    println!(
        "  Last update:         {}",
        stats
            .last_update_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );

    Ok(())
}

// ============================================================================
// API error mapping
// ============================================================================

struct ApiError(BenchmarkError);

impl From<BenchmarkError> for ApiError {
    fn from(e: BenchmarkError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BenchmarkError::Validation(_) | BenchmarkError::Configuration(_) => StatusCode::BAD_REQUEST,
            BenchmarkError::NotFound(_) => StatusCode::NOT_FOUND,
            BenchmarkError::TransientCompute(_) | BenchmarkError::Persistence(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        let body = Json(serde_json::json!({
            "success": false,
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

// ============================================================================
// API handlers
// ============================================================================

async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "peer-bench",
        "version": APP_VERSION,
    }))
}

async fn api_get_benchmark(State(state): State<AppState>, Path(address): Path<String>) -> ApiResult {
    let benchmark = state.scheduler.get_benchmark(&address).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "benchmark": benchmark,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshParams {
    priority: Option<String>,
    delay_ms: Option<u64>,
}

async fn api_refresh_benchmark(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(params): Query<RefreshParams>,
) -> ApiResult {
    let priority = match params.priority.as_deref() {
        None => JobPriority::High,
        Some(raw) => JobPriority::parse(raw)
            .ok_or_else(|| BenchmarkError::Validation(format!("unknown priority {raw}")))?,
    };
    let job_id = state
        .scheduler
        .schedule_update(&address, priority, params.delay_ms.unwrap_or(0))
        .await?;

    info!(address = %address, job_id, priority = priority.as_str(), "Refresh requested");
    Ok(Json(serde_json::json!({
        "success": true,
        "jobId": job_id,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScoreUpdateRequest {
    address: String,
    metrics: AddressMetrics,
    #[serde(default)]
    transactions: Vec<TransactionSummary>,
    score: f64,
    #[serde(default)]
    components: BTreeMap<String, f64>,
}

async fn api_record_score(State(state): State<AppState>, Json(request): Json<ScoreUpdateRequest>) -> ApiResult {
    let inputs = ScoreInputs {
        metrics: request.metrics,
        transactions: request.transactions,
        breakdown: ScoreBreakdown {
            score: request.score,
            components: request.components,
        },
    };
    let outcome = state
        .scheduler
        .record_score_update(&request.address, &inputs)
        .await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "update": outcome,
    })))
}

#[derive(Debug, Deserialize)]
struct ClassifyRequest {
    address: String,
    metrics: AddressMetrics,
    #[serde(default)]
    transactions: Option<Vec<TransactionSummary>>,
}

async fn api_classify(State(state): State<AppState>, Json(request): Json<ClassifyRequest>) -> ApiResult {
    let classification = state.scheduler.service().classify(
        &request.address,
        &request.metrics,
        request.transactions.as_deref(),
    )?;
    Ok(Json(serde_json::json!({
        "success": true,
        "classification": classification,
    })))
}

async fn api_stats(State(state): State<AppState>) -> ApiResult {
    let stats = state.scheduler.get_stats().await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "stats": stats,
    })))
}

async fn api_get_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": true,
        "config": state.scheduler.get_config(),
    }))
}

async fn api_update_config(
    State(state): State<AppState>,
    Json(update): Json<SchedulerConfigUpdate>,
) -> ApiResult {
    let config = state.scheduler.update_config(&update)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "config": config,
    })))
}

async fn api_peer_groups() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": true,
        "peerGroups": catalog().groups(),
    }))
}

async fn api_peer_group_snapshot(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    if catalog().get(&id).is_none() {
        return Err(BenchmarkError::NotFound(format!("peer group {id}")).into());
    }
    let snapshot = state
        .scheduler
        .service()
        .store()
        .get_latest_active_snapshot(&id)
        .await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "snapshot": snapshot,
    })))
}

async fn api_refresh_peer_group(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let job_id = state
        .scheduler
        .schedule_peer_group_refresh(&id, JobPriority::High)
        .await?;
    info!(peer_group = %id, job_id, "Peer group refresh requested");
    Ok(Json(serde_json::json!({
        "success": true,
        "jobId": job_id,
    })))
}

async fn api_recalc_peer_group(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let job_id = state
        .scheduler
        .schedule_percentile_recalc(&id, JobPriority::High)
        .await?;
    info!(peer_group = %id, job_id, "Percentile recalculation requested");
    Ok(Json(serde_json::json!({
        "success": true,
        "jobId": job_id,
    })))
}

#[derive(Debug, Deserialize)]
struct JobsParams {
    status: Option<String>,
    limit: Option<u32>,
}

async fn api_jobs(State(state): State<AppState>, Query(params): Query<JobsParams>) -> ApiResult {
    let status = match params.status.as_deref() {
        None => None,
        Some(raw) => Some(
            JobStatus::parse(raw)
                .ok_or_else(|| BenchmarkError::Validation(format!("unknown job status {raw}")))?,
        ),
    };
    let limit = params.limit.unwrap_or(DEFAULT_JOB_LIMIT).clamp(1, 500);
    let jobs = state.scheduler.list_jobs(status, limit).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "count": jobs.len(),
        "jobs": jobs,
    })))
}

async fn api_tick(State(state): State<AppState>) -> ApiResult {
    let outcome = state.scheduler.tick().await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "tick": outcome,
    })))
}
