use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{ensure, Context, Result};
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use beach_pier_core::{Engine, LivenessConfig};
use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

mod probe;
mod telemetry;
mod ws;

#[derive(Debug, Parser)]
#[command(
    name = "beach-pier",
    author,
    version,
    about = "Beach Pier matchmaking and signaling relay server"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

impl Cli {
    /// Splits the command line into server settings or a probe run.
    fn into_serve(self) -> std::result::Result<ServeArgs, probe::ProbeArgs> {
        match self.command {
            Some(Command::Probe(args)) => Err(args),
            None => Ok(self.serve),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect to a running pier as a throwaway participant and print what happens
    Probe(probe::ProbeArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "BEACH_PIER_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    listen_addr: String,

    /// Seconds between liveness sweeps.
    #[arg(long, env = "BEACH_PIER_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    sweep_interval_secs: u64,

    /// Heartbeat age in seconds after which a session is evicted; 0 relies on transport closure only.
    #[arg(long, env = "BEACH_PIER_STALE_THRESHOLD_SECS", default_value_t = 120)]
    stale_threshold_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_PIER_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
struct ServerConfig {
    listen_addr: SocketAddr,
    liveness: LivenessConfig,
    shutdown_grace: Duration,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        ensure!(
            args.sweep_interval_secs > 0,
            "sweep interval must be at least one second"
        );
        let stale_after =
            (args.stale_threshold_secs > 0).then(|| Duration::from_secs(args.stale_threshold_secs));
        Ok(ServerConfig {
            listen_addr,
            liveness: LivenessConfig {
                sweep_interval: Duration::from_secs(args.sweep_interval_secs),
                stale_after,
            },
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

pub(crate) struct AppState {
    pub(crate) engine: Engine,
    metrics: PrometheusHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::Telemetry::init()?;

    let serve = match Cli::parse().into_serve() {
        Ok(serve) => serve,
        Err(args) => return probe::run(args).await,
    };

    let config = ServerConfig::try_from(serve)?;
    info!(
        listen_addr = %config.listen_addr,
        sweep_interval_secs = config.liveness.sweep_interval.as_secs(),
        stale_threshold_secs = config.liveness.stale_after.map(|d| d.as_secs()),
        "starting beach-pier server"
    );

    let metrics = telemetry::install_metrics_recorder()?;
    run(config, metrics).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let engine = Engine::new();
    let monitor = engine.spawn_liveness_monitor(config.liveness.clone());
    let state = Arc::new(AppState { engine, metrics });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-pier listening on {}", config.listen_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    monitor.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[cfg(test)]
pub(crate) fn test_state() -> Arc<AppState> {
    let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
    Arc::new(AppState {
        engine: Engine::new(),
        metrics: recorder.handle(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serve_args(listen_addr: &str, stale_threshold_secs: u64) -> ServeArgs {
        ServeArgs {
            listen_addr: listen_addr.to_string(),
            sweep_interval_secs: 30,
            stale_threshold_secs,
            shutdown_grace_secs: 2,
        }
    }

    #[test_timeout::timeout]
    fn config_keeps_the_sweep_to_threshold_ratio() {
        let config = ServerConfig::try_from(serve_args("127.0.0.1:3000", 120)).unwrap();
        assert_eq!(config.liveness.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.liveness.stale_after, Some(Duration::from_secs(120)));
    }

    #[test_timeout::timeout]
    fn zero_threshold_disables_staleness() {
        let config = ServerConfig::try_from(serve_args("127.0.0.1:3000", 0)).unwrap();
        assert_eq!(config.liveness.stale_after, None);
    }

    #[test_timeout::timeout]
    fn bad_listen_address_is_reported() {
        let err = ServerConfig::try_from(serve_args("not-an-addr", 120)).unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));
    }

    #[test_timeout::timeout]
    fn cli_defaults_to_serving() {
        let cli = Cli::try_parse_from(["beach-pier"]).unwrap();
        assert!(cli.command.is_none());
        let serve = cli.into_serve().unwrap();
        assert_eq!(serve.sweep_interval_secs, 30);

        // probe runs never reach the server path, which owns the metrics recorder
        let cli = Cli::try_parse_from(["beach-pier", "probe", "--duration-secs", "5"]).unwrap();
        assert!(cli.into_serve().is_err());
    }
}
