use axum::extract::MatchedPath;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::http::{governed, GovernorState, HttpServer};
use tollgate::ratelimit::{QuotaStore, RateGovernor};

#[derive(Parser, Debug)]
#[command(name = "tollgate")]
#[command(about = "Per-endpoint, per-client rate limited HTTP service")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the configured one
    #[arg(short, long)]
    addr: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.http_addr = addr;
    }

    let rl = &config.rate_limiting;
    for (endpoint, policy) in rl.policy_table().iter() {
        info!(
            endpoint,
            requests_per_minute = policy.requests_per_minute,
            burst_size = policy.burst_size,
            ttl_minutes = policy.ttl_minutes,
            "Rate limit policy"
        );
    }

    let store = Arc::new(QuotaStore::new(rl.policy_table()));
    let governor = RateGovernor::new(store);

    let shutdown = CancellationToken::new();
    let sweeper = governor.spawn_sweeper(rl.sweep_interval(), shutdown.clone());

    let state = GovernorState::new(governor)
        .with_key_source(rl.endpoint_key_source)
        .with_trusted_forwarded_headers(config.server.trust_forwarded_headers);
    let router = governed(routes(), state);

    let server = HttpServer::bind(config.server.http_addr, router).await?;
    info!("Listening on {}", server.local_addr()?);

    tokio::spawn(cancel_on_signal(shutdown.clone()));
    server
        .serve_with_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    // Covers a server that exits on its own
    shutdown.cancel();
    sweeper.await?;

    info!("Tollgate stopped");
    Ok(())
}

/// Route shapes of the package tracking API. Handlers only acknowledge the call.
fn routes() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/packages", get(accepted).post(accepted))
        .route("/api/v1/packages/search", get(accepted))
        .route(
            "/api/v1/packages/{id}",
            get(accepted).put(accepted).delete(accepted),
        )
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn accepted(path: MatchedPath) -> Json<Value> {
    Json(json!({ "success": true, "route": path.as_str() }))
}

/// Trip `shutdown` on Ctrl+C or SIGTERM.
///
/// The same token stops the HTTP server and the limiter sweeper, so neither
/// outlives the other.
async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let source = tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => "Ctrl+C",
            Err(e) => {
                warn!(error = %e, "Ctrl+C handler failed");
                "Ctrl+C handler failure"
            }
        },
        _ = terminate => "SIGTERM",
        _ = shutdown.cancelled() => return,
    };

    info!(signal = source, "Shutting down, stopping server and limiter sweeper");
    shutdown.cancel();
}
