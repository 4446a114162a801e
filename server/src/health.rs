use std::net::SocketAddr;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use ironhold_common::shutdown::shutdown_signal;
use tokio::net::TcpStream;

use crate::args::HealthArgs;

#[derive(Clone)]
struct HealthState {
    grpc_target: String,
}

/// A standalone HTTP health endpoint that proxies a liveness check to the
/// gRPC port, for orchestrators that only speak HTTP probes (same shape as
/// `storage/src/health.rs`, minus the RPC round-trip since this service has
/// no dedicated health-check RPC — a TCP connect is a sufficient liveness
/// signal for a single-process server).
pub async fn run_health(args: HealthArgs) -> Result<()> {
    let http_addr: SocketAddr = format!("0.0.0.0:{}", args.http_port).parse()?;
    let state = HealthState { grpc_target: args.grpc_target.clone() };

    tracing::info!(%http_addr, grpc_target = %args.grpc_target, "starting health check HTTP server");

    let app = Router::new()
        .route("/", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/readyz", get(health_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    ironhold_common::signal_ready();
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    tracing::info!("health check server stopped gracefully");
    Ok(())
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match grpc_reachable(&state.grpc_target).await {
        true => StatusCode::OK,
        false => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn grpc_reachable(grpc_target: &str) -> bool {
    let Some(authority) = grpc_target.split("://").nth(1) else {
        return false;
    };
    TcpStream::connect(authority).await.is_ok()
}
