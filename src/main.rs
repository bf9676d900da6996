mod auth;
mod config;
mod gate;
mod handlers;
mod load_balancer;
mod metrics;
mod rate_limit;
mod state;

use anyhow::Context;
use axum::{Router, middleware::from_fn_with_state, routing::get};
use clap::Parser;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::auth::ApiKeyRegistry;
use crate::config::Args;
use crate::gate::{GateState, gatekeeper};
use crate::handlers::{health_handler, metrics_handler, proxy_handler};
use crate::load_balancer::{LoadBalancer, health_checker};
use crate::rate_limit::RateLimiter;
use crate::state::AppState;

fn build_router(state: AppState) -> Router {
    let health_path = state.gate.health_path.to_string();

    Router::new()
        .route(&health_path, get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(from_fn_with_state(state.gate.clone(), gatekeeper))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "api_gatekeeper=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let registry = ApiKeyRegistry::parse(&args.api_keys).context("invalid --api-keys")?;
    let settings = args.limiter_settings()?;
    let health_interval = args.health_check_interval()?;
    let health_path: Arc<str> = Arc::from(args.validated_health_path()?);
    let load_balancer = Arc::new(LoadBalancer::new(&args.backends)?);
    let client = reqwest::Client::new();

    let rate_limiter = Arc::new(RateLimiter::start(settings));

    // spawn the upstream health checker
    let checker = tokio::spawn(health_checker(
        Arc::clone(&load_balancer),
        client.clone(),
        health_interval,
        Arc::from(args.backend_health_path.as_str()),
    ));

    let state = AppState {
        client,
        load_balancer,
        gate: GateState {
            registry: Arc::new(registry),
            rate_limiter: Arc::clone(&rate_limiter),
            health_path,
        },
        max_body_bytes: args.max_body_bytes,
    };

    tracing::info!(clients = state.gate.registry.len(), "Loaded API key registry");
    tracing::info!(
        "Rate limit: {} requests per {:?} per client",
        rate_limiter.settings().max_per_window,
        rate_limiter.settings().window
    );

    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Gatekeeper listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    checker.abort();
    rate_limiter.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
