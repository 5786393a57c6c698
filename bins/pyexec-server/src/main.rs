mod error;
mod guard;
mod handlers;
mod metrics;
mod queue;
mod routes;
mod store;
mod worker;

#[cfg(test)]
mod api_tests;

use anyhow::Context;
use axum::Router;
use guard::AbuseGuard;
use pyexec_common::config::{AbuseStoreBackend, ExecutorConfig};
use pyexec_engine::{BatchRunner, DockerSandbox, LocalSandbox, Sandbox};
use queue::JobQueue;
use std::net::SocketAddr;
use std::sync::Arc;
use store::{MemoryStateStore, RedisStateStore, StateStore};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use worker::{WorkerContext, WorkerPool};

pub struct AppState {
    pub queue: Arc<dyn JobQueue>,
    pub guard: Arc<AbuseGuard>,
    pub runner: Arc<BatchRunner>,
    pub allowed_modules: Vec<String>,
    pub trust_proxy: bool,
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new().merge(routes::routes()).with_state(state)
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_line_number(true)
            .init();
    }
}

/// Docker first; the local subprocess path only when explicitly enabled
fn build_runner(config: &ExecutorConfig) -> anyhow::Result<BatchRunner> {
    let local = || -> Arc<dyn Sandbox> {
        Arc::new(LocalSandbox::new(config.python_bin.clone(), config.limits.clone()))
    };

    match DockerSandbox::connect(&config.docker_socket_path, config.limits.clone()) {
        Ok(docker) => {
            info!(
                socket = %config.docker_socket_path,
                image = %config.limits.image,
                local_fallback = config.enable_local_fallback,
                "Docker sandbox configured"
            );
            let fallback = config.enable_local_fallback.then(local);
            Ok(BatchRunner::new(Arc::new(docker), fallback, config.limits.default_timeout))
        }
        Err(e) if config.enable_local_fallback => {
            warn!(error = %e, "Docker client unavailable, running submissions as local subprocesses");
            Ok(BatchRunner::new(local(), None, config.limits.default_timeout))
        }
        Err(e) => Err(e.context("Docker sandbox unavailable and local fallback disabled")),
    }
}

async fn connect_store(config: &ExecutorConfig) -> Arc<dyn StateStore> {
    match config.abuse_store {
        AbuseStoreBackend::Memory => Arc::new(MemoryStateStore::new()),
        AbuseStoreBackend::Redis => match RedisStateStore::connect(&config.redis_url).await {
            Ok(store) => {
                info!(redis_url = %config.redis_url, "Abuse state shared through Redis");
                Arc::new(store)
            }
            Err(e) => {
                warn!(error = %e, "Redis unreachable, abuse state kept in process");
                Arc::new(MemoryStateStore::new())
            }
        },
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    warn!("Received shutdown signal, draining in-flight jobs...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Python execution service booting...");

    let config = ExecutorConfig::from_env().context("Invalid executor configuration")?;

    if let Err(e) = metrics::register() {
        warn!(error = %e, "Failed to register metrics");
    }

    let runner = Arc::new(build_runner(&config)?);
    let queue = queue::connect_queue(&config).await?;
    let guard = Arc::new(AbuseGuard::new(connect_store(&config).await, config.abuse.clone()));

    let pool = WorkerPool::start(
        config.max_concurrency,
        WorkerContext {
            queue: queue.clone(),
            runner: runner.clone(),
            guard: guard.clone(),
        },
    );

    let state = Arc::new(AppState {
        queue,
        guard,
        runner,
        allowed_modules: config.limits.allowed_modules.clone(),
        trust_proxy: config.trust_proxy,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(%addr, "HTTP server listening");

    axum::serve(listener, app(state).into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    pool.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
