use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use query_rewrite_service::{
    AppConfig, BackendKind, CompletionBackend, QueryRewriter, build_router,
    rewriter::DEFAULT_MAX_LATENCY_MS,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(?config.listen_addr, "initializing inference backend");

    let backend = build_backend(&config)?;
    let rewriter = Arc::new(QueryRewriter::new(backend, config.generation()));

    if config.warmup {
        match rewriter.rewrite("Hi", DEFAULT_MAX_LATENCY_MS).await {
            Ok(result) => {
                tracing::info!(elapsed_ms = result.elapsed_time, "warm-up rewrite complete")
            }
            Err(err) => tracing::warn!(%err, "warm-up rewrite failed"),
        }
    }

    let router = build_router(rewriter);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router).await?;

    Ok(())
}

fn build_backend(config: &AppConfig) -> anyhow::Result<Arc<dyn CompletionBackend>> {
    match config.backend {
        BackendKind::Remote => {
            let backend = query_rewrite_service::backend::remote::RemoteBackend::new(config)?;
            Ok(Arc::new(backend))
        }
        BackendKind::Local => build_local_backend(config),
    }
}

#[cfg(feature = "tch-backend")]
fn build_local_backend(config: &AppConfig) -> anyhow::Result<Arc<dyn CompletionBackend>> {
    let backend = query_rewrite_service::backend::local::LocalBackend::initialize(config)?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "tch-backend"))]
fn build_local_backend(_config: &AppConfig) -> anyhow::Result<Arc<dyn CompletionBackend>> {
    anyhow::bail!("BACKEND=local requires a build with the 'tch-backend' feature")
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
