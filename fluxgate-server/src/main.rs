use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fluxgate_server::{
    config::{Args, Command, LogFormat, ModelArgs, ServeArgs},
    router, worker, AppState, CloudinaryUploader, FluxWorkerFactory, Orchestrator, PoolConfig,
    WorkerPool,
};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    match args.command {
        Command::Build(model) => build(model).await,
        Command::Serve(serve) => serve_http(serve).await,
    }
}

/// `RUST_LOG` wins; otherwise everything at `info`.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init(),
    }
}

async fn build(args: ModelArgs) -> Result<()> {
    tracing::info!(model = %args.model, "caching model weights");
    tokio::task::spawn_blocking(move || worker::build(&args.model, args.cache_dir))
        .await
        .context("build task failed")??;
    Ok(())
}

async fn serve_http(args: ServeArgs) -> Result<()> {
    let credentials = args.upload.credentials()?;
    let uploader = Arc::new(CloudinaryUploader::with_base_url(
        credentials,
        args.upload.upload_base_url.clone(),
    ));

    let device_map = args.device_map();
    let factory = Arc::new(FluxWorkerFactory::new(
        args.model.model.clone(),
        device_map,
        args.model.cache_dir.clone(),
    ));
    let pool = Arc::new(WorkerPool::new(
        factory,
        PoolConfig {
            max_instances: args.max_instances,
            idle_timeout: args.idle_timeout,
        },
    ));

    if let Some(compile) = args.preload {
        pool.preload(compile)
            .await
            .context("failed to preload worker")?;
    }
    let reaper = Arc::clone(&pool).spawn_reaper(args.reap_interval);

    let state = Arc::new(AppState::new(
        pool,
        Orchestrator::new(uploader, args.scratch_dir),
        args.request_timeout,
    ));

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!(
        address = %listener.local_addr()?,
        model = %args.model.model,
        device = %device_map,
        max_instances = args.max_instances.get(),
        "fluxgate listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reaper.abort();
    tracing::info!("fluxgate stopped");
    Ok(())
}

/// Wait for a shutdown signal (`SIGINT` or `SIGTERM`)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
