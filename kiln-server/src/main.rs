use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hf_hub::api::tokio::Api;
use kiln_core::{
    CapabilityKind, DeviceMap, FluxVariant, ModelLoader, Normalizer, Orchestrator,
    PipelineRegistry, RemoteDelegate, SessionConfig,
};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod routes;

use routes::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about = "Kiln media generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Base image model
    #[arg(long, default_value = "black-forest-labs/FLUX.1-schnell")]
    model: String,

    /// Model that finishes the base model's latent in refined generation
    #[arg(long, default_value = "black-forest-labs/FLUX.1-dev")]
    refiner_model: String,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "PORT", default_value_t = 5000)]
    port: u16,

    /// Remote worker that serves delegated image and video generation
    #[arg(long, env = "KILN_WORKER_URL")]
    worker_url: Option<String>,

    /// Directory generated files are written to and served from
    #[arg(long, env = "KILN_OUTPUT_DIR", default_value = "outputs")]
    output_dir: PathBuf,

    /// Load the background remover on first use instead of at startup
    #[arg(long)]
    no_remover: bool,
}

fn variant(model: &str) -> Result<FluxVariant> {
    FluxVariant::from_name(model).with_context(|| format!("unsupported model: {model}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("kiln_server=info,kiln_core=info")),
        )
        .init();

    let args = Args::parse();

    let base = variant(&args.model)?;
    let refiner = variant(&args.refiner_model)?;
    let device_map = if args.cpu {
        DeviceMap::ForceCpu
    } else {
        DeviceMap::default()
    };
    let session = SessionConfig::resolve(device_map);

    let worker = args
        .worker_url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
        .map(RemoteDelegate::new)
        .transpose()
        .context("invalid worker url")?;

    let mut loader = ModelLoader::new(Api::new()?, base, refiner);
    let mut warm = vec![CapabilityKind::ImageBase];
    if !args.no_remover {
        warm.push(CapabilityKind::BackgroundRemover);
    }
    if let Some(worker) = &worker {
        info!(endpoint = worker.endpoint(), "delegating to remote worker");
        loader = loader.with_worker(worker.clone());
        warm.push(CapabilityKind::Video);
    }

    let registry = Arc::new(PipelineRegistry::new(session, Arc::new(loader)));
    registry
        .warm_up(&warm)
        .await
        .context("failed to load startup capabilities")?;

    let normalizer = Normalizer::new(&args.output_dir).with_context(|| {
        format!("cannot create output directory {}", args.output_dir.display())
    })?;
    let mut orchestrator = Orchestrator::new(registry, normalizer);
    if let Some(worker) = worker {
        orchestrator = orchestrator.with_remote(worker);
    }

    let app = routes::router(AppState::new(orchestrator));

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("cannot bind {bind_address}"))?;
    info!(address = %listener.local_addr()?, "server started");
    axum::serve(listener, app).await?;

    Ok(())
}
