#![forbid(unsafe_code)]

//! HTTP server exposing the `/videos` API.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use newtube_api::{
    api::{AppState, router},
    config::{DEFAULT_CONFIG_PATH, load_settings_from},
    media::CloudinaryUploader,
    store::VideoStore,
};
use tokio::signal;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "newtube_api=info,backend=info,tower_http=info";

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the NewTube video API.")]
struct Args {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the config file")]
    config: PathBuf,
    #[arg(long = "host", value_name = "ADDR", help = "Override the bind address")]
    host: Option<String>,
    #[arg(long = "port", value_name = "PORT", help = "Override the listen port")]
    port: Option<u16>,
    #[arg(long = "database", value_name = "PATH", help = "Override the SQLite database path")]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = Args::parse();
    let mut settings = load_settings_from(&args.config)?;
    if let Some(host) = args.host {
        settings.api_host = host;
    }
    if let Some(port) = args.port {
        settings.api_port = port;
    }
    if let Some(database) = args.database {
        settings.database_path = database;
    }

    let store = VideoStore::open(&settings.database_path).context("initializing video store")?;
    std::fs::create_dir_all(&settings.spool_dir).with_context(|| {
        format!("creating spool directory {}", settings.spool_dir.display())
    })?;
    let uploader = CloudinaryUploader::new(settings.cloudinary.clone());

    let state = AppState::new(store, Arc::new(uploader), settings.spool_dir.clone());
    let app = router(state, settings.max_upload_bytes);

    let addr = SocketAddr::new(
        settings
            .api_host
            .parse()
            .with_context(|| format!("parsing bind address {}", settings.api_host))?,
        settings.api_port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    tracing::info!(
        %addr,
        database = %settings.database_path.display(),
        "API server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    tracing::info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install Ctrl+C handler");
    }
}
