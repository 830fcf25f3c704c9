//! Registry server: one hosted registry plus any configured pull-through caches.

use std::net::SocketAddr;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::WrapErr;
use registry::config::RegistryConfig;
use registry::storage::RegistryStorage;
use registry::store::{MemoryStore, Store};
use registry::upstream::DockerClient;
use registry::{ProxiedSource, RegistryService, Source};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Utf8PathBuf,

    /// Listen address for the hosted registry, overriding the configuration.
    #[arg(long)]
    address: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = RegistryConfig::from_path(&args.config)
        .wrap_err_with(|| format!("loading {}", args.config))?;
    if let Some(address) = args.address {
        config.server.address = address;
        config.validate()?;
    }

    let storage = config
        .storage
        .driver
        .clone()
        .build()
        .await
        .wrap_err("building storage")?;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let capacity = config.id_cache.capacity;

    let mut servers = JoinSet::new();

    let hosted = RegistryService::with_id_cache(
        config.hosted.identity(),
        store.clone(),
        RegistryStorage::new(&storage, config.storage.bucket.clone()),
        Source::Hosted(config.hosted.source()),
        capacity,
    );
    let swept = hosted
        .sweep_uploads()
        .await
        .wrap_err("sweeping abandoned uploads")?;
    tracing::info!(swept, "removed abandoned uploads");
    serve(&mut servers, config.server.address, hosted).await?;

    for upstream in &config.upstream {
        let client = DockerClient::new(upstream.client())
            .wrap_err_with(|| format!("creating client for {}", upstream.name))?;
        let service = RegistryService::with_id_cache(
            upstream.identity(),
            store.clone(),
            RegistryStorage::new(&storage, config.storage.bucket.clone()),
            Source::Proxied(ProxiedSource::new(Arc::new(client), upstream.cache.clone())),
            capacity,
        );
        serve(&mut servers, upstream.address, service).await?;
    }

    while let Some(result) = servers.join_next().await {
        result
            .wrap_err("server task panicked")?
            .wrap_err("server failed")?;
    }

    Ok(())
}

async fn serve(
    servers: &mut JoinSet<std::io::Result<()>>,
    address: SocketAddr,
    service: RegistryService,
) -> eyre::Result<()> {
    let listener = TcpListener::bind(address)
        .await
        .wrap_err_with(|| format!("binding {address}"))?;

    tracing::info!(registry = %service.identity().name, %address, "listening");
    let app = registry::router(service);
    servers.spawn(async move { axum::serve(listener, app).await });
    Ok(())
}
