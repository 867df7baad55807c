use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use cozylife_local::catalog::{EmptyCatalog, FileCatalog, ProductCatalog};
use cozylife_local::client::DeviceClient;
use cozylife_local::config::Config;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let catalog: Arc<dyn ProductCatalog> = match &config.catalog_file {
        Some(path) => match FileCatalog::load(path) {
            Ok(catalog) => {
                info!("Loaded product catalog from {} ({} products)", path, catalog.len());
                Arc::new(catalog)
            }
            Err(e) => {
                error!("Catalog error: {}", e);
                std::process::exit(1);
            }
        },
        None => Arc::new(EmptyCatalog),
    };

    info!("Starting cozylife-local (devices={})", config.devices.len());

    // Each client manages its own connection and reconnection; nothing to
    // join here.
    let mut clients = Vec::new();
    for device in &config.devices {
        info!("  Device: {} at {}", device.display_name(), device.ip);
        clients.push((
            device.display_name(),
            DeviceClient::new(device.ip, Arc::clone(&catalog)),
        ));
    }
    let clients = Arc::new(clients);

    // Periodic status log: identity plus the cached state snapshot.
    let status_clients = Arc::clone(&clients);
    let interval = Duration::from_secs(config.status_interval_secs);
    let status_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; handshakes are still in flight.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for (name, client) in status_clients.iter() {
                match client.identity() {
                    Some(identity) => info!(
                        "{}: {} ({}) state={:?}",
                        name,
                        identity.model_name,
                        identity.device_id,
                        client.query(),
                    ),
                    None => info!("{}: waiting for handshake", name),
                }
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        _ = async {
            let mut sigterm = tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate()
            ).expect("Failed to register SIGTERM handler");
            sigterm.recv().await;
        } => {
            info!("Received SIGTERM, shutting down");
        }
    }

    status_task.abort();
    for (_, client) in clients.iter() {
        client.close().await;
    }
    info!("cozylife-local stopped");
}
