use std::sync::Arc;

use serde_json::json;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use hermes_core::config::ConfigBuilder;
use hermes_devices::directory::InMemoryDirectory;
use hermes_devices::HttpRelay;
use hermes_gateway::{CommandSession, Crawler};

/// Usage: discover_device <address> <port> <extension>
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize the logger
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = args.next().unwrap_or_else(|| "80".to_string());
    let extension = args.next().unwrap_or_else(|| "/api".to_string());

    let config = ConfigBuilder::new()
        .with_config_file("hermes.toml")
        .with_environment_prefix("hermes")
        .build()?;
    let relay = Arc::new(HttpRelay::new(&config.relay)?);
    let directory = InMemoryDirectory::shared();

    // Enumerate the device and print progress the way a client would see it
    let crawler = Crawler::new(relay.clone(), directory.clone(), config.discovery.clone());
    let mut handle = crawler.start(&json!({
        "address": address,
        "port": port,
        "extension": extension,
    }));
    while let Some(event) = handle.events.recv().await {
        println!("{}", event.to_client_message());
    }
    let outcome = handle.task.await?;
    info!("Crawl finished: {:?}", outcome);

    // Query the device root through a command session
    let session = CommandSession::new(directory.clone(), relay);
    if let hermes_gateway::CrawlOutcome::Succeeded { device_id } = outcome {
        let request = json!({"cmd_type": "INFO", "dev_id": device_id, "periph_id": 0, "param_id": 0});
        println!("{}", session.handle(&request).await);
    }

    info!(
        "Directory holds {} devices, {} peripherals, {} parameters",
        directory.device_count(),
        directory.peripheral_count(),
        directory.parameter_count()
    );

    Ok(())
}
