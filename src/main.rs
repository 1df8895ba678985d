use std::sync::Arc;

use suivi::acquire::{HttpSpeechProvider, ProxyService};
use suivi::session::StreamRegistry;
use suivi::transcript::HttpSessionStore;
use suivi::Fabric;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = suivi::config::Config::from_env();
    tracing::info!(room = %config.room, "field transcription hub starting");

    let fabric = Fabric::new();
    let store = Arc::new(HttpSessionStore::new(&config));
    let provider = Arc::new(HttpSpeechProvider::new(&config));

    let registry = StreamRegistry::new(fabric.clone(), store, &config);
    let proxy = ProxyService::new(fabric.clone(), &config.room, provider);

    let registry_task = tokio::spawn(registry.run());
    let proxy_task = tokio::spawn(proxy.run());

    tracing::info!("hub active, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    registry_task.abort();
    proxy_task.abort();
    Ok(())
}
