use anyhow::Context;
use clap::Parser;
use shardkv::config::{CliArgs, Config, Role};
use shardkv::replication::client::ReplClient;
use shardkv::replication::master::ReplMaster;
use shardkv::server::listener;
use shardkv::storage::expiry::ExpirySweeper;
use shardkv::storage::partitioner::Partitioner;
use shardkv::storage::persister::Persister;
use shardkv::storage::store::Store;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = CliArgs::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    // 1. Storage:
    let partitioner = Partitioner::new(config.parts, config.blocks_per_part);
    let store = Arc::new(Store::open(&config.dir, partitioner)?);
    store.load_all();

    // 2. Background maintenance:
    ExpirySweeper::new(store.clone(), config.expiry_scan_period()).start();
    let persister = Persister::new(store.clone(), config.persist_period());
    let persist_task = persister.clone().start();

    // 3. Replication:
    let mut repl_client = None;
    match config.role() {
        Role::Standalone => {}
        Role::Master(master_config) => {
            let repl_listener = TcpListener::bind(master_config.address)
                .await
                .with_context(|| format!("failed to bind replication address {}", master_config.address))?;
            ReplMaster::new(store.clone(), master_config.auth_secret, config.repl_sync_period())
                .start(repl_listener);
        }
        Role::Replica(client_config) => {
            let client = ReplClient::open(store.clone(), &config.dir, client_config)?;
            client.clone().start();
            client.clone().start_state_writer(config.repl_state_period());
            repl_client = Some(client);
        }
    }

    // 4. Client listener:
    let listener = TcpListener::bind(config.address)
        .await
        .with_context(|| format!("failed to bind {}", config.address))?;
    tracing::info!("Listening for clients on {}", config.address);
    tracing::info!("Press Ctrl+C to shutdown");

    let secret: Arc<str> = Arc::from(config.auth_secret.as_str());
    tokio::select! {
        _ = listener::serve(listener, store.clone(), secret) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        }
    }

    // 5. Shutdown flush:
    tracing::info!("Shutting down");
    persist_task.abort();
    let report = persister.flush().await;
    tracing::info!("Final persist wrote {} blocks ({} failed)", report.written, report.failed);
    if let Some(client) = repl_client
        && let Err(e) = client.write_state_if_changed()
    {
        tracing::error!("Failed to write repl state on shutdown: {}", e);
    }

    Ok(())
}
