use async_trait::async_trait;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use admin_nonce::config::{Config, StoreConfig, WakeConfig};
use admin_nonce::store::{MemoryNonceStore, NonceStore, UnlockFeed};
use admin_nonce::util::{SigDown, Telemetry};
use admin_nonce::{ChangeNotifier, PollingFeed, Wake, WalletAddress};

#[derive(Parser, Debug)]
#[command(name = "admin-nonce")]
#[command(about = "Inspect and maintain shared admin wallet nonces")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the nonce record of an address as JSON
    Inspect { address: WalletAddress },
    /// Unlock an address and set its next nonce, whoever holds the lock
    Release {
        address: WalletAddress,
        #[arg(long)]
        nonce: u64,
    },
    /// Log wake-ups from the configured unlock feed until SIGTERM or SIGINT
    Watch,
}

/// Stands in for a coordinator: only reports that the queue would be retried.
struct LogWake;

#[async_trait]
impl Wake for LogWake {
    async fn wake(&self) {
        tracing::info!("nonce lock released, dispatch would retry");
    }
}

type Backend = (Arc<dyn NonceStore>, Arc<dyn UnlockFeed>);

async fn open_store(config: &Config) -> Result<Backend, Box<dyn std::error::Error>> {
    match config.store() {
        StoreConfig::Memory => {
            tracing::warn!("using the in-memory nonce store; records are local to this process");
            let store = MemoryNonceStore::new();
            Ok((Arc::new(store.clone()), Arc::new(store)))
        }
        #[cfg(feature = "redis")]
        StoreConfig::Redis { url } => {
            let store = admin_nonce::store::RedisNonceStore::connect(url, config.network()).await?;
            Ok((Arc::new(store.clone()), Arc::new(store)))
        }
        #[cfg(not(feature = "redis"))]
        StoreConfig::Redis { .. } => {
            Err("redis store configured, but admin-nonce was built without the `redis` feature".into())
        }
    }
}

fn wake_feed(config: &Config, store_feed: Arc<dyn UnlockFeed>) -> Arc<dyn UnlockFeed> {
    match config.wake() {
        WakeConfig::Changes { .. } => store_feed,
        WakeConfig::Poll { interval_ms } => {
            Arc::new(PollingFeed::new(Duration::from_millis(interval_ms.get())))
        }
    }
}

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env variables
    dotenv().ok();

    let _telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let cli = CliArgs::parse();
    let config = Config::load_from_path(&cli.config)?;
    let (store, store_feed) = open_store(&config).await?;

    match cli.command {
        Command::Inspect { address } => {
            let record = store.get(&address).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Release { address, nonce } => {
            let previous = store.get(&address).await?;
            store.release(&address, nonce).await?;
            tracing::warn!(
                %address,
                nonce,
                previous_nonce = ?previous.as_ref().map(|record| record.nonce),
                was_locked = previous.is_some_and(|record| record.locked),
                "forced nonce release"
            );
        }
        Command::Watch => {
            let sig_down = SigDown::try_new()?;
            let notifier = ChangeNotifier::spawn(
                wake_feed(&config, store_feed),
                LogWake,
                config.wake().resubscribe_delay(),
                sig_down.child_token(),
            );
            tracing::info!(network = config.network(), "watching nonce unlocks");
            sig_down.recv().await;
            notifier.stopped().await;
        }
    }

    Ok(())
}
