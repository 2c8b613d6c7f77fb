//! caddy-store
//!
//! Thin process entry point: initializes logging and the storage/
//! catalog/lock/progress handles described by `Config::from_env`, then
//! runs garbage collection once and exits. This crate's operations
//! (import, export, sync, gc) are library APIs; wiring them to a CLI
//! or RPC surface is left to the embedding application.

use caddy_store::gc::{GarbageCollector, GcOptions};
use caddy_store::{config::Config, Handles};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    let handles = Handles::init(config.clone()).await?;

    let schema_cache_dir = config.storage.schema_cache_dir();
    let gc = GarbageCollector::new(&handles.catalog, &schema_cache_dir);
    let options = GcOptions {
        purge_cutoff: chrono::Utc::now() - chrono::Duration::from_std(config.gc.min_purge_age)?,
        dry_run: false,
    };
    let report = gc.run(options).await?;
    tracing::info!(?report, "startup garbage collection complete");

    handles.shutdown().await;
    Ok(())
}
