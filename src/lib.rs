//! # caddy-store
//!
//! Content-addressed document storage, a relational metadata catalog,
//! pessimistic locking, directory import/export, garbage collection,
//! and WebDAV-backed remote synchronization for a multi-user document
//! annotation system.
//!
//! ## Architecture
//!
//! - [`blob_store`]: content-addressed, hash-sharded blob storage
//! - [`refcount`]: reference counting driving safe blob deletion
//! - [`catalog`]: the relational metadata catalog and its write orchestration
//! - [`stable_id`]: opaque, collision-checked identifier allocation
//! - [`lock_manager`]: TTL-based pessimistic locking keyed by stable id
//! - [`migrations`]: versioned schema migrations
//! - [`importer`]: directory/archive import with gold-standard detection
//! - [`exporter`]: directory export with filename transforms and grouping
//! - [`gc`]: seven-phase garbage collection
//! - [`remote`]: the WebDAV remote replica
//! - [`sync`]: bidirectional sync between catalog and remote replica
//! - [`progress`]: pub/sub progress reporting for long-running operations
//! - [`config`]: aggregate configuration
//! - [`error`]: the crate's error and result types

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blob_store;
pub mod catalog;
pub mod config;
pub mod error;
pub mod exporter;
pub mod gc;
pub mod importer;
pub mod lock_manager;
pub mod migrations;
pub mod progress;
pub mod refcount;
pub mod remote;
pub mod stable_id;
pub mod sync;

use std::sync::Arc;

use tracing::{info, instrument};

use blob_store::ShardedBlobStore;
use catalog::MetadataCatalog;
use config::Config;
use error::Result;
use lock_manager::LockManager;
use progress::ProgressBus;

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// The fully initialized set of shared handles a process needs to use
/// this crate: the blob store, metadata catalog, lock manager, and
/// progress bus, all wired to the same on-disk layout.
#[derive(Clone)]
pub struct Handles {
    /// Content-addressed blob storage.
    pub blobs: ShardedBlobStore,
    /// The relational metadata catalog.
    pub catalog: MetadataCatalog,
    /// Stable-id-keyed pessimistic lock manager.
    pub locks: Arc<LockManager>,
    /// Pub/sub hub for long-running operation progress.
    pub progress: Arc<ProgressBus>,
    /// The configuration these handles were built from.
    pub config: Config,
}

impl Handles {
    /// Open (creating on first run) every on-disk resource a `Config`
    /// describes: blob root, catalog database (migrated), and lock
    /// database.
    #[instrument(skip(config))]
    pub async fn init(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.storage.data_dir).await?;
        tokio::fs::create_dir_all(config.storage.tmp_dir()).await?;

        let blobs = ShardedBlobStore::open(config.storage.blob_root()).await?;
        let catalog = MetadataCatalog::open(&config.storage.catalog_db_path(), &config.catalog, blobs.clone()).await?;
        let locks = Arc::new(LockManager::open(&config.storage.locks_db_path(), config.lock.ttl).await?);
        let progress = Arc::new(ProgressBus::default());

        info!(data_dir = %config.storage.data_dir.display(), "caddy-store handles initialized");

        Ok(Self { blobs, catalog, locks, progress, config })
    }

    /// Release pooled resources. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.catalog.pool().close().await;
        self.locks.pool().close().await;
        info!("caddy-store handles shut down");
    }
}
