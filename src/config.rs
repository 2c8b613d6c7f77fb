//! Aggregate configuration for the storage/sync engine.
//!
//! Follows the teacher's `database::Config` shape: one aggregate struct
//! of per-component sub-configs, each with a `Default` impl and an
//! `from_env` constructor reading documented environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Root configuration, aggregating every component's settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Where blobs, the catalog database, and scratch files live on disk.
    pub storage: StorageConfig,
    /// Connection-pool tuning for the metadata catalog database.
    pub catalog: CatalogConfig,
    /// Lock TTL and staleness behavior.
    pub lock: LockConfig,
    /// WebDAV remote replica endpoint.
    pub remote: Option<RemoteConfig>,
    /// Garbage collection defaults.
    pub gc: GcConfig,
    /// Directory-import policy (gold detection, collection assignment).
    pub importer: ImporterConfig,
}

impl Config {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset. `CADDY_DATA_DIR` is the only
    /// variable required for local-only operation; `CADDY_REMOTE_URL`
    /// (plus `_USER`/`_PASSWORD`) opts into sync.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("CADDY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        let remote = std::env::var("CADDY_REMOTE_URL").ok().map(|base_url| {
            RemoteConfig {
                base_url,
                username: std::env::var("CADDY_REMOTE_USER").unwrap_or_default(),
                password: std::env::var("CADDY_REMOTE_PASSWORD").unwrap_or_default(),
                remote_root: std::env::var("CADDY_REMOTE_ROOT")
                    .unwrap_or_else(|_| "/caddy".to_string()),
                ..RemoteConfig::default()
            }
        });

        Self {
            storage: StorageConfig {
                data_dir: data_dir.clone(),
                ..StorageConfig::default()
            },
            catalog: CatalogConfig::default(),
            lock: LockConfig::default(),
            remote,
            gc: GcConfig::default(),
            importer: ImporterConfig::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            catalog: CatalogConfig::default(),
            lock: LockConfig::default(),
            remote: None,
            gc: GcConfig::default(),
            importer: ImporterConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("caddy")
}

/// On-disk layout configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root data directory. Blobs live under `<data_dir>/files/`, the
    /// catalog under `<data_dir>/db/metadata.db`, locks under
    /// `<data_dir>/db/locks.db`, and scratch files under
    /// `<data_dir>/tmp/` and `<data_dir>/schema/cache/`.
    pub data_dir: PathBuf,
}

impl StorageConfig {
    /// Blob store root: `<data_dir>/files`.
    pub fn blob_root(&self) -> PathBuf {
        self.data_dir.join("files")
    }

    /// Metadata catalog database path.
    pub fn catalog_db_path(&self) -> PathBuf {
        self.data_dir.join("db").join("metadata.db")
    }

    /// Lock table database path.
    pub fn locks_db_path(&self) -> PathBuf {
        self.data_dir.join("db").join("locks.db")
    }

    /// Scratch directory used for temp files during remote metadata
    /// fetch and other transient operations.
    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }

    /// Schema/tmp cache directory cleared by GC phase 7.
    pub fn schema_cache_dir(&self) -> PathBuf {
        self.data_dir.join("schema").join("cache")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Metadata catalog connection-pool configuration.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// Minimum number of pooled connections.
    pub min_connections: u32,
    /// Maximum number of pooled connections.
    pub max_connections: u32,
    /// Enable WAL journaling (required by the design).
    pub enable_wal: bool,
    /// SQLite busy timeout.
    pub busy_timeout: Duration,
    /// Number of connection-open retries on transient "busy" errors.
    pub open_retries: u32,
    /// Base backoff between connection-open retries.
    pub open_retry_base_backoff: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            enable_wal: true,
            busy_timeout: Duration::from_millis(5000),
            open_retries: 5,
            open_retry_base_backoff: Duration::from_millis(50),
        }
    }
}

/// Lock manager configuration.
#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    /// How long a lock may go unrefreshed before it is considered stale
    /// and eligible for takeover.
    pub ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(90),
        }
    }
}

/// WebDAV remote replica configuration.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL of the WebDAV endpoint.
    pub base_url: String,
    /// Basic-auth username.
    pub username: String,
    /// Basic-auth password.
    pub password: String,
    /// Root path on the remote under which the shared metadata
    /// database, version file, lock file, and sharded blobs live.
    pub remote_root: String,
    /// Maximum time to wait while acquiring the remote advisory lock.
    pub lock_acquire_timeout: Duration,
    /// Age after which an unreleased remote lock is considered stale.
    pub lock_staleness: Duration,
    /// Poll interval while waiting to acquire the remote lock.
    pub lock_poll_interval: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: String::new(),
            password: String::new(),
            remote_root: "/caddy".to_string(),
            lock_acquire_timeout: Duration::from_secs(300),
            lock_staleness: Duration::from_secs(60),
            lock_poll_interval: Duration::from_secs(2),
        }
    }
}

/// Garbage collection defaults.
#[derive(Debug, Clone, Copy)]
pub struct GcConfig {
    /// Minimum age a soft-deleted row must reach before a non-admin
    /// caller may purge it. The core exposes this as a parameter; policy
    /// enforcement of "who is an admin" is left to the caller.
    pub min_purge_age: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            min_purge_age: Duration::from_secs(24 * 3600),
        }
    }
}

/// Policy for directory/archive import: which subdirectories are
/// organizational rather than collection names, and how gold-standard
/// status is detected among the three configurable heuristics.
#[derive(Debug, Clone)]
pub struct ImporterConfig {
    /// Subdirectory names (case-insensitive) skipped when walking up a
    /// file's path looking for a collection name.
    pub skip_collection_dirs: std::collections::HashSet<String>,
    /// Directory name (case-insensitive) that marks its contents gold.
    pub gold_dir_name: String,
    /// Optional filename regex; a match marks the file gold.
    pub gold_filename_regex: Option<String>,
    /// Whether the "no `.vN.` version marker in the filename" heuristic
    /// participates in gold detection.
    pub use_no_version_marker_heuristic: bool,
    /// Don't write to storage or the catalog; only report what would
    /// happen.
    pub dry_run: bool,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            skip_collection_dirs: ["pdf", "tei", "xml", "versions", "data"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            gold_dir_name: "tei".to_string(),
            gold_filename_regex: None,
            use_no_version_marker_heuristic: true,
            dry_run: false,
        }
    }
}
