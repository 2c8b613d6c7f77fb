//! Relational metadata catalog: the `files` table plus the orchestration
//! that keeps it consistent with [`crate::refcount::RefCounter`] and
//! [`crate::blob_store::ShardedBlobStore`] on every write.
//!
//! Grounded on the original's `FileRepository` (`file_repository.py`)
//! for the insert/update/delete control flow, and on the teacher's
//! `database::connection_pool::ConnectionPool` for pool setup, retry,
//! and WAL configuration.

pub mod entry;
pub mod maintenance;
mod queries;
pub mod sync_meta;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::blob_store::{FileType, ShardedBlobStore};
use crate::config::CatalogConfig;
use crate::error::{Error, Result};
use crate::refcount::RefCounter;

pub use entry::{FileCreate, FileEntry, FileUpdate, SyncStatus, INBOX_COLLECTION};
pub use sync_meta::SyncMeta;

/// Per-database-path init guard: schema initialization and first-time
/// WAL configuration must happen exactly once per file, even if
/// multiple `MetadataCatalog::open` calls race on the same path within
/// one process.
static INIT_GUARDS: Lazy<DashMap<String, Arc<Mutex<()>>>> = Lazy::new(DashMap::new);

fn init_guard_for(path: &Path) -> Arc<Mutex<()>> {
    let key = path.to_string_lossy().to_string();
    INIT_GUARDS.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
}

/// The metadata catalog: CRUD, queries, and write orchestration for
/// [`FileEntry`] rows.
#[derive(Clone)]
pub struct MetadataCatalog {
    pool: SqlitePool,
    refs: RefCounter,
    blobs: ShardedBlobStore,
    stable_ids: Arc<RwLock<HashSet<String>>>,
}

impl MetadataCatalog {
    /// Open (creating if necessary) the catalog database at `db_path`,
    /// applying pending migrations, and wire it to `blobs` for
    /// orchestrated writes.
    #[instrument(skip(config, blobs))]
    pub async fn open(
        db_path: &Path,
        config: &CatalogConfig,
        blobs: ShardedBlobStore,
    ) -> Result<Self> {
        let guard = init_guard_for(db_path);
        let _held = guard.lock();

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = Self::connect_with_retry(db_path, config).await?;

        let runner = crate::migrations::MigrationRunner::new(pool.clone())
            .with_default_migrations();
        let applied = runner.run().await?;
        if !applied.is_empty() {
            info!(?applied, "applied catalog migrations");
        }

        let refs = RefCounter::new(pool.clone());
        let stable_ids = queries::all_stable_ids(&pool).await?;

        Ok(Self {
            pool,
            refs,
            blobs,
            stable_ids: Arc::new(RwLock::new(stable_ids)),
        })
    }

    async fn connect_with_retry(db_path: &Path, config: &CatalogConfig) -> Result<SqlitePool> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .busy_timeout(config.busy_timeout);

        let mut attempt = 0;
        loop {
            let result = SqlitePoolOptions::new()
                .min_connections(config.min_connections)
                .max_connections(config.max_connections)
                .connect_with(options.clone())
                .await;

            match result {
                Ok(pool) => {
                    if config.enable_wal {
                        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
                    }
                    return Ok(pool);
                }
                Err(e) if attempt + 1 < config.open_retries => {
                    attempt += 1;
                    let backoff = config.open_retry_base_backoff * attempt;
                    debug!(attempt, ?backoff, error = %e, "retrying catalog connection");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Wrap an already-open pool directly, bypassing path-based guards.
    /// Used by tests and by components that share one in-memory pool.
    pub async fn from_pool(pool: SqlitePool, blobs: ShardedBlobStore) -> Result<Self> {
        let refs = RefCounter::new(pool.clone());
        let stable_ids = queries::all_stable_ids(&pool).await?;
        Ok(Self {
            pool,
            refs,
            blobs,
            stable_ids: Arc::new(RwLock::new(stable_ids)),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn refs(&self) -> &RefCounter {
        &self.refs
    }

    pub fn blobs(&self) -> &ShardedBlobStore {
        &self.blobs
    }

    async fn allocate_stable_id(&self) -> String {
        let mut ids = self.stable_ids.write().await;
        let id = crate::stable_id::generate_stable_id(&ids);
        ids.insert(id.clone());
        id
    }

    /// Insert a brand-new entry: writes the blob, increments its
    /// reference count, then inserts the catalog row — the fixed order
    /// the control flow requires on every insert.
    #[instrument(skip(self, content, doc_metadata, file_metadata))]
    pub async fn insert_file(
        &self,
        content: &[u8],
        file_type: FileType,
        filename: String,
        doc_id: String,
        doc_id_type: String,
        label: Option<String>,
        variant: Option<String>,
        version: Option<i64>,
        is_gold: bool,
        mut doc_collections: Vec<String>,
        doc_metadata: std::collections::HashMap<String, serde_json::Value>,
        file_metadata: std::collections::HashMap<String, serde_json::Value>,
        created_by: Option<String>,
    ) -> Result<FileEntry> {
        if doc_collections.is_empty() {
            doc_collections.push(INBOX_COLLECTION.to_string());
        }

        if is_gold {
            if let Some(existing) = queries::gold_for(&self.pool, &doc_id, variant.as_deref()).await? {
                return Err(Error::AlreadyExists(format!(
                    "gold already set for doc_id={doc_id:?} variant={variant:?}: {}",
                    existing.stable_id
                )));
            }
        }

        let (hash, _path) = self.blobs.put(content, file_type).await?;
        self.refs.increment(&hash, file_type).await?;

        let stable_id = self.allocate_stable_id().await;

        let data = FileCreate {
            content_hash: hash.clone(),
            stable_id: Some(stable_id.clone()),
            filename,
            doc_id,
            doc_id_type,
            file_type,
            file_size: content.len() as i64,
            label,
            variant,
            version,
            is_gold,
            doc_collections,
            doc_metadata,
            file_metadata,
            created_by,
        };

        if let Err(e) = queries::insert_row(&self.pool, &data, &stable_id).await {
            // Roll back the ref increment: the row never landed.
            let (_, should_delete) = self.refs.decrement(&hash).await?;
            if should_delete {
                self.blobs.delete(&hash, file_type).await?;
                self.refs.remove_entry(&hash).await?;
            }
            return Err(e);
        }

        queries::get_by_hash(&self.pool, &hash, false)
            .await?
            .ok_or_else(|| Error::NotFound(format!("just-inserted row {hash} vanished")))
    }

    /// Replace a row's content (edit-in-place): the new blob and
    /// reference are created before the old one is released, and
    /// `stable_id` never changes.
    #[instrument(skip(self, content))]
    pub async fn update_content(&self, old_hash: &str, content: &[u8]) -> Result<FileEntry> {
        let old_entry = queries::get_by_hash(&self.pool, old_hash, false)
            .await?
            .ok_or_else(|| Error::NotFound(format!("file not found: {old_hash}")))?;

        let (new_hash, _path) = self.blobs.put(content, old_entry.file_type).await?;
        if new_hash == old_hash {
            return Ok(old_entry);
        }

        self.refs.increment(&new_hash, old_entry.file_type).await?;

        if !queries::rewrite_content_hash(&self.pool, old_hash, &new_hash, content.len() as i64).await? {
            let (_, should_delete) = self.refs.decrement(&new_hash).await?;
            if should_delete {
                self.blobs.delete(&new_hash, old_entry.file_type).await?;
                self.refs.remove_entry(&new_hash).await?;
            }
            return Err(Error::NotFound(format!("file not found or already deleted: {old_hash}")));
        }

        let (_, should_delete) = self.refs.decrement(old_hash).await?;
        if should_delete {
            self.blobs.delete(old_hash, old_entry.file_type).await?;
            self.refs.remove_entry(old_hash).await?;
        }

        queries::get_by_hash(&self.pool, &new_hash, false)
            .await?
            .ok_or_else(|| Error::NotFound(format!("just-updated row {new_hash} vanished")))
    }

    /// Apply a metadata-only update (label, variant, collections, ...).
    #[instrument(skip(self, updates))]
    pub async fn update_metadata(&self, content_hash: &str, updates: FileUpdate) -> Result<FileEntry> {
        if updates.is_gold == Some(true) {
            let current = queries::get_by_hash(&self.pool, content_hash, false)
                .await?
                .ok_or_else(|| Error::NotFound(format!("file not found: {content_hash}")))?;
            let variant = updates.variant.clone().or(current.variant.clone());
            if let Some(existing) = queries::gold_for(&self.pool, &current.doc_id, variant.as_deref()).await? {
                if existing.content_hash != content_hash {
                    return Err(Error::AlreadyExists(format!(
                        "gold already set for doc_id={:?} variant={variant:?}",
                        current.doc_id
                    )));
                }
            }
        }

        if !queries::update_metadata(&self.pool, content_hash, &updates).await? {
            return Err(Error::NotFound(format!("file not found or already deleted: {content_hash}")));
        }

        queries::get_by_hash(&self.pool, content_hash, false)
            .await?
            .ok_or_else(|| Error::NotFound(format!("file vanished after update: {content_hash}")))
    }

    /// Soft-delete a row and release its reference; the blob is
    /// physically removed only if the count reaches zero.
    #[instrument(skip(self))]
    pub async fn delete_file(&self, content_hash: &str) -> Result<()> {
        let entry = queries::get_by_hash(&self.pool, content_hash, true)
            .await?
            .ok_or_else(|| Error::NotFound(format!("file not found: {content_hash}")))?;

        if !queries::soft_delete(&self.pool, content_hash).await? {
            return Err(Error::NotFound(format!("file not found or already deleted: {content_hash}")));
        }

        let (_, should_delete) = self.refs.decrement(content_hash).await?;
        if should_delete {
            self.blobs.delete(content_hash, entry.file_type).await?;
            self.refs.remove_entry(content_hash).await?;
        }

        Ok(())
    }

    /// Restore a soft-deleted row and re-acquire its reference.
    #[instrument(skip(self))]
    pub async fn undelete_file(&self, content_hash: &str) -> Result<FileEntry> {
        let entry = queries::get_by_hash(&self.pool, content_hash, true)
            .await?
            .ok_or_else(|| Error::NotFound(format!("file not found: {content_hash}")))?;

        if !queries::undelete(&self.pool, content_hash).await? {
            return Err(Error::NotFound(format!("file not deleted: {content_hash}")));
        }

        self.refs.increment(content_hash, entry.file_type).await?;

        queries::get_by_hash(&self.pool, content_hash, false)
            .await?
            .ok_or_else(|| Error::NotFound(format!("file vanished after undelete: {content_hash}")))
    }

    pub async fn get_by_hash(&self, hash: &str) -> Result<Option<FileEntry>> {
        queries::get_by_hash(&self.pool, hash, false).await
    }

    pub async fn get_by_stable_id(&self, stable_id: &str) -> Result<Option<FileEntry>> {
        queries::get_by_stable_id(&self.pool, stable_id, false).await
    }

    /// Resolve a stable_id or a (possibly abbreviated) content hash to
    /// exactly one entry.
    pub async fn resolve(&self, id_or_prefix: &str) -> Result<Option<FileEntry>> {
        if crate::stable_id::looks_like_content_hash(id_or_prefix) {
            return self.get_by_hash(id_or_prefix).await;
        }
        queries::find_by_prefix(&self.pool, id_or_prefix).await
    }

    pub async fn list_by_doc_id(&self, doc_id: &str) -> Result<Vec<FileEntry>> {
        queries::list_by_doc_id(&self.pool, doc_id, false).await
    }

    pub async fn list_by_collection(&self, collection: &str) -> Result<Vec<FileEntry>> {
        queries::list_by_collection(&self.pool, collection).await
    }

    pub async fn list_by_variant(&self, doc_id: &str, variant: Option<&str>) -> Result<Vec<FileEntry>> {
        queries::list_by_variant(&self.pool, doc_id, variant).await
    }

    pub async fn next_version(&self, doc_id: &str, variant: Option<&str>) -> Result<i64> {
        Ok(queries::latest_version(&self.pool, doc_id, variant).await? + 1)
    }

    pub async fn gold_for(&self, doc_id: &str, variant: Option<&str>) -> Result<Option<FileEntry>> {
        queries::gold_for(&self.pool, doc_id, variant).await
    }

    pub async fn all_entries(&self, include_deleted: bool) -> Result<Vec<FileEntry>> {
        queries::all_entries(&self.pool, include_deleted).await
    }

    pub async fn count_unsynced(&self) -> Result<i64> {
        queries::count_unsynced(&self.pool).await
    }

    /// The persisted record of this catalog's most recent sync pass.
    pub async fn sync_meta(&self) -> Result<SyncMeta> {
        sync_meta::load(&self.pool).await
    }

    pub(crate) async fn set_sync_in_progress(&self, in_progress: bool) -> Result<()> {
        sync_meta::set_sync_in_progress(&self.pool, in_progress).await
    }

    pub(crate) async fn record_sync_completed(&self, remote_version: i64) -> Result<()> {
        sync_meta::record_sync_completed(&self.pool, remote_version).await
    }

    pub(crate) async fn set_sync_status(
        &self,
        content_hash: &str,
        status: SyncStatus,
        remote_version: Option<i64>,
        sync_hash: Option<&str>,
    ) -> Result<()> {
        queries::set_sync_status(&self.pool, content_hash, status, remote_version, sync_hash).await
    }

    pub(crate) async fn deleted_before(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Result<Vec<FileEntry>> {
        queries::deleted_before(&self.pool, cutoff).await
    }

    pub(crate) async fn purge_row(&self, content_hash: &str) -> Result<()> {
        queries::purge_row(&self.pool, content_hash).await
    }

    pub async fn sync_tei_collections_with_pdf(&self) -> Result<u64> {
        maintenance::sync_tei_collections_with_pdf(&self.pool).await
    }

    pub async fn assign_inbox_to_collectionless(&self) -> Result<u64> {
        maintenance::assign_inbox_to_collectionless(&self.pool).await
    }

    pub async fn remove_duplicate_entries(&self) -> Result<u64> {
        maintenance::remove_duplicate_entries(&self.pool, &self.refs, &self.blobs).await
    }

    pub async fn orphaned_xml_files(&self) -> Result<Vec<FileEntry>> {
        maintenance::orphaned_xml_files(&self.pool).await
    }

    /// Re-sync the in-memory stable_id set from the database. Called
    /// after bulk operations (import, migration rollback) that may have
    /// added or removed rows outside the normal insert path.
    pub async fn refresh_stable_ids(&self) -> Result<()> {
        let fresh = queries::all_stable_ids(&self.pool).await?;
        *self.stable_ids.write().await = fresh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashMap;

    async fn catalog() -> (MetadataCatalog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let blobs = ShardedBlobStore::open(dir.path().join("files")).await.unwrap();
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::MigrationRunner::new(pool.clone())
            .with_default_migrations()
            .run()
            .await
            .unwrap();
        let catalog = MetadataCatalog::from_pool(pool, blobs).await.unwrap();
        (catalog, dir)
    }

    #[tokio::test]
    async fn insert_writes_blob_and_increments_ref() {
        let (catalog, _dir) = catalog().await;
        let entry = catalog
            .insert_file(
                b"hello",
                FileType::Pdf,
                "a.pdf".into(),
                "doc1".into(),
                "custom".into(),
                None,
                None,
                Some(1),
                false,
                vec!["_inbox".into()],
                HashMap::new(),
                HashMap::new(),
                None,
            )
            .await
            .unwrap();

        assert!(catalog.blobs().exists(&entry.content_hash, FileType::Pdf).await);
        assert_eq!(catalog.refs().get_count(&entry.content_hash).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn insert_rejects_second_gold_for_same_doc_variant() {
        let (catalog, _dir) = catalog().await;
        catalog
            .insert_file(
                b"v1",
                FileType::Tei,
                "a.xml".into(),
                "doc1".into(),
                "custom".into(),
                None,
                None,
                None,
                true,
                vec!["_inbox".into()],
                HashMap::new(),
                HashMap::new(),
                None,
            )
            .await
            .unwrap();

        let err = catalog
            .insert_file(
                b"v2",
                FileType::Tei,
                "b.xml".into(),
                "doc1".into(),
                "custom".into(),
                None,
                None,
                None,
                true,
                vec!["_inbox".into()],
                HashMap::new(),
                HashMap::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn update_content_preserves_stable_id_and_swaps_refs() {
        let (catalog, _dir) = catalog().await;
        let entry = catalog
            .insert_file(
                b"C1",
                FileType::Tei,
                "a.xml".into(),
                "doc1".into(),
                "custom".into(),
                None,
                None,
                Some(1),
                false,
                vec!["_inbox".into()],
                HashMap::new(),
                HashMap::new(),
                None,
            )
            .await
            .unwrap();
        let stable_id = entry.stable_id.clone();
        let old_hash = entry.content_hash.clone();

        let updated = catalog.update_content(&old_hash, b"C2").await.unwrap();

        assert_eq!(updated.stable_id, stable_id);
        assert_ne!(updated.content_hash, old_hash);
        assert_eq!(catalog.refs().get_count(&old_hash).await.unwrap(), None);
        assert!(!catalog.blobs().exists(&old_hash, FileType::Tei).await);
        assert_eq!(catalog.refs().get_count(&updated.content_hash).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn delete_then_undelete_round_trips_ref_count() {
        let (catalog, _dir) = catalog().await;
        let entry = catalog
            .insert_file(
                b"content",
                FileType::Pdf,
                "a.pdf".into(),
                "doc1".into(),
                "custom".into(),
                None,
                None,
                None,
                false,
                vec!["_inbox".into()],
                HashMap::new(),
                HashMap::new(),
                None,
            )
            .await
            .unwrap();

        catalog.delete_file(&entry.content_hash).await.unwrap();
        assert_eq!(catalog.refs().get_count(&entry.content_hash).await.unwrap(), None);
        assert!(!catalog.blobs().exists(&entry.content_hash, FileType::Pdf).await);

        let restored = catalog.undelete_file(&entry.content_hash).await.unwrap();
        assert_eq!(restored.content_hash, entry.content_hash);
        assert_eq!(catalog.refs().get_count(&entry.content_hash).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn resolve_finds_by_stable_id_and_hash_prefix() {
        let (catalog, _dir) = catalog().await;
        let entry = catalog
            .insert_file(
                b"content",
                FileType::Pdf,
                "a.pdf".into(),
                "doc1".into(),
                "custom".into(),
                None,
                None,
                None,
                false,
                vec!["_inbox".into()],
                HashMap::new(),
                HashMap::new(),
                None,
            )
            .await
            .unwrap();

        let by_stable = catalog.resolve(&entry.stable_id).await.unwrap().unwrap();
        assert_eq!(by_stable.content_hash, entry.content_hash);

        let prefix = &entry.content_hash[..8];
        let by_prefix = catalog.resolve(prefix).await.unwrap().unwrap();
        assert_eq!(by_prefix.content_hash, entry.content_hash);
    }
}
