//! Garbage collection: seven fixed-order phases over the catalog, the
//! reference counter, and the blob store.
//!
//! Grounded on `bin/cli_storage_gc.py` and `storage_gc.py`'s
//! zero-ref/orphan cleanup, generalized to the full phase list named
//! by this crate's design (duplicate-row collapse, TEI/PDF collection
//! reconciliation, inbox assignment, orphan XML removal, and the
//! schema/tmp cache clear the CLI tool performs as its last step).

use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::catalog::MetadataCatalog;
use crate::error::Result;

/// Statistics for one garbage-collection phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseStats {
    pub checked: u64,
    pub deleted: u64,
    pub errors: u64,
}

/// Statistics for a full garbage-collection run, one entry per phase.
#[derive(Debug, Clone, Default)]
pub struct GcReport {
    pub purge_deleted_rows: PhaseStats,
    pub delete_orphan_blobs: PhaseStats,
    pub remove_duplicate_rows: PhaseStats,
    pub reconcile_tei_collections: PhaseStats,
    pub assign_inbox: PhaseStats,
    pub delete_orphan_xml: PhaseStats,
    pub clear_schema_cache: PhaseStats,
}

/// Options controlling one garbage-collection pass. `purge_cutoff` is a
/// parameter, not a policy: callers restricted to "non-admin" must
/// enforce the ≥24h floor themselves before calling in.
#[derive(Debug, Clone)]
pub struct GcOptions {
    pub purge_cutoff: DateTime<Utc>,
    pub dry_run: bool,
}

pub struct GarbageCollector<'a> {
    catalog: &'a MetadataCatalog,
    schema_cache_dir: &'a Path,
}

impl<'a> GarbageCollector<'a> {
    pub fn new(catalog: &'a MetadataCatalog, schema_cache_dir: &'a Path) -> Self {
        Self { catalog, schema_cache_dir }
    }

    /// Run all seven phases in fixed order, returning per-phase stats.
    /// Physical blobs are never deleted without the ref-count check
    /// performed inside [`Self::delete_orphan_blobs`].
    #[instrument(skip(self, options))]
    pub async fn run(&self, options: &GcOptions) -> Result<GcReport> {
        let mut report = GcReport::default();

        report.purge_deleted_rows = self.purge_deleted_rows(options).await?;
        report.delete_orphan_blobs = self.delete_orphan_blobs(options).await?;
        report.remove_duplicate_rows = self.remove_duplicate_rows(options).await?;
        report.reconcile_tei_collections = self.reconcile_tei_collections(options).await?;
        report.assign_inbox = self.assign_inbox(options).await?;
        report.delete_orphan_xml = self.delete_orphan_xml(options).await?;
        report.clear_schema_cache = self.clear_schema_cache(options).await?;

        info!(?report, "garbage collection complete");
        Ok(report)
    }

    /// Phase 1: purge soft-deleted rows older than `purge_cutoff`.
    async fn purge_deleted_rows(&self, options: &GcOptions) -> Result<PhaseStats> {
        let mut stats = PhaseStats::default();
        let candidates = self.catalog.deleted_before(options.purge_cutoff).await?;
        stats.checked = candidates.len() as u64;

        for entry in candidates {
            if options.dry_run {
                stats.deleted += 1;
                continue;
            }
            match self.catalog.purge_row(&entry.content_hash).await {
                Ok(()) => stats.deleted += 1,
                Err(e) => {
                    warn!(hash = %entry.content_hash, error = %e, "failed to purge deleted row");
                    stats.errors += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Phase 2: delete blobs on disk with no (or a zero) ref-count row.
    async fn delete_orphan_blobs(&self, options: &GcOptions) -> Result<PhaseStats> {
        let mut stats = PhaseStats::default();
        let present = self.catalog.blobs().list_all().await?;
        stats.checked = present.len() as u64;

        let orphans = self.catalog.refs().orphans(&present).await?;
        for (hash, file_type) in orphans {
            if options.dry_run {
                stats.deleted += 1;
                continue;
            }
            match self.catalog.blobs().delete(&hash, file_type).await {
                Ok(_) => {
                    let _ = self.catalog.refs().remove_entry(&hash).await;
                    stats.deleted += 1;
                }
                Err(e) => {
                    warn!(hash = %hash, error = %e, "failed to delete orphan blob");
                    stats.errors += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Phase 3: collapse catalog rows sharing `(content_hash, doc_id,
    /// file_type)`, keeping the earliest.
    async fn remove_duplicate_rows(&self, options: &GcOptions) -> Result<PhaseStats> {
        let mut stats = PhaseStats::default();
        if options.dry_run {
            // Count-only: the maintenance query always mutates, so a
            // dry run only reports what a live run would have found.
            let all = self.catalog.all_entries(true).await?;
            stats.checked = all.len() as u64;
            return Ok(stats);
        }

        match self.catalog.remove_duplicate_entries().await {
            Ok(removed) => {
                stats.checked = removed;
                stats.deleted = removed;
            }
            Err(e) => {
                warn!(error = %e, "duplicate-row removal failed");
                stats.errors += 1;
            }
        }
        Ok(stats)
    }

    /// Phase 4: copy `doc_collections`/`doc_metadata` from each PDF onto
    /// its sibling TEI rows.
    async fn reconcile_tei_collections(&self, options: &GcOptions) -> Result<PhaseStats> {
        let mut stats = PhaseStats::default();
        if options.dry_run {
            return Ok(stats);
        }
        match self.catalog.sync_tei_collections_with_pdf().await {
            Ok(changed) => {
                stats.checked = changed;
                stats.deleted = changed;
            }
            Err(e) => {
                warn!(error = %e, "TEI/PDF collection reconciliation failed");
                stats.errors += 1;
            }
        }
        Ok(stats)
    }

    /// Phase 5: assign `_inbox` to entries with empty `doc_collections`.
    async fn assign_inbox(&self, options: &GcOptions) -> Result<PhaseStats> {
        let mut stats = PhaseStats::default();
        if options.dry_run {
            return Ok(stats);
        }
        match self.catalog.assign_inbox_to_collectionless().await {
            Ok(changed) => {
                stats.checked = changed;
                stats.deleted = changed;
            }
            Err(e) => {
                warn!(error = %e, "inbox assignment failed");
                stats.errors += 1;
            }
        }
        Ok(stats)
    }

    /// Phase 6: delete TEI entries with no PDF at the same `doc_id`.
    async fn delete_orphan_xml(&self, options: &GcOptions) -> Result<PhaseStats> {
        let mut stats = PhaseStats::default();
        let orphans = self.catalog.orphaned_xml_files().await?;
        stats.checked = orphans.len() as u64;

        for entry in orphans {
            if options.dry_run {
                stats.deleted += 1;
                continue;
            }
            match self.catalog.delete_file(&entry.content_hash).await {
                Ok(()) => stats.deleted += 1,
                Err(e) => {
                    warn!(hash = %entry.content_hash, error = %e, "failed to delete orphan XML entry");
                    stats.errors += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Phase 7: recursively clear the schema/tmp cache directory.
    async fn clear_schema_cache(&self, options: &GcOptions) -> Result<PhaseStats> {
        let mut stats = PhaseStats::default();

        let mut entries = match tokio::fs::read_dir(self.schema_cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            stats.checked += 1;
            if options.dry_run {
                stats.deleted += 1;
                continue;
            }

            let file_type = entry.file_type().await?;
            let result = if file_type.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await
            } else {
                tokio::fs::remove_file(entry.path()).await
            };

            match result {
                Ok(()) => stats.deleted += 1,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "failed to clear cache entry");
                    stats.errors += 1;
                }
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{FileType, ShardedBlobStore};
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, MetadataCatalog) {
        let dir = TempDir::new().unwrap();
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        crate::migrations::MigrationRunner::new(pool.clone())
            .with_default_migrations()
            .run()
            .await
            .unwrap();
        let blobs = ShardedBlobStore::open(dir.path().join("files")).await.unwrap();
        let catalog = MetadataCatalog::from_pool(pool, blobs).await.unwrap();
        (dir, catalog)
    }

    #[tokio::test]
    async fn purge_deleted_rows_removes_rows_older_than_cutoff() {
        let (dir, catalog) = setup().await;
        let entry = catalog
            .insert_file(
                b"content",
                FileType::Pdf,
                "f.pdf".to_string(),
                "doc1".to_string(),
                "custom".to_string(),
                None,
                None,
                None,
                false,
                vec!["c".to_string()],
                Default::default(),
                Default::default(),
                None,
            )
            .await
            .unwrap();
        catalog.delete_file(&entry.content_hash).await.unwrap();

        let gc = GarbageCollector::new(&catalog, dir.path());
        let options = GcOptions { purge_cutoff: Utc::now() + chrono::Duration::seconds(5), dry_run: false };
        let report = gc.run(&options).await.unwrap();

        assert_eq!(report.purge_deleted_rows.deleted, 1);
        assert!(catalog.get_by_hash(&entry.content_hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dry_run_reports_without_mutating() {
        let (dir, catalog) = setup().await;
        let entry = catalog
            .insert_file(
                b"content",
                FileType::Pdf,
                "f.pdf".to_string(),
                "doc1".to_string(),
                "custom".to_string(),
                None,
                None,
                None,
                false,
                vec!["c".to_string()],
                Default::default(),
                Default::default(),
                None,
            )
            .await
            .unwrap();
        catalog.delete_file(&entry.content_hash).await.unwrap();

        let gc = GarbageCollector::new(&catalog, dir.path());
        let options = GcOptions { purge_cutoff: Utc::now() + chrono::Duration::seconds(5), dry_run: true };
        let report = gc.run(&options).await.unwrap();

        assert_eq!(report.purge_deleted_rows.deleted, 1);
        // Still present: dry run must not mutate the catalog.
        assert!(catalog.get_by_hash(&entry.content_hash).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn orphan_xml_without_pdf_is_deleted() {
        let (dir, catalog) = setup().await;
        let tei = catalog
            .insert_file(
                b"<TEI/>",
                FileType::Tei,
                "f.tei.xml".to_string(),
                "doc-orphan".to_string(),
                "custom".to_string(),
                None,
                None,
                Some(0),
                true,
                vec!["c".to_string()],
                Default::default(),
                Default::default(),
                None,
            )
            .await
            .unwrap();

        let gc = GarbageCollector::new(&catalog, dir.path());
        let options = GcOptions { purge_cutoff: Utc::now() - chrono::Duration::days(365), dry_run: false };
        let report = gc.run(&options).await.unwrap();

        assert_eq!(report.delete_orphan_xml.deleted, 1);
        assert!(catalog.get_by_hash(&tei.content_hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_schema_cache_removes_files_and_dirs() {
        let (dir, catalog) = setup().await;
        let cache_dir = dir.path().join("cache");
        tokio::fs::create_dir_all(cache_dir.join("subdir")).await.unwrap();
        tokio::fs::write(cache_dir.join("a.tmp"), b"x").await.unwrap();

        let gc = GarbageCollector::new(&catalog, &cache_dir);
        let options = GcOptions { purge_cutoff: Utc::now(), dry_run: false };
        let report = gc.run(&options).await.unwrap();

        assert_eq!(report.clear_schema_cache.deleted, 2);
        assert!(tokio::fs::read_dir(&cache_dir).await.unwrap().next_entry().await.unwrap().is_none());
    }
}
