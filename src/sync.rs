//! Bidirectional sync between the local catalog and a [`RemoteReplica`].
//!
//! Grounded on `sync_service.py`'s `perform_sync`: acquire the remote
//! lock, diff local against remote by content hash, apply remote
//! deletions, publish local deletions, transfer blobs, apply
//! metadata-only remote changes, bump the version, upload the
//! metadata database, release the lock. Progress is reported at the
//! same milestones the original pushes over SSE (0/10/20/30/40/55/75/
//! 90/100), now through [`ProgressBus`] instead of a wire protocol.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sqlx::sqlite::SqlitePool;
use tracing::{info, instrument, warn};

use crate::catalog::{FileUpdate, MetadataCatalog, SyncStatus};
use crate::error::{Error, Result};
use crate::progress::ProgressBus;
use crate::remote::{self, RemoteFileRow, RemoteFileUpsert, RemoteReplica};

/// One local/remote pair's disposition, per spec's diff rules.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Disposition {
    LocalNew,
    RemoteNew,
    Conflict,
    LocalModified,
    RemoteDeleted,
    RemoteModified,
    /// Both sides agree; nothing to do.
    NoOp,
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub uploaded: u64,
    pub downloaded: u64,
    pub local_deletions_published: u64,
    pub remote_deletions_applied: u64,
    pub metadata_updated: u64,
    pub conflicts: Vec<String>,
    pub errors: Vec<String>,
    pub new_version: i64,
}

/// Whether a sync pass has anything to do, without acquiring the lock
/// or touching the network beyond a version check. Compares against
/// the locally persisted [`crate::catalog::SyncMeta::remote_version`]
/// rather than a caller-supplied value, so repeated callers never drift
/// out of step with what was actually last synced.
pub async fn needs_sync(catalog: &MetadataCatalog, replica: &RemoteReplica) -> Result<bool> {
    let unsynced = catalog.count_unsynced().await?;
    let remote_version = replica.get_version().await?;
    let meta = catalog.sync_meta().await?;
    Ok(unsynced > 0 || meta.remote_version != remote_version)
}

pub struct SyncEngine<'a> {
    catalog: &'a MetadataCatalog,
    replica: &'a RemoteReplica,
    progress: Option<&'a ProgressBus>,
    work_dir: PathBuf,
    holder: String,
}

impl<'a> SyncEngine<'a> {
    pub fn new(catalog: &'a MetadataCatalog, replica: &'a RemoteReplica, work_dir: impl Into<PathBuf>, holder: impl Into<String>) -> Self {
        Self { catalog, replica, progress: None, work_dir: work_dir.into(), holder: holder.into() }
    }

    pub fn with_progress(mut self, progress: &'a ProgressBus) -> Self {
        self.progress = Some(progress);
        self
    }

    fn publish(&self, token: &str, percent: u8, message: &str) {
        if let Some(bus) = self.progress {
            bus.publish(token, percent, message);
        }
        info!(percent, message, "sync progress");
    }

    #[instrument(skip(self), fields(holder = %self.holder))]
    pub async fn perform_sync(&self, progress_token: &str) -> Result<SyncReport> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let remote_db_path = self.work_dir.join("remote_metadata.db");

        // Step 1: acquire the remote lock.
        self.publish(progress_token, 0, "acquiring remote lock");
        if !self.replica.acquire_lock(&self.holder).await? {
            return Err(Error::RemoteUnavailable("timed out acquiring remote sync lock".to_string()));
        }

        self.catalog.set_sync_in_progress(true).await?;
        let result = self.perform_sync_locked(progress_token, &remote_db_path).await;

        match &result {
            Ok(report) => self.catalog.record_sync_completed(report.new_version).await?,
            Err(_) => self.catalog.set_sync_in_progress(false).await?,
        }

        // Step 10: release the lock unconditionally, even on failure,
        // so a retry doesn't have to wait out the staleness window.
        if let Err(e) = self.replica.release_lock().await {
            warn!(error = %e, "failed to release remote sync lock");
        }

        result
    }

    async fn perform_sync_locked(&self, progress_token: &str, remote_db_path: &Path) -> Result<SyncReport> {
        // Step 2: download remote metadata database.
        self.publish(progress_token, 10, "downloading remote metadata");
        self.replica.download_meta(remote_db_path).await?;
        let options = sqlx::sqlite::SqliteConnectOptions::new().filename(remote_db_path);
        let remote_pool = SqlitePool::connect_with(options).await?;

        // Step 3: diff.
        self.publish(progress_token, 20, "comparing metadata");
        let local_entries = self.catalog.all_entries(true).await?;
        let remote_entries = remote::get_all_files(&remote_pool, true).await?;
        let remote_by_hash: HashMap<&str, &RemoteFileRow> =
            remote_entries.iter().map(|r| (r.id.as_str(), r)).collect();
        let local_by_hash: HashMap<&str, &crate::catalog::FileEntry> =
            local_entries.iter().map(|e| (e.content_hash.as_str(), e)).collect();

        let mut report = SyncReport::default();

        // The remote version advances by exactly one per `perform_sync`
        // call, independent of how many files are transferred or
        // deleted; every per-item write below stamps this same value.
        let new_version = self.replica.increment_version().await?;
        report.new_version = new_version;

        // Step 4: apply remote deletions locally.
        self.publish(progress_token, 30, "applying remote deletions");
        for remote_row in &remote_entries {
            if remote_row.deleted == 0 {
                continue;
            }
            if let Some(local) = local_by_hash.get(remote_row.id.as_str()) {
                if !local.deleted {
                    self.catalog.delete_file(&local.content_hash).await?;
                    report.remote_deletions_applied += 1;
                }
            }
        }

        // Step 5: publish local deletions.
        self.publish(progress_token, 40, "publishing local deletions");
        for local in &local_entries {
            if local.deleted && local.sync_status != SyncStatus::DeletionSynced {
                remote::mark_deleted(&remote_pool, &local.content_hash, new_version).await?;
                self.catalog
                    .set_sync_status(&local.content_hash, SyncStatus::DeletionSynced, Some(new_version), None)
                    .await?;
                report.local_deletions_published += 1;
            }
        }

        // Step 3 (continued): classify non-deleted pairs.
        let mut remote_modified = Vec::new();
        for local in &local_entries {
            if local.deleted {
                continue;
            }
            let disposition = classify(local, remote_by_hash.get(local.content_hash.as_str()).copied());
            match disposition {
                Disposition::LocalNew | Disposition::LocalModified => {
                    self.upload_one(local, &remote_pool, new_version, &mut report).await?;
                }
                Disposition::Conflict => {
                    report.conflicts.push(local.content_hash.clone());
                }
                Disposition::RemoteModified => {
                    remote_modified.push(local.content_hash.clone());
                }
                Disposition::RemoteDeleted | Disposition::NoOp | Disposition::RemoteNew => {}
            }
        }

        for remote_row in &remote_entries {
            if remote_row.deleted != 0 {
                continue;
            }
            if local_by_hash.contains_key(remote_row.id.as_str()) {
                continue;
            }
            self.download_one(remote_row, &mut report).await?;
        }

        // Step 7: apply remote metadata-only changes.
        self.publish(progress_token, 55, "applying remote metadata changes");
        for hash in &remote_modified {
            let Some(remote_row) = remote_by_hash.get(hash.as_str()) else { continue };
            self.catalog
                .update_metadata(
                    hash,
                    FileUpdate {
                        label: remote_row.label.clone(),
                        variant: remote_row.variant.clone(),
                        version: remote_row.version,
                        is_gold: Some(remote_row.is_gold_standard != 0),
                        doc_collections: Some(serde_json::from_str(&remote_row.doc_collections)?),
                        doc_metadata: Some(serde_json::from_str(&remote_row.doc_metadata)?),
                        file_metadata: Some(serde_json::from_str(&remote_row.file_metadata)?),
                        ..Default::default()
                    },
                )
                .await?;
            report.metadata_updated += 1;
        }

        self.publish(progress_token, 75, "transferring blobs");
        // (blob transfer happens inline in upload_one/download_one above;
        // this milestone marks the boundary before the version bump.)

        // Step 8: the version was already bumped once, above, before any
        // per-item work; nothing left to do here but mark the milestone.
        self.publish(progress_token, 90, "bumping version");

        // Step 9: upload metadata database.
        remote_pool.close().await;
        self.replica.upload_meta(remote_db_path).await?;

        self.publish(progress_token, 100, "sync complete");
        Ok(report)
    }

    async fn upload_one(&self, local: &crate::catalog::FileEntry, remote_pool: &SqlitePool, new_version: i64, report: &mut SyncReport) -> Result<()> {
        let blob = self
            .catalog
            .blobs()
            .get(&local.content_hash, local.file_type)
            .await?
            .ok_or_else(|| Error::NotFound(format!("local blob missing for {}", local.content_hash)))?;

        let local_tmp = self.work_dir.join(format!("{}{}", local.content_hash, local.file_type.extension()));
        tokio::fs::write(&local_tmp, &blob).await?;
        let upload_result = self.replica.upload_blob(&local_tmp, &local.content_hash, local.file_type).await;
        let _ = tokio::fs::remove_file(&local_tmp).await;
        upload_result?;

        let upsert = RemoteFileUpsert {
            id: local.content_hash.clone(),
            stable_id: local.stable_id.clone(),
            filename: local.filename.clone(),
            doc_id: local.doc_id.clone(),
            doc_id_type: local.doc_id_type.clone(),
            file_type: local.file_type,
            file_size: local.file_size,
            label: local.label.clone(),
            variant: local.variant.clone(),
            version: local.version,
            is_gold: local.is_gold,
            doc_collections: local.doc_collections.clone(),
            doc_metadata: local.doc_metadata.clone(),
            file_metadata: local.file_metadata.clone(),
            remote_version: new_version,
        };
        remote::upsert_file(remote_pool, &upsert).await?;

        self.catalog
            .set_sync_status(&local.content_hash, SyncStatus::Synced, Some(new_version), Some(&local.content_hash))
            .await?;
        report.uploaded += 1;
        Ok(())
    }

    async fn download_one(&self, remote_row: &RemoteFileRow, report: &mut SyncReport) -> Result<()> {
        let file_type = crate::blob_store::FileType::parse(&remote_row.file_type)?;
        let local_tmp = self.work_dir.join(format!("{}{}", remote_row.id, file_type.extension()));
        let found = self.replica.download_blob(&remote_row.id, file_type, &local_tmp).await?;
        if !found {
            report.errors.push(format!("remote blob missing for {}", remote_row.id));
            return Ok(());
        }
        let content = tokio::fs::read(&local_tmp).await?;
        let _ = tokio::fs::remove_file(&local_tmp).await;

        let doc_collections: Vec<String> = serde_json::from_str(&remote_row.doc_collections)?;
        let doc_metadata = serde_json::from_str(&remote_row.doc_metadata)?;
        let file_metadata = serde_json::from_str(&remote_row.file_metadata)?;

        let entry = self
            .catalog
            .insert_file(
                &content,
                file_type,
                remote_row.filename.clone(),
                remote_row.doc_id.clone(),
                remote_row.doc_id_type.clone(),
                remote_row.label.clone(),
                remote_row.variant.clone(),
                remote_row.version,
                remote_row.is_gold_standard != 0,
                doc_collections,
                doc_metadata,
                file_metadata,
                Some("sync".to_string()),
            )
            .await?;

        self.catalog
            .set_sync_status(&entry.content_hash, SyncStatus::Synced, remote_row.remote_version, Some(&entry.content_hash))
            .await?;
        report.downloaded += 1;
        Ok(())
    }
}

fn classify(local: &crate::catalog::FileEntry, remote: Option<&RemoteFileRow>) -> Disposition {
    let Some(remote) = remote else {
        return Disposition::LocalNew;
    };

    let remote_deleted = remote.deleted != 0;
    if remote_deleted {
        if local.sync_status != SyncStatus::Synced {
            return Disposition::Conflict;
        }
        return Disposition::RemoteDeleted;
    }

    let local_modified = local.sync_status != SyncStatus::Synced;
    let remote_updated_at = crate::catalog::entry::parse_timestamp(&remote.updated_at).ok();
    let remote_newer = remote_updated_at.map(|ts| ts > local.updated_at).unwrap_or(false);

    if local_modified && !remote_newer {
        Disposition::LocalModified
    } else if remote_newer && !local_modified {
        Disposition::RemoteModified
    } else {
        Disposition::NoOp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::FileType;
    use crate::catalog::entry::parse_timestamp;
    use chrono::Utc;

    fn local_entry(sync_status: SyncStatus, updated_at: chrono::DateTime<Utc>) -> crate::catalog::FileEntry {
        crate::catalog::FileEntry {
            content_hash: "h1".to_string(),
            stable_id: "s1".to_string(),
            filename: "f.pdf".to_string(),
            doc_id: "doc1".to_string(),
            doc_id_type: "custom".to_string(),
            file_type: FileType::Pdf,
            file_size: 1,
            label: None,
            variant: None,
            version: None,
            is_gold: false,
            doc_collections: vec![],
            doc_metadata: Default::default(),
            file_metadata: Default::default(),
            sync_status,
            local_modified_at: updated_at,
            sync_hash: None,
            remote_version: None,
            deleted: false,
            created_at: updated_at,
            updated_at,
            status: None,
            last_revision: None,
            created_by: None,
        }
    }

    fn remote_row(deleted: i64, updated_at: &str) -> RemoteFileRow {
        RemoteFileRow {
            id: "h1".to_string(),
            stable_id: "s1".to_string(),
            filename: "f.pdf".to_string(),
            doc_id: "doc1".to_string(),
            doc_id_type: "custom".to_string(),
            file_type: "pdf".to_string(),
            file_size: 1,
            label: None,
            variant: None,
            version: None,
            is_gold_standard: 0,
            doc_collections: "[]".to_string(),
            doc_metadata: "{}".to_string(),
            file_metadata: "{}".to_string(),
            deleted,
            remote_version: Some(1),
            updated_at: updated_at.to_string(),
        }
    }

    #[test]
    fn absent_remote_row_is_local_new() {
        let local = local_entry(SyncStatus::Pending, Utc::now());
        assert_eq!(classify(&local, None), Disposition::LocalNew);
    }

    #[test]
    fn remote_deleted_with_unsynced_local_is_conflict() {
        let local = local_entry(SyncStatus::Modified, Utc::now());
        let remote = remote_row(1, "2020-01-01 00:00:00");
        assert_eq!(classify(&local, Some(&remote)), Disposition::Conflict);
    }

    #[test]
    fn remote_deleted_with_synced_local_is_remote_deleted() {
        let local = local_entry(SyncStatus::Synced, Utc::now());
        let remote = remote_row(1, "2020-01-01 00:00:00");
        assert_eq!(classify(&local, Some(&remote)), Disposition::RemoteDeleted);
    }

    #[test]
    fn unsynced_local_with_older_remote_is_local_modified() {
        let local = local_entry(SyncStatus::Modified, Utc::now());
        let remote = remote_row(0, "2000-01-01 00:00:00");
        assert_eq!(classify(&local, Some(&remote)), Disposition::LocalModified);
    }

    #[test]
    fn synced_local_with_newer_remote_is_remote_modified() {
        let old = parse_timestamp("2000-01-01 00:00:00").unwrap();
        let local = local_entry(SyncStatus::Synced, old);
        let remote = remote_row(0, "2099-01-01 00:00:00");
        assert_eq!(classify(&local, Some(&remote)), Disposition::RemoteModified);
    }

    #[test]
    fn synced_local_with_stale_remote_is_noop() {
        let now = Utc::now();
        let local = local_entry(SyncStatus::Synced, now);
        let remote = remote_row(0, "2000-01-01 00:00:00");
        assert_eq!(classify(&local, Some(&remote)), Disposition::NoOp);
    }
}
