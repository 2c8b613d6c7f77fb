//! The `FileEntry` row type and its create/update request shapes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::blob_store::FileType;
use crate::error::{Error, Result};

/// Lifecycle state of a row with respect to the remote replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Modified,
    Pending,
    PendingDelete,
    DeletionSynced,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Modified => "modified",
            SyncStatus::Pending => "pending",
            SyncStatus::PendingDelete => "pending_delete",
            SyncStatus::DeletionSynced => "deletion_synced",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "synced" => Ok(SyncStatus::Synced),
            "modified" => Ok(SyncStatus::Modified),
            "pending" => Ok(SyncStatus::Pending),
            "pending_delete" => Ok(SyncStatus::PendingDelete),
            "deletion_synced" => Ok(SyncStatus::DeletionSynced),
            "error" => Ok(SyncStatus::Error),
            other => Err(Error::InvalidArgument(format!("unknown sync_status: {other}"))),
        }
    }
}

/// The reserved collection a file is auto-assigned to when its
/// `doc_collections` set would otherwise be empty.
pub const INBOX_COLLECTION: &str = "_inbox";

/// A catalog row: the authoritative metadata record for one version of
/// one document artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub content_hash: String,
    pub stable_id: String,
    pub filename: String,
    pub doc_id: String,
    pub doc_id_type: String,
    pub file_type: FileType,
    pub file_size: i64,
    pub label: Option<String>,
    pub variant: Option<String>,
    pub version: Option<i64>,
    pub is_gold: bool,
    pub doc_collections: Vec<String>,
    pub doc_metadata: HashMap<String, serde_json::Value>,
    pub file_metadata: HashMap<String, serde_json::Value>,
    pub sync_status: SyncStatus,
    pub local_modified_at: DateTime<Utc>,
    pub sync_hash: Option<String>,
    pub remote_version: Option<i64>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: Option<String>,
    pub last_revision: Option<String>,
    pub created_by: Option<String>,
}

impl FileEntry {
    /// Ensure an entry always belongs to at least one collection,
    /// falling back to [`INBOX_COLLECTION`].
    pub fn normalize_collections(&mut self) {
        if self.doc_collections.is_empty() {
            self.doc_collections.push(INBOX_COLLECTION.to_string());
        }
    }
}

/// Raw database row shape, matching the schema's column types exactly
/// (SQLite has no native bool/JSON/timestamp types), before being lifted
/// into [`FileEntry`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct FileRow {
    pub id: String,
    pub stable_id: String,
    pub filename: String,
    pub doc_id: String,
    pub doc_id_type: String,
    pub file_type: String,
    pub file_size: i64,
    pub label: Option<String>,
    pub variant: Option<String>,
    pub version: Option<i64>,
    pub is_gold_standard: i64,
    pub doc_collections: String,
    pub doc_metadata: String,
    pub file_metadata: String,
    pub sync_status: String,
    pub local_modified_at: String,
    pub sync_hash: Option<String>,
    pub remote_version: Option<i64>,
    pub deleted: i64,
    pub created_at: String,
    pub updated_at: String,
    pub status: Option<String>,
    pub last_revision: Option<String>,
    pub created_by: Option<String>,
}

impl FileRow {
    pub(crate) fn into_entry(self) -> Result<FileEntry> {
        Ok(FileEntry {
            content_hash: self.id,
            stable_id: self.stable_id,
            filename: self.filename,
            doc_id: self.doc_id,
            doc_id_type: self.doc_id_type,
            file_type: FileType::parse(&self.file_type)?,
            file_size: self.file_size,
            label: self.label,
            variant: self.variant,
            version: self.version,
            is_gold: self.is_gold_standard != 0,
            doc_collections: serde_json::from_str(&self.doc_collections)?,
            doc_metadata: serde_json::from_str(&self.doc_metadata)?,
            file_metadata: serde_json::from_str(&self.file_metadata)?,
            sync_status: SyncStatus::parse(&self.sync_status)?,
            local_modified_at: parse_timestamp(&self.local_modified_at)?,
            sync_hash: self.sync_hash,
            remote_version: self.remote_version,
            deleted: self.deleted != 0,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            status: self.status,
            last_revision: self.last_revision,
            created_by: self.created_by,
        })
    }
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
        })
        .map_err(|e| Error::InvalidArgument(format!("bad timestamp {s:?}: {e}")))
}

/// Fields required to insert a brand-new entry. `stable_id` is left to
/// the allocator unless the caller is restoring a known one (e.g.
/// import round-trip with a preserved id).
#[derive(Debug, Clone)]
pub struct FileCreate {
    pub content_hash: String,
    pub stable_id: Option<String>,
    pub filename: String,
    pub doc_id: String,
    pub doc_id_type: String,
    pub file_type: FileType,
    pub file_size: i64,
    pub label: Option<String>,
    pub variant: Option<String>,
    pub version: Option<i64>,
    pub is_gold: bool,
    pub doc_collections: Vec<String>,
    pub doc_metadata: HashMap<String, serde_json::Value>,
    pub file_metadata: HashMap<String, serde_json::Value>,
    pub created_by: Option<String>,
}

/// Partial update; only `Some` fields are applied. `content_hash` here
/// represents an edit-in-place content change.
#[derive(Debug, Clone, Default)]
pub struct FileUpdate {
    pub content_hash: Option<String>,
    pub filename: Option<String>,
    pub file_size: Option<i64>,
    pub label: Option<String>,
    pub status: Option<String>,
    pub last_revision: Option<String>,
    pub variant: Option<String>,
    pub version: Option<i64>,
    pub is_gold: Option<bool>,
    pub doc_collections: Option<Vec<String>>,
    pub doc_metadata: Option<HashMap<String, serde_json::Value>>,
    pub file_metadata: Option<HashMap<String, serde_json::Value>>,
}
