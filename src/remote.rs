//! Remote replica: a WebDAV object store plus a shared metadata
//! database file, downloaded locally for querying and re-uploaded
//! whole after a sync pass.
//!
//! Grounded on `remote_metadata.py`'s `RemoteMetadataManager`
//! (download/upload/schema, the simplified remote file-row shape) and
//! `sync_service.py`'s `_acquire_lock`/`_release_lock` (advisory lock
//! file on the remote root, staleness takeover at 60s). The original
//! uses `webdav4`'s fsspec filesystem; this crate talks WebDAV over
//! plain HTTP verbs (`GET`/`PUT`/`DELETE`) via `reqwest`, which is all
//! a WebDAV server needs for whole-file object semantics.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info, instrument, warn};

use crate::blob_store::FileType;
use crate::config::RemoteConfig;
use crate::error::{Error, Result};

/// Simplified remote row shape: identity, classification, metadata
/// bags, deletion flag, and the version at which it last changed.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RemoteFileRow {
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
    pub deleted: i64,
    pub remote_version: Option<i64>,
    pub updated_at: String,
}

const REMOTE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS file_metadata (
    id TEXT PRIMARY KEY,
    stable_id TEXT UNIQUE NOT NULL,
    filename TEXT NOT NULL,
    doc_id TEXT NOT NULL,
    doc_id_type TEXT DEFAULT 'doi',
    file_type TEXT NOT NULL,
    file_size INTEGER,
    label TEXT,
    variant TEXT,
    version INTEGER DEFAULT 1,
    is_gold_standard BOOLEAN DEFAULT 0,
    doc_collections TEXT,
    doc_metadata TEXT,
    file_metadata TEXT,
    deleted BOOLEAN DEFAULT 0,
    remote_version INTEGER,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_doc_id ON file_metadata(doc_id);
CREATE INDEX IF NOT EXISTS idx_deleted ON file_metadata(deleted) WHERE deleted = 1;

CREATE TABLE IF NOT EXISTS sync_metadata (
    key TEXT PRIMARY KEY,
    value TEXT,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
"#;

/// A WebDAV-backed remote replica: the shared `metadata.db`, the
/// sharded blob tree, a `version.txt` object, and an advisory lock
/// file, all rooted at `config.remote_root`.
#[derive(Debug, Clone)]
pub struct RemoteReplica {
    http: Client,
    config: RemoteConfig,
}

impl RemoteReplica {
    pub fn new(config: RemoteConfig) -> Self {
        Self { http: Client::new(), config }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.remote_root,
            path.trim_start_matches('/')
        )
    }

    fn auth<'r>(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.basic_auth(&self.config.username, Some(&self.config.password))
    }

    /// Download `metadata.db` to `local_path`. If the remote has none
    /// yet, initializes a fresh database there with the remote schema
    /// and a `version := 1` row instead.
    #[instrument(skip(self))]
    pub async fn download_meta(&self, local_path: &Path) -> Result<()> {
        let resp = self
            .auth(self.http.get(self.url("metadata.db")))
            .send()
            .await
            .map_err(|e| Error::RemoteUnavailable(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            info!("remote metadata.db not found, initializing fresh database");
            return Self::init_fresh_db(local_path).await;
        }

        let resp = resp.error_for_status().map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
        let bytes = resp.bytes().await.map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
        tokio::fs::write(local_path, &bytes).await?;
        Ok(())
    }

    async fn init_fresh_db(local_path: &Path) -> Result<()> {
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(local_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        sqlx::query(REMOTE_SCHEMA).execute(&pool).await?;
        sqlx::query("INSERT OR IGNORE INTO sync_metadata (key, value) VALUES ('version', '1')")
            .execute(&pool)
            .await?;
        pool.close().await;
        Ok(())
    }

    /// Upload `local_path` as the new `metadata.db`.
    #[instrument(skip(self))]
    pub async fn upload_meta(&self, local_path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(local_path).await?;
        self.auth(self.http.put(self.url("metadata.db")))
            .body(bytes)
            .send()
            .await
            .map_err(|e| Error::RemoteUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
        Ok(())
    }

    // -- version.txt (a single small object at the remote root) --

    pub async fn get_version(&self) -> Result<i64> {
        let resp = self
            .auth(self.http.get(self.url("version.txt")))
            .send()
            .await
            .map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(1);
        }
        let text = resp.text().await.map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
        text.trim()
            .parse()
            .map_err(|_| Error::IntegrityError(format!("malformed remote version: {text:?}")))
    }

    pub async fn set_version(&self, n: i64) -> Result<()> {
        self.auth(self.http.put(self.url("version.txt")))
            .body(n.to_string())
            .send()
            .await
            .map_err(|e| Error::RemoteUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn increment_version(&self) -> Result<i64> {
        let next = self.get_version().await? + 1;
        self.set_version(next).await?;
        Ok(next)
    }

    // -- blob transport, same sharded layout as the local store --

    fn blob_remote_path(hash: &str, file_type: FileType) -> String {
        format!("files/{}/{}{}", &hash[..2], hash, file_type.extension())
    }

    #[instrument(skip(self, local_path))]
    pub async fn upload_blob(&self, local_path: &Path, hash: &str, file_type: FileType) -> Result<()> {
        let bytes = tokio::fs::read(local_path).await?;
        let remote_path = Self::blob_remote_path(hash, file_type);
        self.auth(self.http.put(self.url(&remote_path)))
            .body(bytes)
            .send()
            .await
            .map_err(|e| Error::RemoteUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Download a blob, returning `false` (without writing `local_path`)
    /// if it's absent remotely.
    #[instrument(skip(self, local_path))]
    pub async fn download_blob(&self, hash: &str, file_type: FileType, local_path: &Path) -> Result<bool> {
        let remote_path = Self::blob_remote_path(hash, file_type);
        let resp = self
            .auth(self.http.get(self.url(&remote_path)))
            .send()
            .await
            .map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let resp = resp.error_for_status().map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
        let bytes = resp.bytes().await.map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, &bytes).await?;
        Ok(true)
    }

    // -- advisory lock on the remote root --

    async fn lock_age(&self) -> Result<Option<Duration>> {
        let resp = self
            .auth(self.http.head(self.url("sync.lock")))
            .send()
            .await
            .map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let last_modified = resp
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(last_modified.map(|ts| {
            (Utc::now() - ts).to_std().unwrap_or(Duration::ZERO)
        }))
    }

    /// Acquire the advisory sync lock, retrying at `poll_interval` until
    /// `timeout` elapses or the lock is free (or stale past
    /// `staleness`).
    #[instrument(skip(self))]
    pub async fn acquire_lock(&self, holder: &str) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + self.config.lock_acquire_timeout;

        loop {
            match self.lock_age().await? {
                Some(age) if age < self.config.lock_staleness => {
                    if tokio::time::Instant::now() >= deadline {
                        warn!(holder, "timed out waiting for remote sync lock");
                        return Ok(false);
                    }
                    tokio::time::sleep(self.config.lock_poll_interval).await;
                    continue;
                }
                Some(_) => debug!("taking over stale remote sync lock"),
                None => {}
            }

            self.auth(self.http.put(self.url("sync.lock")))
                .body(holder.to_string())
                .send()
                .await
                .map_err(|e| Error::RemoteUnavailable(e.to_string()))?
                .error_for_status()
                .map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
            return Ok(true);
        }
    }

    pub async fn release_lock(&self) -> Result<()> {
        let resp = self
            .auth(self.http.delete(self.url("sync.lock")))
            .send()
            .await
            .map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
        if resp.status() != StatusCode::NOT_FOUND {
            resp.error_for_status().map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
        }
        Ok(())
    }
}

// -- queries against the downloaded remote metadata.db --

pub async fn get_all_files(pool: &SqlitePool, include_deleted: bool) -> Result<Vec<RemoteFileRow>> {
    let sql = if include_deleted {
        "SELECT * FROM file_metadata"
    } else {
        "SELECT * FROM file_metadata WHERE deleted = 0"
    };
    Ok(sqlx::query_as(sql).fetch_all(pool).await?)
}

pub async fn get_deleted_files(pool: &SqlitePool) -> Result<Vec<RemoteFileRow>> {
    Ok(sqlx::query_as("SELECT * FROM file_metadata WHERE deleted = 1").fetch_all(pool).await?)
}

pub async fn get_by_hash(pool: &SqlitePool, hash: &str) -> Result<Option<RemoteFileRow>> {
    Ok(sqlx::query_as("SELECT * FROM file_metadata WHERE id = ?1").bind(hash).fetch_optional(pool).await?)
}

/// Input for [`upsert_file`]: the fields a sync pass pushes upstream.
#[derive(Debug, Clone)]
pub struct RemoteFileUpsert {
    pub id: String,
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
    pub remote_version: i64,
}

pub async fn upsert_file(pool: &SqlitePool, file: &RemoteFileUpsert) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO file_metadata (
            id, stable_id, filename, doc_id, doc_id_type, file_type, file_size,
            label, variant, version, is_gold_standard, doc_collections,
            doc_metadata, file_metadata, deleted, remote_version, updated_at
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,0,?15,datetime('now'))
        ON CONFLICT(id) DO UPDATE SET
            filename = excluded.filename,
            doc_id = excluded.doc_id,
            doc_id_type = excluded.doc_id_type,
            file_type = excluded.file_type,
            file_size = excluded.file_size,
            label = excluded.label,
            variant = excluded.variant,
            version = excluded.version,
            is_gold_standard = excluded.is_gold_standard,
            doc_collections = excluded.doc_collections,
            doc_metadata = excluded.doc_metadata,
            file_metadata = excluded.file_metadata,
            deleted = 0,
            remote_version = excluded.remote_version,
            updated_at = datetime('now')
        "#,
    )
    .bind(&file.id)
    .bind(&file.stable_id)
    .bind(&file.filename)
    .bind(&file.doc_id)
    .bind(&file.doc_id_type)
    .bind(file.file_type.as_str())
    .bind(file.file_size)
    .bind(&file.label)
    .bind(&file.variant)
    .bind(file.version)
    .bind(file.is_gold as i64)
    .bind(serde_json::to_string(&file.doc_collections)?)
    .bind(serde_json::to_string(&file.doc_metadata)?)
    .bind(serde_json::to_string(&file.file_metadata)?)
    .bind(file.remote_version)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_deleted(pool: &SqlitePool, hash: &str, remote_version: i64) -> Result<()> {
    sqlx::query("UPDATE file_metadata SET deleted = 1, remote_version = ?1, updated_at = datetime('now') WHERE id = ?2")
        .bind(remote_version)
        .bind(hash)
        .execute(pool)
        .await?;
    Ok(())
}
