//! Raw SQL operations against the `files` table.
//!
//! Kept separate from [`super::MetadataCatalog`]'s higher-level
//! orchestration (which also touches ref counts and the blob store) so
//! the query surface can be unit-tested against a bare in-memory
//! database, matching the teacher's split between `query_optimizer.rs`
//! (raw query execution) and `mod.rs` (policy).

use sqlx::sqlite::SqlitePool;

use super::entry::{FileCreate, FileEntry, FileRow, FileUpdate, SyncStatus};
use crate::error::{Error, Result};

pub(crate) async fn insert_row(
    pool: &SqlitePool,
    data: &FileCreate,
    stable_id: &str,
) -> Result<()> {
    let doc_collections = serde_json::to_string(&data.doc_collections)?;
    let doc_metadata = serde_json::to_string(&data.doc_metadata)?;
    let file_metadata = serde_json::to_string(&data.file_metadata)?;

    sqlx::query(
        r#"
        INSERT INTO files (
            id, stable_id, filename, doc_id, doc_id_type, file_type, file_size,
            label, variant, version, is_gold_standard, doc_collections,
            doc_metadata, file_metadata, sync_status, local_modified_at,
            deleted, created_at, updated_at, created_by
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7,
            ?8, ?9, ?10, ?11, ?12,
            ?13, ?14, 'modified', datetime('now'),
            0, datetime('now'), datetime('now'), ?15
        )
        "#,
    )
    .bind(&data.content_hash)
    .bind(stable_id)
    .bind(&data.filename)
    .bind(&data.doc_id)
    .bind(&data.doc_id_type)
    .bind(data.file_type.as_str())
    .bind(data.file_size)
    .bind(&data.label)
    .bind(&data.variant)
    .bind(data.version)
    .bind(data.is_gold as i64)
    .bind(doc_collections)
    .bind(doc_metadata)
    .bind(file_metadata)
    .bind(&data.created_by)
    .execute(pool)
    .await?;

    Ok(())
}

pub(crate) async fn get_by_hash(
    pool: &SqlitePool,
    hash: &str,
    include_deleted: bool,
) -> Result<Option<FileEntry>> {
    let sql = if include_deleted {
        "SELECT * FROM files WHERE id = ?1"
    } else {
        "SELECT * FROM files WHERE id = ?1 AND deleted = 0"
    };
    let row: Option<FileRow> = sqlx::query_as(sql).bind(hash).fetch_optional(pool).await?;
    row.map(FileRow::into_entry).transpose()
}

pub(crate) async fn get_by_stable_id(
    pool: &SqlitePool,
    stable_id: &str,
    include_deleted: bool,
) -> Result<Option<FileEntry>> {
    let sql = if include_deleted {
        "SELECT * FROM files WHERE stable_id = ?1"
    } else {
        "SELECT * FROM files WHERE stable_id = ?1 AND deleted = 0"
    };
    let row: Option<FileRow> = sqlx::query_as(sql)
        .bind(stable_id)
        .fetch_optional(pool)
        .await?;
    row.map(FileRow::into_entry).transpose()
}

/// Resolve a stable_id or full content hash prefix to exactly one
/// entry, erroring on ambiguity. `id_or_prefix` is tried first as an
/// exact stable_id match, then as a hash prefix.
pub(crate) async fn find_by_prefix(
    pool: &SqlitePool,
    id_or_prefix: &str,
) -> Result<Option<FileEntry>> {
    if let Some(entry) = get_by_stable_id(pool, id_or_prefix, false).await? {
        return Ok(Some(entry));
    }

    let pattern = format!("{id_or_prefix}%");
    let rows: Vec<FileRow> = sqlx::query_as("SELECT * FROM files WHERE id LIKE ?1 AND deleted = 0")
        .bind(&pattern)
        .fetch_all(pool)
        .await?;

    match rows.len() {
        0 => Ok(None),
        1 => Ok(Some(rows.into_iter().next().unwrap().into_entry()?)),
        _ => Err(Error::InvalidArgument(format!(
            "ambiguous id/prefix {id_or_prefix:?} matches {} entries",
            rows.len()
        ))),
    }
}

pub(crate) async fn all_stable_ids(pool: &SqlitePool) -> Result<std::collections::HashSet<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT stable_id FROM files")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(s,)| s).collect())
}

pub(crate) async fn list_by_doc_id(
    pool: &SqlitePool,
    doc_id: &str,
    include_deleted: bool,
) -> Result<Vec<FileEntry>> {
    let sql = if include_deleted {
        "SELECT * FROM files WHERE doc_id = ?1 ORDER BY created_at"
    } else {
        "SELECT * FROM files WHERE doc_id = ?1 AND deleted = 0 ORDER BY created_at"
    };
    let rows: Vec<FileRow> = sqlx::query_as(sql).bind(doc_id).fetch_all(pool).await?;
    rows.into_iter().map(FileRow::into_entry).collect()
}

pub(crate) async fn list_by_collection(pool: &SqlitePool, collection: &str) -> Result<Vec<FileEntry>> {
    let pattern = format!("%\"{collection}\"%");
    let rows: Vec<FileRow> = sqlx::query_as(
        "SELECT * FROM files WHERE deleted = 0 AND doc_collections LIKE ?1",
    )
    .bind(pattern)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(FileRow::into_entry).collect()
}

pub(crate) async fn list_by_variant(
    pool: &SqlitePool,
    doc_id: &str,
    variant: Option<&str>,
) -> Result<Vec<FileEntry>> {
    let rows: Vec<FileRow> = match variant {
        Some(v) => {
            sqlx::query_as(
                "SELECT * FROM files WHERE doc_id = ?1 AND variant = ?2 AND deleted = 0 ORDER BY version",
            )
            .bind(doc_id)
            .bind(v)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as(
                "SELECT * FROM files WHERE doc_id = ?1 AND variant IS NULL AND deleted = 0 ORDER BY version",
            )
            .bind(doc_id)
            .fetch_all(pool)
            .await?
        }
    };
    rows.into_iter().map(FileRow::into_entry).collect()
}

/// Highest existing version for `(doc_id, variant)`, to compute
/// "next version = count(existing) + 1" at creation time.
pub(crate) async fn latest_version(
    pool: &SqlitePool,
    doc_id: &str,
    variant: Option<&str>,
) -> Result<i64> {
    let entries = list_by_variant(pool, doc_id, variant).await?;
    Ok(entries.iter().filter_map(|e| e.version).count() as i64)
}

pub(crate) async fn gold_for(
    pool: &SqlitePool,
    doc_id: &str,
    variant: Option<&str>,
) -> Result<Option<FileEntry>> {
    let row: Option<FileRow> = match variant {
        Some(v) => {
            sqlx::query_as(
                "SELECT * FROM files WHERE doc_id = ?1 AND variant = ?2 AND is_gold_standard = 1 AND deleted = 0",
            )
            .bind(doc_id)
            .bind(v)
            .fetch_optional(pool)
            .await?
        }
        None => {
            sqlx::query_as(
                "SELECT * FROM files WHERE doc_id = ?1 AND variant IS NULL AND is_gold_standard = 1 AND deleted = 0",
            )
            .bind(doc_id)
            .fetch_optional(pool)
            .await?
        }
    };
    row.map(FileRow::into_entry).transpose()
}

/// Apply a partial update, rewriting timestamps and flipping
/// `sync_status` to `modified` as the original's `update_file` does.
/// `content_hash`, if set, is handled separately by the caller since it
/// requires ref-count bookkeeping the query layer doesn't own.
pub(crate) async fn update_metadata(
    pool: &SqlitePool,
    content_hash: &str,
    updates: &FileUpdate,
) -> Result<bool> {
    let mut set_clauses: Vec<String> = Vec::new();
    let mut binds: Vec<BindValue> = Vec::new();

    macro_rules! push {
        ($col:literal, $val:expr) => {
            if let Some(v) = $val {
                set_clauses.push(format!("{} = ?{}", $col, binds.len() + 1));
                binds.push(v.into());
            }
        };
    }

    push!("filename", updates.filename.clone());
    push!("file_size", updates.file_size);
    push!("label", updates.label.clone());
    push!("status", updates.status.clone());
    push!("last_revision", updates.last_revision.clone());
    push!("variant", updates.variant.clone());
    push!("version", updates.version);
    if let Some(v) = updates.is_gold {
        set_clauses.push(format!("is_gold_standard = ?{}", binds.len() + 1));
        binds.push(BindValue::Int(v as i64));
    }
    if let Some(v) = &updates.doc_collections {
        set_clauses.push(format!("doc_collections = ?{}", binds.len() + 1));
        binds.push(BindValue::Text(serde_json::to_string(v)?));
    }
    if let Some(v) = &updates.doc_metadata {
        set_clauses.push(format!("doc_metadata = ?{}", binds.len() + 1));
        binds.push(BindValue::Text(serde_json::to_string(v)?));
    }
    if let Some(v) = &updates.file_metadata {
        set_clauses.push(format!("file_metadata = ?{}", binds.len() + 1));
        binds.push(BindValue::Text(serde_json::to_string(v)?));
    }

    if set_clauses.is_empty() {
        return Ok(true);
    }

    let sql = format!(
        "UPDATE files SET {}, local_modified_at = datetime('now'), sync_status = 'modified', \
         updated_at = datetime('now') WHERE id = ?{} AND deleted = 0",
        set_clauses.join(", "),
        binds.len() + 1
    );

    let mut query = sqlx::query(&sql);
    for bind in &binds {
        query = bind.bind_to(query);
    }
    query = query.bind(content_hash);

    let result = query.execute(pool).await?;
    Ok(result.rows_affected() > 0)
}

/// Rewrite a row's primary key from `old_hash` to `new_hash`, the
/// catalog side of an edit-in-place content change. Ref-count
/// adjustment is the caller's responsibility.
pub(crate) async fn rewrite_content_hash(
    pool: &SqlitePool,
    old_hash: &str,
    new_hash: &str,
    new_size: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE files
        SET id = ?1, file_size = ?2, local_modified_at = datetime('now'),
            sync_status = 'modified', updated_at = datetime('now')
        WHERE id = ?3 AND deleted = 0
        "#,
    )
    .bind(new_hash)
    .bind(new_size)
    .bind(old_hash)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn soft_delete(pool: &SqlitePool, content_hash: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE files
        SET deleted = 1, local_modified_at = datetime('now'),
            sync_status = 'pending_delete', updated_at = datetime('now')
        WHERE id = ?1 AND deleted = 0
        "#,
    )
    .bind(content_hash)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn undelete(pool: &SqlitePool, content_hash: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE files
        SET deleted = 0, local_modified_at = datetime('now'),
            sync_status = 'modified', updated_at = datetime('now')
        WHERE id = ?1 AND deleted = 1
        "#,
    )
    .bind(content_hash)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn set_sync_status(
    pool: &SqlitePool,
    content_hash: &str,
    status: SyncStatus,
    remote_version: Option<i64>,
    sync_hash: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE files
        SET sync_status = ?1, remote_version = COALESCE(?2, remote_version),
            sync_hash = COALESCE(?3, sync_hash), updated_at = datetime('now')
        WHERE id = ?4
        "#,
    )
    .bind(status.as_str())
    .bind(remote_version)
    .bind(sync_hash)
    .bind(content_hash)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn count_unsynced(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM files WHERE sync_status NOT IN ('synced', 'deletion_synced')",
    )
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

pub(crate) async fn deleted_before(pool: &SqlitePool, cutoff: chrono::DateTime<chrono::Utc>) -> Result<Vec<FileEntry>> {
    let rows: Vec<FileRow> = sqlx::query_as(
        "SELECT * FROM files WHERE deleted = 1 AND updated_at < ?1",
    )
    .bind(cutoff.to_rfc3339())
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(FileRow::into_entry).collect()
}

pub(crate) async fn purge_row(pool: &SqlitePool, content_hash: &str) -> Result<()> {
    sqlx::query("DELETE FROM files WHERE id = ?1")
        .bind(content_hash)
        .execute(pool)
        .await?;
    Ok(())
}

pub(crate) async fn all_entries(pool: &SqlitePool, include_deleted: bool) -> Result<Vec<FileEntry>> {
    let sql = if include_deleted {
        "SELECT * FROM files"
    } else {
        "SELECT * FROM files WHERE deleted = 0"
    };
    let rows: Vec<FileRow> = sqlx::query_as(sql).fetch_all(pool).await?;
    rows.into_iter().map(FileRow::into_entry).collect()
}

/// Helper so `update_metadata` can build a variadic bound-parameter
/// list without unsafe casting between `sqlx::query::Query` binders.
pub(crate) enum BindValue {
    Text(String),
    Int(i64),
}

impl From<String> for BindValue {
    fn from(v: String) -> Self {
        BindValue::Text(v)
    }
}

impl From<i64> for BindValue {
    fn from(v: i64) -> Self {
        BindValue::Int(v)
    }
}

impl BindValue {
    fn bind_to<'q>(
        &'q self,
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        match self {
            BindValue::Text(s) => query.bind(s),
            BindValue::Int(i) => query.bind(i),
        }
    }
}
