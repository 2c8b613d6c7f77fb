//! Reference counting for blob lifetime management.
//!
//! Every blob in [`crate::blob_store::ShardedBlobStore`] has a row here
//! keyed by content hash. The catalog increments a blob's count after
//! writing a reference to it and decrements before dropping one; the
//! blob itself is only deleted once its count reaches zero. This is the
//! same split responsibility as the original's `storage_references`
//! table: the catalog owns *why* a blob is referenced, this module only
//! tracks *how many* times.

use sqlx::sqlite::SqlitePool;

use crate::blob_store::FileType;
use crate::error::Result;

/// A reference-count row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefEntry {
    pub file_hash: String,
    pub file_type: String,
    pub ref_count: i64,
}

/// Reference counter backed by a `storage_refs` table in the same
/// database as the metadata catalog.
#[derive(Debug, Clone)]
pub struct RefCounter {
    pool: SqlitePool,
}

impl RefCounter {
    /// Wrap an existing pool. Schema creation is handled by
    /// [`crate::migrations::MigrationRunner`]; this constructor assumes
    /// the `storage_refs` table already exists.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Increment the reference count for a blob, inserting a fresh row
    /// at count 1 if none exists yet.
    pub async fn increment(&self, file_hash: &str, file_type: FileType) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO storage_refs (file_hash, file_type, ref_count, created_at, updated_at)
            VALUES (?1, ?2, 1, datetime('now'), datetime('now'))
            ON CONFLICT(file_hash) DO UPDATE SET
                ref_count = ref_count + 1,
                updated_at = datetime('now')
            RETURNING ref_count
            "#,
        )
        .bind(file_hash)
        .bind(file_type.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    /// Decrement the reference count for a blob, returning the new
    /// count and whether the caller should now delete the blob
    /// (`new_count == 0`). A missing row is treated as an orphan: it
    /// reports `(0, true)` without erroring, since the storage layer
    /// never raises on "blob missing during decrement" — that's left
    /// for garbage collection to reconcile. A row already at zero stays
    /// at zero rather than going negative.
    pub async fn decrement(&self, file_hash: &str) -> Result<(i64, bool)> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE storage_refs
            SET ref_count = ref_count - 1, updated_at = datetime('now')
            WHERE file_hash = ?1 AND ref_count > 0
            RETURNING ref_count
            "#,
        )
        .bind(file_hash)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((count,)) => Ok((count, count == 0)),
            None => Ok((0, true)),
        }
    }

    /// Current reference count for a blob, or `None` if untracked.
    pub async fn get_count(&self, file_hash: &str) -> Result<Option<i64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT ref_count FROM storage_refs WHERE file_hash = ?1")
                .bind(file_hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(c,)| c))
    }

    /// Delete every row whose count has reached zero, returning the
    /// removed `(file_hash, file_type)` pairs so the caller can delete
    /// the corresponding blobs from the store.
    pub async fn cleanup_zero_refs(&self) -> Result<Vec<(String, FileType)>> {
        let rows: Vec<RefEntry> = sqlx::query_as(
            "DELETE FROM storage_refs WHERE ref_count <= 0 RETURNING file_hash, file_type, ref_count",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| Ok((r.file_hash, FileType::parse(&r.file_type)?)))
            .collect()
    }

    /// Remove a ref-count row outright, regardless of count. Used when
    /// garbage collection confirms the underlying blob is already gone.
    pub async fn remove_entry(&self, file_hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM storage_refs WHERE file_hash = ?1")
            .bind(file_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Every hash currently tracked with a positive ref count.
    pub async fn all_referenced(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT file_hash FROM storage_refs WHERE ref_count > 0")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(h,)| h).collect())
    }

    /// Blobs physically present in `store` with no ref-count row at
    /// all, or a row at zero — i.e. safe to delete. Used by garbage
    /// collection's orphan-blob phase.
    pub async fn orphans(
        &self,
        present: &[(String, FileType)],
    ) -> Result<Vec<(String, FileType)>> {
        let mut orphans = Vec::new();
        for (hash, file_type) in present {
            match self.get_count(hash).await? {
                Some(count) if count > 0 => {}
                _ => orphans.push((hash.clone(), *file_type)),
            }
        }
        Ok(orphans)
    }

    /// Rebuild the entire ref-count table from scratch by counting
    /// catalog references to each hash. `referenced_hashes` should list
    /// every `(file_hash, file_type)` pair currently referenced by the
    /// catalog, with duplicates for multiple references. This is the
    /// disaster-recovery path when counts are suspected to have drifted.
    pub async fn rebuild_from(&self, referenced_hashes: &[(String, FileType)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM storage_refs").execute(&mut *tx).await?;

        use std::collections::HashMap;
        let mut counts: HashMap<(String, FileType), i64> = HashMap::new();
        for (hash, ft) in referenced_hashes {
            *counts.entry((hash.clone(), *ft)).or_insert(0) += 1;
        }

        for ((hash, file_type), count) in counts {
            sqlx::query(
                r#"
                INSERT INTO storage_refs (file_hash, file_type, ref_count, created_at, updated_at)
                VALUES (?1, ?2, ?3, datetime('now'), datetime('now'))
                "#,
            )
            .bind(&hash)
            .bind(file_type.as_str())
            .bind(count)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query(
            r#"
            CREATE TABLE storage_refs (
                file_hash TEXT PRIMARY KEY,
                file_type TEXT NOT NULL,
                ref_count INTEGER NOT NULL CHECK (ref_count >= 0),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn increment_creates_then_bumps() {
        let counter = RefCounter::new(pool().await);
        assert_eq!(counter.increment("h1", FileType::Pdf).await.unwrap(), 1);
        assert_eq!(counter.increment("h1", FileType::Pdf).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn decrement_on_missing_is_treated_as_orphan() {
        let counter = RefCounter::new(pool().await);
        assert_eq!(counter.decrement("missing").await.unwrap(), (0, true));
    }

    #[tokio::test]
    async fn decrement_to_zero_then_cleanup_removes_row() {
        let counter = RefCounter::new(pool().await);
        counter.increment("h1", FileType::Tei).await.unwrap();
        assert_eq!(counter.decrement("h1").await.unwrap(), (0, true));
        let removed = counter.cleanup_zero_refs().await.unwrap();
        assert_eq!(removed, vec![("h1".to_string(), FileType::Tei)]);
        assert_eq!(counter.get_count("h1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn orphans_finds_unreferenced_present_blobs() {
        let counter = RefCounter::new(pool().await);
        counter.increment("referenced", FileType::Pdf).await.unwrap();
        let present = vec![
            ("referenced".to_string(), FileType::Pdf),
            ("dangling".to_string(), FileType::Pdf),
        ];
        let orphans = counter.orphans(&present).await.unwrap();
        assert_eq!(orphans, vec![("dangling".to_string(), FileType::Pdf)]);
    }

    #[tokio::test]
    async fn rebuild_from_replaces_all_counts() {
        let counter = RefCounter::new(pool().await);
        counter.increment("stale", FileType::Pdf).await.unwrap();
        counter
            .rebuild_from(&[
                ("h1".to_string(), FileType::Tei),
                ("h1".to_string(), FileType::Tei),
            ])
            .await
            .unwrap();
        assert_eq!(counter.get_count("stale").await.unwrap(), None);
        assert_eq!(counter.get_count("h1").await.unwrap(), Some(2));
    }
}
