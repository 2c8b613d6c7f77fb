//! Pessimistic per-file locking with TTL-based staleness takeover.
//!
//! Grounded on `locking.py`'s `acquire_lock`/`release_lock`/`check_lock`
//! state machine (IMMEDIATE-transaction writes, reentrant acquire,
//! stale takeover), with one deliberate deviation: the original keys
//! locks by content hash and therefore needs `transfer_lock` to move a
//! lock when a save changes a file's hash. Locks here are keyed by
//! `stable_id`, which never changes across content edits, so there is
//! nothing to transfer — `update_content` on the catalog silently
//! preserves whatever lock already exists. `transfer_lock` is not
//! ported; do not reintroduce hash-keyed locks to "simplify" a future
//! change, the whole point of this design is eliminating that class of
//! bug.

use std::time::Duration;

use sqlx::sqlite::SqlitePool;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Lock table row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct LockRow {
    file_id: String,
    session_id: String,
    updated_at: String,
}

/// Non-mutating view of a lock's state, returned by [`LockManager::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStatus {
    pub is_locked: bool,
    pub locked_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LockManager {
    pool: SqlitePool,
    ttl: Duration,
}

impl LockManager {
    pub fn new(pool: SqlitePool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    /// Open (creating and migrating if necessary) the lock table
    /// database at `db_path`.
    pub async fn open(db_path: &std::path::Path, ttl: Duration) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS locks (
                file_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool, ttl })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn stale_cutoff(&self) -> Result<chrono::DateTime<chrono::Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| Error::InvalidArgument(format!("ttl out of range: {e}")))?;
        Ok(chrono::Utc::now() - ttl)
    }

    /// Acquire (or reentrantly refresh, or take over if stale) a lock
    /// on `stable_id` for `session`. Runs under `BEGIN IMMEDIATE` so a
    /// concurrent acquirer fails fast with a busy error instead of
    /// deadlocking on a later write-lock upgrade.
    pub async fn acquire(&self, stable_id: &str, session: &str) -> Result<bool> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| Error::LockFailed(format!("could not obtain connection: {e}")))?;

        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(|e| Error::LockFailed(format!("could not start lock transaction: {e}")))?;

        let result = self.acquire_locked(&mut conn, stable_id, session).await;

        match &result {
            Ok(_) => sqlx::query("COMMIT").execute(&mut *conn).await?,
            Err(_) => sqlx::query("ROLLBACK").execute(&mut *conn).await?,
        };

        result
    }

    async fn acquire_locked(
        &self,
        conn: &mut sqlx::pool::PoolConnection<sqlx::Sqlite>,
        stable_id: &str,
        session: &str,
    ) -> Result<bool> {
        let existing: Option<LockRow> =
            sqlx::query_as("SELECT file_id, session_id, updated_at FROM locks WHERE file_id = ?1")
                .bind(stable_id)
                .fetch_optional(&mut *conn)
                .await?;

        let cutoff = self.stale_cutoff()?;

        match existing {
            None => {
                sqlx::query(
                    "INSERT INTO locks (file_id, session_id, acquired_at, updated_at) \
                     VALUES (?1, ?2, datetime('now'), datetime('now'))",
                )
                .bind(stable_id)
                .bind(session)
                .execute(&mut *conn)
                .await?;
                info!(stable_id, session, "acquired new lock");
                Ok(true)
            }
            Some(row) if row.session_id == session => {
                sqlx::query("UPDATE locks SET updated_at = datetime('now') WHERE file_id = ?1")
                    .bind(stable_id)
                    .execute(&mut *conn)
                    .await?;
                Ok(true)
            }
            Some(row) => {
                let updated_at = crate::catalog::entry::parse_timestamp(&row.updated_at)?;
                if updated_at < cutoff {
                    sqlx::query(
                        "UPDATE locks SET session_id = ?1, updated_at = datetime('now') WHERE file_id = ?2",
                    )
                    .bind(session)
                    .bind(stable_id)
                    .execute(&mut *conn)
                    .await?;
                    warn!(stable_id, new_session = session, old_session = %row.session_id, "took over stale lock");
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Alias for [`Self::acquire`], matching the original's dedicated
    /// heartbeat endpoint: calling it on a lock you already hold simply
    /// refreshes `updated_at`.
    pub async fn refresh(&self, stable_id: &str, session: &str) -> Result<bool> {
        self.acquire(stable_id, session).await
    }

    /// Release a lock. Idempotent if absent; fails with [`Error::Conflict`]
    /// if held by a different session.
    pub async fn release(&self, stable_id: &str, session: &str) -> Result<()> {
        let existing: Option<LockRow> =
            sqlx::query_as("SELECT file_id, session_id, updated_at FROM locks WHERE file_id = ?1")
                .bind(stable_id)
                .fetch_optional(&self.pool)
                .await?;

        match existing {
            None => Ok(()),
            Some(row) if row.session_id == session => {
                sqlx::query("DELETE FROM locks WHERE file_id = ?1")
                    .bind(stable_id)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
            Some(row) => Err(Error::Conflict(format!(
                "lock on {stable_id} is held by {}, not {session}",
                row.session_id
            ))),
        }
    }

    /// Non-mutating lock check relative to `session`: `is_locked` is
    /// true only if a *different*, non-stale session holds the lock.
    pub async fn check(&self, stable_id: &str, session: &str) -> Result<LockStatus> {
        let existing: Option<LockRow> =
            sqlx::query_as("SELECT file_id, session_id, updated_at FROM locks WHERE file_id = ?1")
                .bind(stable_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some(row) = existing else {
            return Ok(LockStatus { is_locked: false, locked_by: None });
        };

        if row.session_id == session {
            return Ok(LockStatus { is_locked: false, locked_by: Some(row.session_id) });
        }

        let updated_at = crate::catalog::entry::parse_timestamp(&row.updated_at)?;
        let is_stale = updated_at < self.stale_cutoff()?;

        Ok(LockStatus {
            is_locked: !is_stale,
            locked_by: Some(row.session_id),
        })
    }

    /// Every non-stale lock, optionally restricted to one session.
    pub async fn active_locks(&self, session: Option<&str>) -> Result<Vec<String>> {
        let cutoff = self.stale_cutoff()?.to_rfc3339();
        let rows: Vec<(String,)> = match session {
            Some(s) => {
                sqlx::query_as(
                    "SELECT file_id FROM locks WHERE session_id = ?1 AND updated_at >= ?2",
                )
                .bind(s)
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT file_id FROM locks WHERE updated_at >= ?1")
                    .bind(cutoff)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Delete every lock row older than the TTL, regardless of owner.
    pub async fn cleanup_stale(&self) -> Result<u64> {
        let cutoff = self.stale_cutoff()?.to_rfc3339();
        let result = sqlx::query("DELETE FROM locks WHERE updated_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
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
            CREATE TABLE locks (
                file_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
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
    async fn acquire_new_lock_succeeds() {
        let mgr = LockManager::new(pool().await, Duration::from_secs(90));
        assert!(mgr.acquire("s1", "session-a").await.unwrap());
    }

    #[tokio::test]
    async fn reentrant_acquire_by_same_session_succeeds_and_keeps_holder() {
        let mgr = LockManager::new(pool().await, Duration::from_secs(90));
        assert!(mgr.acquire("s1", "session-a").await.unwrap());
        assert!(mgr.acquire("s1", "session-a").await.unwrap());
        let status = mgr.check("s1", "session-b").await.unwrap();
        assert_eq!(status.locked_by.as_deref(), Some("session-a"));
    }

    #[tokio::test]
    async fn acquire_by_other_session_fails_while_fresh() {
        let mgr = LockManager::new(pool().await, Duration::from_secs(90));
        mgr.acquire("s1", "session-a").await.unwrap();
        assert!(!mgr.acquire("s1", "session-b").await.unwrap());
    }

    #[tokio::test]
    async fn takeover_succeeds_after_ttl_elapses() {
        let mgr = LockManager::new(pool().await, Duration::from_millis(10));
        mgr.acquire("s1", "session-a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(mgr.acquire("s1", "session-b").await.unwrap());

        let release_result = mgr.release("s1", "session-a").await;
        assert!(matches!(release_result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn release_by_owner_clears_lock() {
        let mgr = LockManager::new(pool().await, Duration::from_secs(90));
        mgr.acquire("s1", "session-a").await.unwrap();
        mgr.release("s1", "session-a").await.unwrap();
        let status = mgr.check("s1", "session-b").await.unwrap();
        assert!(!status.is_locked);
        assert_eq!(status.locked_by, None);
    }

    #[tokio::test]
    async fn release_absent_lock_is_idempotent() {
        let mgr = LockManager::new(pool().await, Duration::from_secs(90));
        mgr.release("never-locked", "session-a").await.unwrap();
    }

    #[tokio::test]
    async fn active_locks_filters_by_session_and_staleness() {
        let mgr = LockManager::new(pool().await, Duration::from_millis(20));
        mgr.acquire("s1", "session-a").await.unwrap();
        mgr.acquire("s2", "session-b").await.unwrap();

        let for_a = mgr.active_locks(Some("session-a")).await.unwrap();
        assert_eq!(for_a, vec!["s1".to_string()]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let all = mgr.active_locks(None).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn cleanup_stale_purges_old_rows_only() {
        let mgr = LockManager::new(pool().await, Duration::from_millis(20));
        mgr.acquire("s1", "session-a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        mgr.acquire("s2", "session-b").await.unwrap();

        let purged = mgr.cleanup_stale().await.unwrap();
        assert_eq!(purged, 1);
    }
}
