//! Persisted record of the catalog's most recent sync pass, stored as
//! key/value rows in the `sync_meta` table (migration 4). Lets
//! [`crate::sync::needs_sync`] and [`crate::sync::SyncEngine`] consult
//! "what did we last sync to" without a caller having to track and pass
//! that value in themselves.

use chrono::Utc;
use sqlx::sqlite::SqlitePool;

use crate::error::Result;

const KEY_REMOTE_VERSION: &str = "remote_version";
const KEY_LAST_SYNC_TIME: &str = "last_sync_time";
const KEY_SYNC_IN_PROGRESS: &str = "sync_in_progress";

/// Local record of the most recently completed sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMeta {
    /// Remote version this catalog was last synced to. Zero if never synced.
    pub remote_version: i64,
    /// RFC3339 timestamp of the last completed sync, if any.
    pub last_sync_time: Option<String>,
    /// Set while a sync pass is underway; a crash mid-sync leaves this
    /// `true`, which is a diagnostic signal, not a lock — the remote
    /// lock in [`crate::remote::RemoteReplica`] is what actually
    /// serializes concurrent syncs.
    pub sync_in_progress: bool,
}

async fn get(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM sync_meta WHERE key = ?1")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(value,)| value))
}

async fn set(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Load the persisted sync state, defaulting every field if the
/// catalog has never completed a sync.
pub async fn load(pool: &SqlitePool) -> Result<SyncMeta> {
    let remote_version = get(pool, KEY_REMOTE_VERSION)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let last_sync_time = get(pool, KEY_LAST_SYNC_TIME).await?;
    let sync_in_progress = get(pool, KEY_SYNC_IN_PROGRESS).await?.as_deref() == Some("1");

    Ok(SyncMeta { remote_version, last_sync_time, sync_in_progress })
}

pub async fn set_sync_in_progress(pool: &SqlitePool, in_progress: bool) -> Result<()> {
    set(pool, KEY_SYNC_IN_PROGRESS, if in_progress { "1" } else { "0" }).await
}

/// Record a completed sync pass: the new remote version, the current
/// time, and clear the in-progress flag.
pub async fn record_sync_completed(pool: &SqlitePool, remote_version: i64) -> Result<()> {
    set(pool, KEY_REMOTE_VERSION, &remote_version.to_string()).await?;
    set(pool, KEY_LAST_SYNC_TIME, &Utc::now().to_rfc3339()).await?;
    set_sync_in_progress(pool, false).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        crate::migrations::MigrationRunner::new(pool.clone())
            .with_default_migrations()
            .run()
            .await
            .unwrap();
        pool
    }

    #[tokio::test]
    async fn load_defaults_when_never_synced() {
        let pool = pool().await;
        let meta = load(&pool).await.unwrap();
        assert_eq!(meta, SyncMeta::default());
    }

    #[tokio::test]
    async fn record_sync_completed_persists_version_and_clears_in_progress() {
        let pool = pool().await;
        set_sync_in_progress(&pool, true).await.unwrap();

        record_sync_completed(&pool, 7).await.unwrap();

        let meta = load(&pool).await.unwrap();
        assert_eq!(meta.remote_version, 7);
        assert!(!meta.sync_in_progress);
        assert!(meta.last_sync_time.is_some());
    }

    #[tokio::test]
    async fn set_then_load_round_trips_in_progress_flag() {
        let pool = pool().await;
        set_sync_in_progress(&pool, true).await.unwrap();
        assert!(load(&pool).await.unwrap().sync_in_progress);
        set_sync_in_progress(&pool, false).await.unwrap();
        assert!(!load(&pool).await.unwrap().sync_in_progress);
    }
}
