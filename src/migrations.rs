//! Versioned, idempotent schema migrations for the metadata catalog.
//!
//! Migrations are registered as an ordered list of version/up/down
//! triples and applied inside a transaction each; a dedicated
//! `_migrations` table tracks the highest applied version, following
//! the teacher's `database::migrations` `MigrationManager`/`SqlMigration`
//! split. Each migration must detect its own prior application so
//! re-running `run()` against an already-migrated database is a no-op.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::info;

use crate::error::Result;

pub type MigrationVersion = i64;

/// A single schema change, applied forward (`up`) or backward (`down`).
#[async_trait]
pub trait Migration: Send + Sync {
    fn version(&self) -> MigrationVersion;
    fn name(&self) -> &str;
    async fn up(&self, pool: &SqlitePool) -> Result<()>;
    async fn down(&self, pool: &SqlitePool) -> Result<()>;
}

/// A migration expressed as plain up/down SQL, for the common case
/// where no Rust-side data transformation is needed.
pub struct SqlMigration {
    version: MigrationVersion,
    name: String,
    up_sql: String,
    down_sql: Option<String>,
}

impl SqlMigration {
    pub fn new(
        version: MigrationVersion,
        name: impl Into<String>,
        up_sql: impl Into<String>,
        down_sql: Option<String>,
    ) -> Self {
        Self {
            version,
            name: name.into(),
            up_sql: up_sql.into(),
            down_sql,
        }
    }
}

#[async_trait]
impl Migration for SqlMigration {
    fn version(&self) -> MigrationVersion {
        self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn up(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(&self.up_sql).execute(pool).await?;
        Ok(())
    }

    async fn down(&self, pool: &SqlitePool) -> Result<()> {
        if let Some(sql) = &self.down_sql {
            sqlx::query(sql).execute(pool).await?;
        }
        Ok(())
    }
}

/// Backfills `files.status` for TEI rows by parsing the TEI blob
/// referenced by `content_hash` out of the blob store. Rows whose blob
/// is missing or fails to parse get a fallback value rather than
/// failing the migration.
pub struct BackfillTeiStatus {
    blob_root: std::path::PathBuf,
}

impl BackfillTeiStatus {
    pub fn new(blob_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            blob_root: blob_root.into(),
        }
    }

    fn blob_path(&self, hash: &str) -> std::path::PathBuf {
        self.blob_root
            .join(&hash[..2])
            .join(format!("{hash}.tei.xml"))
    }

    /// Extract the `status` attribute of the first `<revisionDesc>`
    /// change entry, if present. Deliberately tolerant: any parse
    /// failure falls back to `"unknown"` rather than aborting.
    fn parse_status(xml: &str) -> String {
        use quick_xml::events::Event;
        use quick_xml::Reader;

        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) if e.name().as_ref() == b"change" => {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"status" {
                            if let Ok(value) = attr.unescape_value() {
                                return value.into_owned();
                            }
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Err(_) => return "unknown".to_string(),
                _ => {}
            }
            buf.clear();
        }

        "unknown".to_string()
    }
}

#[async_trait]
impl Migration for BackfillTeiStatus {
    fn version(&self) -> MigrationVersion {
        5
    }

    fn name(&self) -> &str {
        "backfill_tei_status_from_blob"
    }

    async fn up(&self, pool: &SqlitePool) -> Result<()> {
        let column_exists: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pragma_table_info('files') WHERE name = 'status'",
        )
        .fetch_one(pool)
        .await?;
        if column_exists.0 == 0 {
            sqlx::query("ALTER TABLE files ADD COLUMN status TEXT")
                .execute(pool)
                .await?;
        }

        let rows = sqlx::query("SELECT id FROM files WHERE file_type = 'tei' AND status IS NULL")
            .fetch_all(pool)
            .await?;

        for row in rows {
            let hash: String = row.get("id");
            let status = match tokio::fs::read_to_string(self.blob_path(&hash)).await {
                Ok(xml) => Self::parse_status(&xml),
                Err(_) => "unknown".to_string(),
            };
            sqlx::query("UPDATE files SET status = ?1 WHERE id = ?2")
                .bind(&status)
                .bind(&hash)
                .execute(pool)
                .await?;
        }

        Ok(())
    }

    async fn down(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query("UPDATE files SET status = NULL")
            .execute(pool)
            .await?;
        Ok(())
    }
}

/// Renames the lock table's key column from `file_hash` to `file_id`,
/// reflecting the switch from content-hash-keyed to stable-id-keyed
/// locks. SQLite's `ALTER TABLE ... RENAME COLUMN` handles this without
/// a rebuild; idempotent via the same `pragma_table_info` probe.
pub struct RenameLockKeyColumn;

#[async_trait]
impl Migration for RenameLockKeyColumn {
    fn version(&self) -> MigrationVersion {
        6
    }

    fn name(&self) -> &str {
        "rename_lock_key_column_to_file_id"
    }

    async fn up(&self, pool: &SqlitePool) -> Result<()> {
        let already_done: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pragma_table_info('locks') WHERE name = 'file_id'",
        )
        .fetch_one(pool)
        .await?;
        if already_done.0 == 0 {
            sqlx::query("ALTER TABLE locks RENAME COLUMN file_hash TO file_id")
                .execute(pool)
                .await?;
        }
        Ok(())
    }

    async fn down(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query("ALTER TABLE locks RENAME COLUMN file_id TO file_hash")
            .execute(pool)
            .await?;
        Ok(())
    }
}

/// Applies and tracks migrations against a single sqlite database.
pub struct MigrationRunner {
    pool: SqlitePool,
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationRunner {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            migrations: Vec::new(),
        }
    }

    pub fn register(mut self, migration: impl Migration + 'static) -> Self {
        self.migrations.push(Box::new(migration));
        self
    }

    /// The base catalog schema plus the first two indices, as migrations
    /// 1-4. Registered by default in [`Self::with_default_migrations`].
    pub fn with_default_migrations(self) -> Self {
        self.register(SqlMigration::new(
            1,
            "create_files_table",
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                stable_id TEXT UNIQUE NOT NULL,
                filename TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                doc_id_type TEXT NOT NULL DEFAULT 'custom',
                file_type TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                label TEXT,
                variant TEXT,
                version INTEGER,
                is_gold_standard INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                local_modified_at TEXT NOT NULL,
                remote_version INTEGER,
                sync_status TEXT NOT NULL DEFAULT 'modified',
                sync_hash TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                status TEXT,
                last_revision TEXT,
                created_by TEXT,
                doc_collections TEXT NOT NULL DEFAULT '[]',
                doc_metadata TEXT NOT NULL DEFAULT '{}',
                file_metadata TEXT NOT NULL DEFAULT '{}'
            )
            "#,
            Some("DROP TABLE files".to_string()),
        ))
        .register(SqlMigration::new(
            2,
            "create_files_indices",
            r#"
            CREATE INDEX IF NOT EXISTS idx_files_doc_id ON files(doc_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_files_stable_id ON files(stable_id);
            CREATE INDEX IF NOT EXISTS idx_files_deleted ON files(deleted);
            "#,
            Some(
                "DROP INDEX IF EXISTS idx_files_doc_id; \
                 DROP INDEX IF EXISTS idx_files_stable_id; \
                 DROP INDEX IF EXISTS idx_files_deleted;"
                    .to_string(),
            ),
        ))
        .register(SqlMigration::new(
            3,
            "create_storage_refs_table",
            r#"
            CREATE TABLE IF NOT EXISTS storage_refs (
                file_hash TEXT PRIMARY KEY,
                file_type TEXT NOT NULL,
                ref_count INTEGER NOT NULL CHECK (ref_count >= 0),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_storage_refs_zero
                ON storage_refs(ref_count) WHERE ref_count = 0;
            "#,
            Some("DROP TABLE storage_refs".to_string()),
        ))
        .register(SqlMigration::new(
            4,
            "create_sync_meta_table",
            r#"
            CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
            Some("DROP TABLE sync_meta;".to_string()),
        ))
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn applied_versions(&self) -> Result<Vec<MigrationVersion>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT version FROM _migrations ORDER BY version")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(v,)| v).collect())
    }

    /// Apply every pending migration, in ascending version order, each
    /// inside its own transaction.
    pub async fn run(&self) -> Result<Vec<MigrationVersion>> {
        self.ensure_migrations_table().await?;
        let applied = self.applied_versions().await?;

        let mut ordered: Vec<&Box<dyn Migration>> = self.migrations.iter().collect();
        ordered.sort_by_key(|m| m.version());

        let mut newly_applied = Vec::new();
        for migration in ordered {
            if applied.contains(&migration.version()) {
                continue;
            }

            info!(version = migration.version(), name = migration.name(), "applying migration");
            migration.up(&self.pool).await?;

            sqlx::query(
                "INSERT INTO _migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            )
            .bind(migration.version())
            .bind(migration.name())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;

            newly_applied.push(migration.version());
        }

        Ok(newly_applied)
    }

    /// Roll back every migration with version > `target`, in descending
    /// order.
    pub async fn rollback_to(&self, target: MigrationVersion) -> Result<Vec<MigrationVersion>> {
        let applied = self.applied_versions().await?;
        let mut to_revert: Vec<MigrationVersion> =
            applied.into_iter().filter(|v| *v > target).collect();
        to_revert.sort_by(|a, b| b.cmp(a));

        let mut reverted = Vec::new();
        for version in &to_revert {
            if let Some(migration) = self.migrations.iter().find(|m| m.version() == *version) {
                info!(version, "rolling back migration");
                migration.down(&self.pool).await?;
                sqlx::query("DELETE FROM _migrations WHERE version = ?1")
                    .bind(version)
                    .execute(&self.pool)
                    .await?;
                reverted.push(*version);
            }
        }

        Ok(reverted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn run_applies_all_default_migrations_once() {
        let runner = MigrationRunner::new(pool().await).with_default_migrations();
        let applied = runner.run().await.unwrap();
        assert_eq!(applied, vec![1, 2, 3, 4]);

        let second_run = runner.run().await.unwrap();
        assert!(second_run.is_empty());
    }

    #[tokio::test]
    async fn rollback_reverts_in_descending_order() {
        let runner = MigrationRunner::new(pool().await).with_default_migrations();
        runner.run().await.unwrap();
        let reverted = runner.rollback_to(2).await.unwrap();
        assert_eq!(reverted, vec![4, 3]);
    }

    #[test]
    fn parse_status_extracts_change_status_attribute() {
        let xml = r#"<TEI><teiHeader><revisionDesc>
            <change status="reviewed" when="2024-01-01"/>
        </revisionDesc></teiHeader></TEI>"#;
        assert_eq!(BackfillTeiStatus::parse_status(xml), "reviewed");
    }

    #[test]
    fn parse_status_falls_back_on_malformed_xml() {
        assert_eq!(BackfillTeiStatus::parse_status("not xml at all <<<"), "unknown");
    }
}
