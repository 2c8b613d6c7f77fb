//! Catalog-wide integrity maintenance queries used by garbage collection.

use std::collections::HashMap;

use sqlx::sqlite::SqlitePool;

use super::entry::{FileEntry, INBOX_COLLECTION};
use super::queries;
use crate::blob_store::{FileType, ShardedBlobStore};
use crate::error::Result;
use crate::refcount::RefCounter;

/// Copy `doc_collections`/`doc_metadata` from each PDF entry onto every
/// TEI entry sharing its `doc_id`. TEI rows are display-only copies;
/// the PDF row is authoritative. Returns the number of TEI rows changed.
pub async fn sync_tei_collections_with_pdf(pool: &SqlitePool) -> Result<u64> {
    let all = queries::all_entries(pool, false).await?;

    let mut pdf_by_doc: HashMap<String, &FileEntry> = HashMap::new();
    for entry in &all {
        if entry.file_type == FileType::Pdf {
            pdf_by_doc.insert(entry.doc_id.clone(), entry);
        }
    }

    let mut changed = 0u64;
    for entry in &all {
        if entry.file_type != FileType::Tei {
            continue;
        }
        let Some(pdf) = pdf_by_doc.get(&entry.doc_id) else {
            continue;
        };
        if entry.doc_collections == pdf.doc_collections && entry.doc_metadata == pdf.doc_metadata {
            continue;
        }

        let update = super::entry::FileUpdate {
            doc_collections: Some(pdf.doc_collections.clone()),
            doc_metadata: Some(pdf.doc_metadata.clone()),
            ..Default::default()
        };
        if queries::update_metadata(pool, &entry.content_hash, &update).await? {
            changed += 1;
        }
    }

    Ok(changed)
}

/// Assign [`INBOX_COLLECTION`] to every live entry whose
/// `doc_collections` is currently empty. Returns the count changed.
pub async fn assign_inbox_to_collectionless(pool: &SqlitePool) -> Result<u64> {
    let all = queries::all_entries(pool, false).await?;
    let mut changed = 0u64;

    for entry in all.into_iter().filter(|e| e.doc_collections.is_empty()) {
        let update = super::entry::FileUpdate {
            doc_collections: Some(vec![INBOX_COLLECTION.to_string()]),
            ..Default::default()
        };
        if queries::update_metadata(pool, &entry.content_hash, &update).await? {
            changed += 1;
        }
    }

    Ok(changed)
}

/// Collapse rows that share `(content_hash, doc_id, file_type)`,
/// keeping only the earliest-created one. Returns the number of rows
/// removed. Duplicate rows of this kind only arise from a bug in a
/// caller, never from normal operation, but GC still cleans them up.
///
/// Each purged row released the reference its insert acquired, so the
/// ref count is decremented the same way [`super::MetadataCatalog::delete_file`]
/// does, with the blob physically removed only once the count reaches
/// zero.
pub async fn remove_duplicate_entries(pool: &SqlitePool, refs: &RefCounter, blobs: &ShardedBlobStore) -> Result<u64> {
    let all = queries::all_entries(pool, true).await?;

    let mut groups: HashMap<(String, String, FileType), Vec<&FileEntry>> = HashMap::new();
    for entry in &all {
        groups
            .entry((entry.content_hash.clone(), entry.doc_id.clone(), entry.file_type))
            .or_default()
            .push(entry);
    }

    let mut removed = 0u64;
    for mut group in groups.into_values() {
        if group.len() <= 1 {
            continue;
        }
        group.sort_by_key(|e| e.created_at);
        for duplicate in &group[1..] {
            purge_one(pool, refs, blobs, &duplicate.content_hash, duplicate.file_type).await?;
            removed += 1;
        }
    }

    Ok(removed)
}

/// Remove a single catalog row and release the reference it held,
/// deleting the underlying blob once the count reaches zero. Split out
/// of [`remove_duplicate_entries`] so the purge-and-release contract can
/// be exercised directly in tests, independent of constructing an
/// actual duplicate-row scan result.
async fn purge_one(pool: &SqlitePool, refs: &RefCounter, blobs: &ShardedBlobStore, content_hash: &str, file_type: FileType) -> Result<()> {
    queries::purge_row(pool, content_hash).await?;
    let (_, should_delete) = refs.decrement(content_hash).await?;
    if should_delete {
        blobs.delete(content_hash, file_type).await?;
        refs.remove_entry(content_hash).await?;
    }
    Ok(())
}

/// Live TEI entries with no PDF sharing their `doc_id` — these can
/// never be displayed meaningfully and are removed by GC phase 6.
pub async fn orphaned_xml_files(pool: &SqlitePool) -> Result<Vec<FileEntry>> {
    let all = queries::all_entries(pool, false).await?;

    let doc_ids_with_pdf: std::collections::HashSet<&str> = all
        .iter()
        .filter(|e| e.file_type == FileType::Pdf)
        .map(|e| e.doc_id.as_str())
        .collect();

    Ok(all
        .into_iter()
        .filter(|e| e.file_type == FileType::Tei && !doc_ids_with_pdf.contains(e.doc_id.as_str()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::entry::FileCreate;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashMap as Map;
    use tempfile::TempDir;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::MigrationRunner::new(pool.clone())
            .with_default_migrations()
            .run()
            .await
            .unwrap();
        pool
    }

    async fn refs_and_blobs(pool: &SqlitePool) -> (TempDir, RefCounter, ShardedBlobStore) {
        let dir = TempDir::new().unwrap();
        let blobs = ShardedBlobStore::open(dir.path().join("files")).await.unwrap();
        let refs = RefCounter::new(pool.clone());
        (dir, refs, blobs)
    }

    fn create(hash: &str, doc_id: &str, file_type: FileType, collections: Vec<&str>) -> FileCreate {
        FileCreate {
            content_hash: hash.to_string(),
            stable_id: Some(format!("s-{hash}")),
            filename: format!("{hash}.bin"),
            doc_id: doc_id.to_string(),
            doc_id_type: "custom".to_string(),
            file_type,
            file_size: 10,
            label: None,
            variant: None,
            version: Some(1),
            is_gold: false,
            doc_collections: collections.into_iter().map(String::from).collect(),
            doc_metadata: Map::new(),
            file_metadata: Map::new(),
            created_by: None,
        }
    }

    #[tokio::test]
    async fn orphaned_xml_finds_tei_without_pdf() {
        let pool = pool().await;
        queries::insert_row(&pool, &create("tei1", "docA", FileType::Tei, vec!["c"]), "s-tei1")
            .await
            .unwrap();

        let orphans = orphaned_xml_files(&pool).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].content_hash, "tei1");
    }

    #[tokio::test]
    async fn assign_inbox_fixes_empty_collections() {
        let pool = pool().await;
        queries::insert_row(&pool, &create("pdf1", "docA", FileType::Pdf, vec![]), "s-pdf1")
            .await
            .unwrap();

        let changed = assign_inbox_to_collectionless(&pool).await.unwrap();
        assert_eq!(changed, 1);

        let entry = queries::get_by_hash(&pool, "pdf1", false).await.unwrap().unwrap();
        assert_eq!(entry.doc_collections, vec![INBOX_COLLECTION.to_string()]);
    }

    #[tokio::test]
    async fn remove_duplicate_entries_is_a_noop_without_duplicates() {
        // `id` is the table's primary key, so true duplicates can only
        // arise from data imported outside normal insert paths; this
        // confirms the scan doesn't misfire against ordinary rows.
        let pool = pool().await;
        let (_dir, refs, blobs) = refs_and_blobs(&pool).await;
        queries::insert_row(&pool, &create("h1", "docA", FileType::Pdf, vec!["c"]), "s-1")
            .await
            .unwrap();
        queries::insert_row(&pool, &create("h2", "docA", FileType::Tei, vec!["c"]), "s-2")
            .await
            .unwrap();

        let removed = remove_duplicate_entries(&pool, &refs, &blobs).await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn purge_one_releases_the_ref_and_keeps_the_blob_while_another_row_holds_it() {
        // `purge_one` is the per-duplicate step `remove_duplicate_entries`
        // runs over `group[1..]`; exercised directly here since a real
        // duplicate `(content_hash, doc_id, file_type)` group can't be
        // constructed through the table's `id` primary key.
        let pool = pool().await;
        let (_dir, refs, blobs) = refs_and_blobs(&pool).await;

        let (hash, _path) = blobs.put(b"dup", FileType::Pdf).await.unwrap();
        // Two logical references on the same blob, as if two rows had
        // each incremented it on insert.
        refs.increment(&hash, FileType::Pdf).await.unwrap();
        refs.increment(&hash, FileType::Pdf).await.unwrap();

        purge_one(&pool, &refs, &blobs, &hash, FileType::Pdf).await.unwrap();
        assert!(blobs.exists(&hash, FileType::Pdf).await, "blob survives while the other reference remains");

        let (_, should_delete) = refs.decrement(&hash).await.unwrap();
        assert!(should_delete, "ref count should reach zero once both references are released");
    }
}
