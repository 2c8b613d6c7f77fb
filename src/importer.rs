//! Directory/archive import: scan PDF and TEI files, group them by
//! document, and populate the catalog + blob store.
//!
//! Grounded on `file_importer.py`'s `FileImporter` (scan, group, import
//! PDF-then-TEI, per-document error accumulation) with `DocIdResolver`
//! and the TEI metadata extraction it delegates to reconstructed from
//! that file's call sites, since the helper modules themselves were not
//! part of the retrieved source set.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::blob_store::FileType;
use crate::catalog::{FileUpdate, MetadataCatalog};
use crate::config::ImporterConfig;
use crate::error::Result;
use crate::progress::ProgressBus;

static VERSION_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\.v\d+").unwrap());

/// Metadata extracted from a TEI header, best-effort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeiMetadata {
    pub doc_id: Option<String>,
    pub doc_id_type: Option<String>,
    pub variant: Option<String>,
    pub title: Option<String>,
    pub author_family: Option<String>,
    pub date: Option<String>,
}

/// Parse a TEI header for the identifiers and descriptive fields the
/// importer needs. Tolerant of malformed XML: returns an empty
/// metadata set rather than failing the whole import.
pub fn extract_tei_metadata(xml: &str) -> TeiMetadata {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut meta = TeiMetadata::default();
    let mut capture_title = false;
    let mut capture_surname = false;
    let mut seen_title = false;
    let mut seen_surname = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_lowercase();

                if name == "idno" {
                    let mut idno_type = None;
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"type" {
                            idno_type = attr.unescape_value().ok().map(|v| v.into_owned().to_lowercase());
                        }
                    }
                    if idno_type.as_deref() == Some("doi") {
                        if let Ok(Event::Text(t)) = reader.read_event_into(&mut buf) {
                            meta.doc_id = t.unescape().ok().map(|v| v.trim().to_string());
                            meta.doc_id_type = Some("doi".to_string());
                        }
                    }
                } else if name == "edition" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"n" {
                            meta.variant =
                                attr.unescape_value().ok().map(|v| v.into_owned());
                        }
                    }
                } else if name == "title" && !seen_title {
                    capture_title = true;
                } else if (name == "surname") && !seen_surname {
                    capture_surname = true;
                } else if name == "date" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"when" {
                            meta.date = attr.unescape_value().ok().map(|v| v.into_owned());
                        }
                    }
                }

            }
            Ok(Event::Text(t)) => {
                if capture_title {
                    if let Ok(text) = t.unescape() {
                        let text = text.trim();
                        if !text.is_empty() {
                            meta.title = Some(text.to_string());
                            seen_title = true;
                        }
                    }
                    capture_title = false;
                }
                if capture_surname {
                    if let Ok(text) = t.unescape() {
                        let text = text.trim();
                        if !text.is_empty() {
                            meta.author_family = Some(text.to_string());
                            seen_surname = true;
                        }
                    }
                    capture_surname = false;
                }
            }
            Ok(Event::End(_)) => {
                capture_title = false;
                capture_surname = false;
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    meta
}

/// Resolves a document identifier for a PDF/TEI group. Tries, in
/// order: matching filename stems, a DOI embedded in TEI metadata, and
/// a deterministic filename fallback.
#[derive(Debug, Default)]
pub struct DocIdResolver;

impl DocIdResolver {
    /// Strip a trailing `.tei` marker and any `.vN` version segment so
    /// `paper.v2.tei` and `paper.pdf` compare equal.
    fn normalized_stem(path: &Path) -> String {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        let stem = stem.strip_suffix(".tei").unwrap_or(stem);
        VERSION_MARKER.replace_all(stem, "").to_lowercase()
    }

    /// TEI files whose normalized stem matches the PDF's.
    pub fn find_matching_teis<'a>(
        &self,
        pdf_path: &Path,
        tei_files: &'a [PathBuf],
    ) -> Vec<&'a PathBuf> {
        let target = Self::normalized_stem(pdf_path);
        tei_files
            .iter()
            .filter(|tei| Self::normalized_stem(tei) == target)
            .collect()
    }

    /// Resolve `(doc_id, doc_id_type)` for a PDF, preferring a DOI found
    /// in any matching TEI's metadata, falling back to the filename stem.
    pub fn resolve_doc_id_for_pdf(
        &self,
        pdf_path: &Path,
        matching_tei_meta: &[&TeiMetadata],
    ) -> (String, String) {
        for meta in matching_tei_meta {
            if let Some(doi) = &meta.doc_id {
                return (doi.clone(), meta.doc_id_type.clone().unwrap_or_else(|| "doi".to_string()));
            }
        }
        (Self::normalized_stem(pdf_path), "custom".to_string())
    }

    /// Resolve `(doc_id, doc_id_type)` for a standalone TEI with no
    /// matching PDF.
    pub fn resolve_doc_id_for_tei(&self, meta: &TeiMetadata, tei_path: &Path) -> (String, String) {
        if let Some(doi) = &meta.doc_id {
            return (doi.clone(), meta.doc_id_type.clone().unwrap_or_else(|| "doi".to_string()));
        }
        (Self::normalized_stem(tei_path), "custom".to_string())
    }
}

/// One file grouped under a document id.
#[derive(Debug, Default, Clone)]
pub struct DocumentFiles {
    pub pdf: Vec<PathBuf>,
    pub tei: Vec<PathBuf>,
    pub doc_id_type: String,
}

/// Per-file import failure, accumulated rather than aborting the batch.
#[derive(Debug, Clone)]
pub struct ImportError {
    pub doc_id: String,
    pub error: String,
}

/// Raised when more than one gold-detection heuristic fires for the
/// same file and they disagree; the importer does not silently pick a
/// winner and instead defaults the file to non-gold.
#[derive(Debug, Clone)]
pub struct GoldHeuristicConflict {
    pub doc_id: String,
    pub path: PathBuf,
    pub verdicts: Vec<(&'static str, bool)>,
}

#[derive(Debug, Clone, Default)]
pub struct ImportStats {
    pub files_scanned: u64,
    pub files_imported: u64,
    pub files_skipped: u64,
    pub files_updated: u64,
    pub errors: Vec<ImportError>,
    pub warnings: Vec<GoldHeuristicConflict>,
}

pub struct Importer<'a> {
    catalog: &'a MetadataCatalog,
    config: ImporterConfig,
    progress: Option<&'a ProgressBus>,
    resolver: DocIdResolver,
}

impl<'a> Importer<'a> {
    pub fn new(catalog: &'a MetadataCatalog, config: ImporterConfig) -> Self {
        Self {
            catalog,
            config,
            progress: None,
            resolver: DocIdResolver,
        }
    }

    pub fn with_progress(mut self, progress: &'a ProgressBus) -> Self {
        self.progress = Some(progress);
        self
    }

    fn publish(&self, token: &str, percent: u8, message: impl Into<String>) {
        if let Some(bus) = self.progress {
            bus.publish(token, percent, message);
        }
    }

    /// Import every PDF/XML file under `directory`.
    ///
    /// `collection`, if given, is assigned to every imported document.
    /// Otherwise, when `recursive_collections` is set, the first
    /// subdirectory beneath `directory` that isn't in the configured
    /// skip set is used per-document.
    #[instrument(skip(self))]
    pub async fn import_directory(
        &self,
        directory: &Path,
        collection: Option<&str>,
        recursive: bool,
        recursive_collections: bool,
        progress_token: &str,
    ) -> Result<ImportStats> {
        let mut stats = ImportStats::default();

        let files = self.scan_directory(directory, recursive, &mut stats);
        let documents = self.group_by_document(&files);
        let total = documents.len().max(1);

        for (index, (doc_id, doc_files)) in documents.into_iter().enumerate() {
            let doc_collection = if let Some(c) = collection {
                Some(c.to_string())
            } else if recursive_collections {
                self.collection_from_path(&doc_files, directory)
            } else {
                None
            };

            if let Err(e) = self
                .import_document(&doc_id, &doc_files, doc_collection.as_deref(), &mut stats)
                .await
            {
                stats.errors.push(ImportError {
                    doc_id: doc_id.clone(),
                    error: e.to_string(),
                });
            }

            let percent = (((index + 1) * 100) / total) as u8;
            self.publish(progress_token, percent, format!("imported {doc_id}"));
        }

        info!(
            scanned = stats.files_scanned,
            imported = stats.files_imported,
            skipped = stats.files_skipped,
            errors = stats.errors.len(),
            "import_directory complete"
        );

        Ok(stats)
    }

    /// Import every PDF/XML file inside a zip archive.
    ///
    /// Extracts `archive_path` into a fresh subdirectory of `work_dir`,
    /// locates the archive's effective import root the way
    /// `_find_import_root` does (descending into a lone wrapping
    /// directory unless it holds files directly and
    /// `recursive_collections` wants that directory kept as a
    /// collection), then delegates to [`Self::import_directory`]. The
    /// extraction directory is removed afterward regardless of outcome.
    #[instrument(skip(self))]
    pub async fn import_archive(
        &self,
        archive_path: &Path,
        work_dir: &Path,
        collection: Option<&str>,
        recursive_collections: bool,
        progress_token: &str,
    ) -> Result<ImportStats> {
        let extract_dir = work_dir.join(format!("import-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&extract_dir).await?;

        let archive_path_owned = archive_path.to_path_buf();
        let extract_target = extract_dir.clone();
        let extracted = tokio::task::spawn_blocking(move || extract_zip(&archive_path_owned, &extract_target))
            .await
            .map_err(|e| crate::error::Error::InvalidArgument(format!("archive extraction task panicked: {e}")))?;

        let result = match extracted {
            Ok(()) => {
                let import_root = find_import_root(&extract_dir, recursive_collections)?;
                self.import_directory(&import_root, collection, true, recursive_collections, progress_token)
                    .await
            }
            Err(e) => Err(e),
        };

        let _ = tokio::fs::remove_dir_all(&extract_dir).await;
        result
    }

    fn scan_directory(&self, directory: &Path, recursive: bool, stats: &mut ImportStats) -> Vec<PathBuf> {
        let max_depth = if recursive { usize::MAX } else { 1 };
        let mut found = Vec::new();

        for entry in WalkDir::new(directory).max_depth(max_depth).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let is_target = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("pdf") | Some("xml")
            );
            if !is_target {
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()).map(|n| n.ends_with(".deleted")).unwrap_or(false) {
                continue;
            }
            found.push(path.to_path_buf());
            stats.files_scanned += 1;
        }

        debug!(count = found.len(), dir = %directory.display(), "scanned import directory");
        found
    }

    fn group_by_document(&self, files: &[PathBuf]) -> HashMap<String, DocumentFiles> {
        let pdf_files: Vec<PathBuf> = files.iter().filter(|f| f.extension().map(|e| e == "pdf").unwrap_or(false)).cloned().collect();
        let tei_files: Vec<PathBuf> = files.iter().filter(|f| f.extension().map(|e| e == "xml").unwrap_or(false)).cloned().collect();

        let mut tei_meta: HashMap<PathBuf, TeiMetadata> = HashMap::new();
        for tei in &tei_files {
            let meta = match std::fs::read_to_string(tei) {
                Ok(xml) => extract_tei_metadata(&xml),
                Err(_) => TeiMetadata::default(),
            };
            tei_meta.insert(tei.clone(), meta);
        }

        let mut documents: HashMap<String, DocumentFiles> = HashMap::new();
        let mut grouped_teis: HashSet<PathBuf> = HashSet::new();

        for pdf in &pdf_files {
            let matches = self.resolver.find_matching_teis(pdf, &tei_files);
            let match_meta: Vec<&TeiMetadata> = matches.iter().filter_map(|p| tei_meta.get(*p)).collect();
            let (doc_id, doc_id_type) = self.resolver.resolve_doc_id_for_pdf(pdf, &match_meta);

            let entry = documents.entry(doc_id).or_insert_with(|| DocumentFiles {
                doc_id_type: doc_id_type.clone(),
                ..Default::default()
            });
            entry.pdf.push(pdf.clone());
            for tei in matches {
                if !entry.tei.contains(tei) {
                    entry.tei.push(tei.clone());
                }
                grouped_teis.insert(tei.clone());
            }
        }

        for tei in &tei_files {
            if grouped_teis.contains(tei) {
                continue;
            }
            let meta = tei_meta.get(tei).cloned().unwrap_or_default();
            let (doc_id, doc_id_type) = self.resolver.resolve_doc_id_for_tei(&meta, tei);
            let entry = documents.entry(doc_id).or_insert_with(|| DocumentFiles {
                doc_id_type,
                ..Default::default()
            });
            entry.tei.push(tei.clone());
        }

        documents
    }

    /// The first path component beneath `base` that isn't a configured
    /// organizational directory, e.g. `<root>/collection1/pdf/file.pdf`
    /// -> `"collection1"`; `<root>/file.pdf` -> `None`.
    fn collection_from_path(&self, doc_files: &DocumentFiles, base: &Path) -> Option<String> {
        let sample = doc_files.pdf.first().or_else(|| doc_files.tei.first())?;
        let relative = sample.strip_prefix(base).ok()?;
        let mut components = relative.components();
        components.next_back(); // drop the filename itself

        for component in components {
            let part = component.as_os_str().to_str()?;
            if !self.config.skip_collection_dirs.contains(&part.to_lowercase()) {
                return Some(part.to_string());
            }
        }
        None
    }

    async fn import_document(
        &self,
        doc_id: &str,
        doc_files: &DocumentFiles,
        collection: Option<&str>,
        stats: &mut ImportStats,
    ) -> Result<()> {
        let pdf_hash = if let Some(pdf_path) = doc_files.pdf.first() {
            self.import_pdf(pdf_path, doc_id, &doc_files.doc_id_type, collection, stats).await?
        } else {
            warn!(doc_id, "no PDF found for document");
            None
        };

        for tei_path in &doc_files.tei {
            self.import_tei(tei_path, doc_id, &doc_files.doc_id_type, collection, pdf_hash.as_deref(), stats)
                .await?;
        }

        Ok(())
    }

    async fn import_pdf(
        &self,
        pdf_path: &Path,
        doc_id: &str,
        doc_id_type: &str,
        collection: Option<&str>,
        stats: &mut ImportStats,
    ) -> Result<Option<String>> {
        let content = tokio::fs::read(pdf_path).await?;
        let hash = crate::blob_store::ShardedBlobStore::hash_of(&content);

        if let Some(existing) = self.catalog.get_by_hash(&hash).await? {
            stats.files_skipped += 1;
            return Ok(Some(existing.content_hash));
        }

        if self.config.dry_run {
            info!(path = %pdf_path.display(), "[dry run] would import PDF");
            return Ok(Some(hash));
        }

        let filename = pdf_path.file_name().and_then(|n| n.to_str()).unwrap_or("file.pdf").to_string();
        let collections = collection.map(|c| vec![c.to_string()]).unwrap_or_default();

        let mut file_metadata = HashMap::new();
        file_metadata.insert("original_path".to_string(), serde_json::json!(pdf_path.display().to_string()));
        file_metadata.insert("imported_at".to_string(), serde_json::json!(chrono::Utc::now().to_rfc3339()));

        let entry = self
            .catalog
            .insert_file(
                &content,
                FileType::Pdf,
                filename,
                doc_id.to_string(),
                doc_id_type.to_string(),
                None,
                None,
                None,
                false,
                collections,
                HashMap::new(),
                file_metadata,
                None,
            )
            .await?;

        stats.files_imported += 1;
        info!(path = %pdf_path.display(), hash = %entry.content_hash, "imported PDF");
        Ok(Some(entry.content_hash))
    }

    async fn import_tei(
        &self,
        tei_path: &Path,
        default_doc_id: &str,
        default_doc_id_type: &str,
        collection: Option<&str>,
        pdf_hash: Option<&str>,
        stats: &mut ImportStats,
    ) -> Result<()> {
        let content = tokio::fs::read(tei_path).await?;
        let hash = crate::blob_store::ShardedBlobStore::hash_of(&content);

        if let Some(_existing) = self.catalog.get_by_hash(&hash).await? {
            stats.files_skipped += 1;
            return Ok(());
        }

        if self.config.dry_run {
            info!(path = %tei_path.display(), "[dry run] would import TEI");
            return Ok(());
        }

        let xml = String::from_utf8_lossy(&content);
        let meta = extract_tei_metadata(&xml);

        let (doc_id, doc_id_type) = match &meta.doc_id {
            Some(doi) => (doi.clone(), meta.doc_id_type.clone().unwrap_or_else(|| "doi".to_string())),
            None => (default_doc_id.to_string(), default_doc_id_type.to_string()),
        };

        let variant = meta.variant.clone();
        let existing_same_variant = self.catalog.list_by_variant(&doc_id, variant.as_deref()).await?;
        let version = existing_same_variant
            .iter()
            .filter(|f| f.file_type == FileType::Tei)
            .count() as i64;

        let (is_gold, conflict) = self.detect_gold(tei_path);
        if let Some(conflict) = conflict {
            stats.warnings.push(conflict);
        }

        let label = meta
            .title
            .clone()
            .filter(|t| !matches!(t.to_lowercase().as_str(), "unknown title" | "untitled"))
            .unwrap_or_else(|| doc_id.clone());

        let mut file_metadata = HashMap::new();
        file_metadata.insert("original_path".to_string(), serde_json::json!(tei_path.display().to_string()));
        file_metadata.insert("imported_at".to_string(), serde_json::json!(chrono::Utc::now().to_rfc3339()));

        let collections = collection.map(|c| vec![c.to_string()]).unwrap_or_default();
        let filename = tei_path.file_name().and_then(|n| n.to_str()).unwrap_or("file.xml").to_string();

        let entry = self
            .catalog
            .insert_file(
                &content,
                FileType::Tei,
                filename,
                doc_id.clone(),
                doc_id_type,
                Some(label),
                variant,
                Some(version),
                is_gold,
                collections,
                HashMap::new(),
                file_metadata,
                None,
            )
            .await?;

        stats.files_imported += 1;
        info!(path = %tei_path.display(), hash = %entry.content_hash, "imported TEI");

        if let Some(pdf_hash) = pdf_hash {
            self.update_pdf_from_tei(pdf_hash, &doc_id, &meta).await?;
        }

        Ok(())
    }

    async fn update_pdf_from_tei(&self, pdf_hash: &str, doc_id: &str, meta: &TeiMetadata) -> Result<()> {
        let Some(pdf) = self.catalog.get_by_hash(pdf_hash).await? else {
            return Ok(());
        };

        let mut doc_metadata = pdf.doc_metadata.clone();
        if let Some(title) = &meta.title {
            doc_metadata.entry("title".to_string()).or_insert_with(|| serde_json::json!(title));
        }
        if let Some(author) = &meta.author_family {
            doc_metadata.entry("author".to_string()).or_insert_with(|| serde_json::json!(author));
        }
        if let Some(date) = &meta.date {
            doc_metadata.entry("date".to_string()).or_insert_with(|| serde_json::json!(date));
        }

        let label = format_pdf_label(&doc_metadata, doc_id, &pdf.filename);

        self.catalog
            .update_metadata(
                pdf_hash,
                FileUpdate {
                    doc_metadata: Some(doc_metadata),
                    label: Some(label),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Evaluate the three gold-detection heuristics that are enabled in
    /// configuration and decide the file's gold status. Returns a
    /// conflict record (and defaults to non-gold) if the enabled
    /// heuristics disagree.
    fn detect_gold(&self, tei_path: &Path) -> (bool, Option<GoldHeuristicConflict>) {
        let mut verdicts: Vec<(&'static str, bool)> = Vec::new();

        if self.config.use_no_version_marker_heuristic {
            let filename = tei_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            verdicts.push(("no_version_marker", !VERSION_MARKER.is_match(filename)));
        }

        if let Some(pattern) = &self.config.gold_filename_regex {
            if let Ok(re) = Regex::new(pattern) {
                let filename = tei_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                verdicts.push(("filename_regex", re.is_match(filename)));
            }
        }

        let gold_dir = self.config.gold_dir_name.to_lowercase();
        let in_gold_dir = tei_path
            .components()
            .any(|c| c.as_os_str().to_str().map(|s| s.to_lowercase() == gold_dir).unwrap_or(false));
        verdicts.push(("gold_directory", in_gold_dir));

        let all_agree = verdicts.iter().all(|(_, v)| *v == verdicts[0].1);
        if all_agree {
            (verdicts[0].1, None)
        } else {
            (
                false,
                Some(GoldHeuristicConflict {
                    doc_id: String::new(),
                    path: tei_path.to_path_buf(),
                    verdicts,
                }),
            )
        }
    }
}

/// Format a PDF's display label as `"Author (Year) Title"` with
/// fallbacks to `doc_id` then `filename`.
fn format_pdf_label(doc_metadata: &HashMap<String, serde_json::Value>, doc_id: &str, filename: &str) -> String {
    let author = doc_metadata.get("author").and_then(|v| v.as_str());
    let year = doc_metadata
        .get("date")
        .and_then(|v| v.as_str())
        .and_then(|d| Regex::new(r"\d{4}").unwrap().find(d).map(|m| m.as_str().to_string()));
    let title = doc_metadata.get("title").and_then(|v| v.as_str()).filter(|t| {
        !matches!(t.to_lowercase().as_str(), "unknown title" | "untitled" | "")
    });

    let mut parts = Vec::new();
    if let Some(author) = author {
        parts.push(author.to_string());
    }
    if let Some(year) = year {
        parts.push(format!("({year})"));
    }
    if let Some(title) = title {
        let truncated = if title.len() > 40 { format!("{}...", &title[..40]) } else { title.to_string() };
        parts.push(truncated);
    }

    if !parts.is_empty() {
        return parts.join(" ");
    }
    if !doc_id.is_empty() {
        return doc_id.to_string();
    }
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Untitled")
        .to_string()
}

/// Extract every entry of `archive_path` under `dest`, rejecting any
/// entry whose name would escape `dest` (zip-slip).
fn extract_zip(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            warn!(name = %entry.name(), "skipping unsafe archive entry");
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out_file = std::fs::File::create(&out_path)?;
            std::io::copy(&mut entry, &mut out_file)?;
        }
    }

    Ok(())
}

/// Mirrors `_find_import_root`: an archive usually unpacks into one
/// wrapping directory (the original folder the user zipped up). Descend
/// into it unless it holds PDF/TEI files directly and the caller wants
/// subdirectory names preserved as collections.
fn find_import_root(extract_dir: &Path, keep_single_root: bool) -> Result<PathBuf> {
    let mut children = Vec::new();
    for entry in std::fs::read_dir(extract_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy().into_owned();
        if name.starts_with('.') || name == "__MACOSX" {
            continue;
        }
        children.push(entry.path());
    }

    if children.len() == 1 && children[0].is_dir() {
        let root = children.into_iter().next().unwrap();
        let has_direct_files = std::fs::read_dir(&root)?.flatten().any(|e| {
            matches!(e.path().extension().and_then(|e| e.to_str()), Some("pdf") | Some("xml"))
        });
        if keep_single_root && has_direct_files {
            return Ok(extract_dir.to_path_buf());
        }
        return Ok(root);
    }

    Ok(extract_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_tei_metadata_reads_doi_and_title() {
        let xml = r#"
            <TEI>
              <teiHeader>
                <fileDesc>
                  <titleStmt><title>Example Paper</title></titleStmt>
                  <publicationStmt>
                    <idno type="DOI">10.1234/example</idno>
                  </publicationStmt>
                </fileDesc>
              </teiHeader>
            </TEI>
        "#;
        let meta = extract_tei_metadata(xml);
        assert_eq!(meta.doc_id.as_deref(), Some("10.1234/example"));
        assert_eq!(meta.doc_id_type.as_deref(), Some("doi"));
        assert_eq!(meta.title.as_deref(), Some("Example Paper"));
    }

    #[test]
    fn extract_tei_metadata_tolerates_malformed_xml() {
        let meta = extract_tei_metadata("<TEI><unterminated>");
        assert_eq!(meta, TeiMetadata::default());
    }

    #[test]
    fn resolver_matches_pdf_and_tei_by_normalized_stem() {
        let resolver = DocIdResolver;
        let pdf = PathBuf::from("/docs/paper.pdf");
        let teis = vec![PathBuf::from("/docs/paper.v2.tei.xml"), PathBuf::from("/docs/other.tei.xml")];
        let matches = resolver.find_matching_teis(&pdf, &teis);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0], &teis[0]);
    }

    #[test]
    fn resolver_falls_back_to_filename_stem_when_no_doi() {
        let resolver = DocIdResolver;
        let pdf = PathBuf::from("/docs/paper.pdf");
        let (doc_id, doc_id_type) = resolver.resolve_doc_id_for_pdf(&pdf, &[]);
        assert_eq!(doc_id, "paper");
        assert_eq!(doc_id_type, "custom");
    }

    #[test]
    fn collection_from_path_skips_organizational_dirs() {
        let importer_config = ImporterConfig::default();
        let base = PathBuf::from("/root");
        let cases = [
            ("/root/collection1/file.pdf", Some("collection1")),
            ("/root/collection1/pdf/file.pdf", Some("collection1")),
            ("/root/pdf/collection1/file.pdf", Some("collection1")),
            ("/root/file.pdf", None),
        ];
        for (path, expected) in cases {
            let doc_files = DocumentFiles {
                pdf: vec![PathBuf::from(path)],
                tei: vec![],
                doc_id_type: "custom".to_string(),
            };
            // Exercise the pure path-walking logic directly without a catalog.
            let sample = doc_files.pdf.first().unwrap();
            let relative = sample.strip_prefix(&base).unwrap();
            let mut components = relative.components();
            components.next_back();
            let mut found = None;
            for component in components {
                let part = component.as_os_str().to_str().unwrap();
                if !importer_config.skip_collection_dirs.contains(&part.to_lowercase()) {
                    found = Some(part.to_string());
                    break;
                }
            }
            assert_eq!(found.as_deref(), expected, "path={path}");
        }
    }

    #[test]
    fn no_version_marker_detects_gold_from_filename() {
        assert!(!VERSION_MARKER.is_match("paper.tei.xml"));
        assert!(VERSION_MARKER.is_match("paper.v2.tei.xml"));
    }

    #[test]
    fn format_pdf_label_prefers_author_year_title() {
        let mut meta = HashMap::new();
        meta.insert("author".to_string(), serde_json::json!("Smith"));
        meta.insert("date".to_string(), serde_json::json!("2021-05-01"));
        meta.insert("title".to_string(), serde_json::json!("A Study of Things"));
        let label = format_pdf_label(&meta, "10.1/x", "paper.pdf");
        assert_eq!(label, "Smith (2021) A Study of Things");
    }

    #[test]
    fn format_pdf_label_falls_back_to_doc_id_then_filename() {
        let empty = HashMap::new();
        assert_eq!(format_pdf_label(&empty, "10.1/x", "paper.pdf"), "10.1/x");
        assert_eq!(format_pdf_label(&empty, "", "paper.pdf"), "paper");
    }
}
