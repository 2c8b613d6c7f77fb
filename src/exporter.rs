//! Export catalog entries back to a human-readable directory tree.
//!
//! Grounded on `file_exporter.py`'s `FileExporter`: query+filter, gold
//! promotion for export-only consistency, filename construction,
//! grouping strategies, sed-style filename transforms, and atomic
//! (tempfile + rename) writes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, info, instrument};

use crate::blob_store::FileType;
use crate::catalog::{FileEntry, MetadataCatalog};
use crate::error::{Error, Result};

/// Grouping strategy for exported files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    /// `pdf/`, `tei/`, `versions/`.
    Type,
    /// `<collection>/{pdf,tei,versions}/`.
    Collection,
    /// `<variant>/...`, with PDFs under `pdf/`.
    Variant,
}

/// A `/search/replace/` filename transform, applied in sequence.
#[derive(Debug, Clone)]
pub struct FilenameTransform {
    search: Regex,
    replace: String,
}

impl FilenameTransform {
    /// Parse a sed-style `/search/replace/` pattern.
    pub fn parse(pattern: &str) -> Result<Self> {
        let rest = pattern
            .strip_prefix('/')
            .ok_or_else(|| Error::InvalidArgument("transform pattern must start with '/'".to_string()))?;
        let parts: Vec<&str> = rest.splitn(2, '/').collect();
        if parts.len() < 2 {
            return Err(Error::InvalidArgument(
                "transform pattern must be in format /search/replace/".to_string(),
            ));
        }
        let search = Regex::new(parts[0])
            .map_err(|e| Error::InvalidArgument(format!("invalid regex in transform: {e}")))?;
        let replace = parts[1].trim_end_matches('/').to_string();
        Ok(Self { search, replace })
    }

    fn apply(&self, filename: &str) -> String {
        self.search.replace_all(filename, self.replace.as_str()).into_owned()
    }
}

/// Filters and options for one export run.
#[derive(Debug, Clone, Default)]
pub struct ExportRequest {
    pub collections: Option<Vec<String>>,
    pub variants: Option<Vec<String>>,
    pub regex: Option<String>,
    pub include_versions: bool,
    pub group_by: Option<GroupBy>,
    pub filename_transforms: Vec<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct ExportError {
    pub content_hash: String,
    pub filename: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExportStats {
    pub files_scanned: u64,
    pub files_exported: u64,
    pub files_skipped: u64,
    pub errors: Vec<ExportError>,
}

pub struct Exporter<'a> {
    catalog: &'a MetadataCatalog,
}

impl<'a> Exporter<'a> {
    pub fn new(catalog: &'a MetadataCatalog) -> Self {
        Self { catalog }
    }

    #[instrument(skip(self, request))]
    pub async fn export_files(&self, target_path: &Path, request: &ExportRequest) -> Result<ExportStats> {
        let group_by = request.group_by.unwrap_or(GroupBy::Type);

        let transforms: Vec<FilenameTransform> = request
            .filename_transforms
            .iter()
            .map(|t| FilenameTransform::parse(t))
            .collect::<Result<_>>()?;

        let regex = request
            .regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| Error::InvalidArgument(format!("invalid export regex: {e}")))?;

        if !request.dry_run {
            tokio::fs::create_dir_all(target_path).await?;
        } else {
            info!(path = %target_path.display(), "[dry run] would create target directory");
        }

        let mut stats = ExportStats::default();
        let files = self.query_files(request).await?;
        info!(count = files.len(), "files matching export filters");

        for entry in &files {
            stats.files_scanned += 1;

            let result = self
                .export_one(target_path, entry, group_by, regex.as_ref(), &transforms, request, &mut stats)
                .await;

            if let Err(e) = result {
                stats.errors.push(ExportError {
                    content_hash: entry.content_hash.clone(),
                    filename: entry.filename.clone(),
                    error: e.to_string(),
                });
            }
        }

        info!(
            exported = stats.files_exported,
            skipped = stats.files_skipped,
            errors = stats.errors.len(),
            "export complete"
        );

        Ok(stats)
    }

    /// Export the filtered set to a directory tree under a fresh
    /// subdirectory of `work_dir`, then zip that tree into
    /// `work_dir/export-<uuid>.zip` and return its path. The caller owns
    /// the returned archive and is responsible for removing it; the
    /// intermediate export directory is always cleaned up.
    #[instrument(skip(self, request))]
    pub async fn export_archive(&self, work_dir: &Path, request: &ExportRequest) -> Result<(PathBuf, ExportStats)> {
        let run_id = uuid::Uuid::new_v4();
        let export_dir = work_dir.join(format!("export-{run_id}"));
        tokio::fs::create_dir_all(&export_dir).await?;

        let stats = self.export_files(&export_dir, request).await?;

        let archive_path = work_dir.join(format!("export-{run_id}.zip"));
        let zip_source = export_dir.clone();
        let zip_target = archive_path.clone();
        let zipped = tokio::task::spawn_blocking(move || write_zip(&zip_source, &zip_target))
            .await
            .map_err(|e| Error::InvalidArgument(format!("archive build task panicked: {e}")))?;

        let _ = tokio::fs::remove_dir_all(&export_dir).await;
        zipped?;

        Ok((archive_path, stats))
    }

    async fn export_one(
        &self,
        target_path: &Path,
        entry: &FileEntry,
        group_by: GroupBy,
        regex: Option<&Regex>,
        transforms: &[FilenameTransform],
        request: &ExportRequest,
        stats: &mut ExportStats,
    ) -> Result<()> {
        let mut filename = construct_filename(entry);

        if let Some(re) = regex {
            if !re.is_match(&filename) {
                debug!(filename, "skipping (regex filter)");
                stats.files_skipped += 1;
                return Ok(());
            }
        }

        for transform in transforms {
            filename = transform.apply(&filename);
        }

        let collections = self.resolve_collections(entry).await?;
        let output_paths = self.output_paths(target_path, entry, &collections, &filename, group_by, request);

        for output_path in output_paths {
            self.export_file(entry, &output_path, request.dry_run).await?;
            stats.files_exported += 1;
        }

        Ok(())
    }

    /// Query catalog entries matching `request`, excluding deleted rows,
    /// restricted to PDF/gold-TEI pairs (PDFs with no matching gold TEI
    /// are excluded), then run [`Self::ensure_gold_files`] so every
    /// `(doc_id, variant)` has something to export as gold even if the
    /// catalog itself has none.
    async fn query_files(&self, request: &ExportRequest) -> Result<Vec<FileEntry>> {
        let collections = request.collections.clone().unwrap_or_default();

        let (pdfs, tei): (Vec<FileEntry>, Vec<FileEntry>) = if collections.is_empty() {
            let all = self.catalog.all_entries(false).await?;
            (
                all.iter().filter(|e| e.file_type == FileType::Pdf).cloned().collect(),
                all.iter().filter(|e| e.file_type == FileType::Tei).cloned().collect(),
            )
        } else {
            let mut pdfs = Vec::new();
            for collection in &collections {
                pdfs.extend(self.catalog.list_by_collection(collection).await?.into_iter().filter(|e| e.file_type == FileType::Pdf));
            }
            let all = self.catalog.all_entries(false).await?;
            let tei: Vec<FileEntry> = all.into_iter().filter(|e| e.file_type == FileType::Tei).collect();
            (pdfs, tei)
        };

        let doc_ids: std::collections::HashSet<String> = pdfs.iter().map(|p| p.doc_id.clone()).collect();

        let mut gold: Vec<FileEntry> = tei.iter().filter(|f| f.is_gold && doc_ids.contains(&f.doc_id)).cloned().collect();
        if let Some(variants) = &request.variants {
            gold = filter_by_variants(gold, variants);
        }

        let doc_ids_with_gold: std::collections::HashSet<String> = gold.iter().map(|f| f.doc_id.clone()).collect();
        let filtered_pdfs: Vec<FileEntry> = pdfs.into_iter().filter(|p| doc_ids_with_gold.contains(&p.doc_id)).collect();

        let mut result = filtered_pdfs;
        result.extend(gold);

        if request.include_versions {
            let mut non_gold: Vec<FileEntry> = tei
                .into_iter()
                .filter(|f| !f.is_gold && doc_ids_with_gold.contains(&f.doc_id))
                .collect();
            if let Some(variants) = &request.variants {
                non_gold = filter_by_variants(non_gold, variants);
            }
            result.extend(non_gold);
        }

        Ok(self.ensure_gold_files(result))
    }

    /// Promote the highest-version entry of every goldless
    /// `(doc_id, variant)` TEI group to act as gold for this export
    /// only; the catalog itself is never written to.
    fn ensure_gold_files(&self, files: Vec<FileEntry>) -> Vec<FileEntry> {
        let mut pdfs = Vec::new();
        let mut groups: HashMap<(String, Option<String>), Vec<FileEntry>> = HashMap::new();

        for entry in files {
            if entry.file_type == FileType::Pdf {
                pdfs.push(entry);
            } else {
                groups.entry((entry.doc_id.clone(), entry.variant.clone())).or_default().push(entry);
            }
        }

        let mut result = pdfs;
        for ((doc_id, variant), mut group) in groups {
            if group.iter().any(|f| f.is_gold) {
                result.extend(group);
                continue;
            }

            group.sort_by_key(|f| (f.version.unwrap_or(0), f.created_at));
            let mut promoted = group.pop().unwrap();
            info!(
                doc_id,
                ?variant,
                version = ?promoted.version,
                "no gold file for variant, promoting highest version for export"
            );
            promoted.is_gold = true;
            result.push(promoted);
            result.extend(group);
        }

        result
    }

    /// TEI files inherit `doc_collections` from their PDF when they
    /// don't carry their own (the common case); PDFs use their own.
    async fn resolve_collections(&self, entry: &FileEntry) -> Result<Vec<String>> {
        if entry.file_type == FileType::Pdf {
            return Ok(entry.doc_collections.clone());
        }
        if !entry.doc_collections.is_empty() {
            return Ok(entry.doc_collections.clone());
        }
        let siblings = self.catalog.list_by_doc_id(&entry.doc_id).await?;
        Ok(siblings
            .into_iter()
            .find(|f| f.file_type == FileType::Pdf)
            .map(|pdf| pdf.doc_collections)
            .unwrap_or_default())
    }

    fn output_paths(
        &self,
        target_path: &Path,
        entry: &FileEntry,
        file_collections: &[String],
        filename: &str,
        group_by: GroupBy,
        request: &ExportRequest,
    ) -> Vec<PathBuf> {
        match group_by {
            GroupBy::Type => vec![target_path.join(type_subdir(entry)).join(filename)],
            GroupBy::Variant => {
                if entry.file_type == FileType::Pdf {
                    vec![target_path.join("pdf").join(filename)]
                } else {
                    let variant = entry.variant.clone().unwrap_or_else(|| "default".to_string());
                    vec![target_path.join(variant).join(filename)]
                }
            }
            GroupBy::Collection => {
                let mut collections: Vec<String> = if file_collections.is_empty() {
                    vec!["uncategorized".to_string()]
                } else {
                    file_collections.to_vec()
                };

                if let Some(requested) = &request.collections {
                    if !requested.is_empty() {
                        let filtered: Vec<String> =
                            collections.iter().filter(|c| requested.contains(c)).cloned().collect();
                        collections = if filtered.is_empty() { requested.clone() } else { filtered };
                    }
                }

                collections
                    .into_iter()
                    .map(|c| target_path.join(c).join(type_subdir(entry)).join(filename))
                    .collect()
            }
        }
    }

    async fn export_file(&self, entry: &FileEntry, output_path: &Path, dry_run: bool) -> Result<()> {
        if dry_run {
            info!(filename = %entry.filename, path = %output_path.display(), "[dry run] would export");
            return Ok(());
        }

        let content = self
            .catalog
            .blobs()
            .get(&entry.content_hash, entry.file_type)
            .await?
            .ok_or_else(|| Error::NotFound(format!("blob not found in storage: {}", entry.content_hash)))?;

        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = output_path.with_extension(format!(
            "{}.tmp",
            output_path.extension().and_then(|e| e.to_str()).unwrap_or("")
        ));

        tokio::fs::write(&temp_path, &content).await?;
        tokio::fs::rename(&temp_path, output_path).await?;

        debug!(filename = %entry.filename, path = %output_path.display(), "exported");
        Ok(())
    }
}

fn type_subdir(entry: &FileEntry) -> &'static str {
    if entry.file_type == FileType::Pdf {
        "pdf"
    } else if !entry.is_gold {
        "versions"
    } else {
        "tei"
    }
}

fn filter_by_variants(files: Vec<FileEntry>, patterns: &[String]) -> Vec<FileEntry> {
    files
        .into_iter()
        .filter(|f| {
            if f.file_type == FileType::Pdf {
                return true;
            }
            let variant = f.variant.as_deref().unwrap_or("");
            patterns.iter().any(|pattern| glob_match(pattern, variant))
        })
        .collect()
}

/// Minimal `*`-only glob matcher, matching `fnmatch`'s use in the
/// original (variant patterns only ever use `*` wildcards).
fn glob_match(pattern: &str, text: &str) -> bool {
    let regex_pattern = format!("^{}$", regex::escape(pattern).replace("\\*", ".*"));
    Regex::new(&regex_pattern).map(|re| re.is_match(text)).unwrap_or(false)
}

/// Build the export filename for a catalog entry:
/// - PDF: `<doc_id>.pdf`
/// - Gold TEI: `<doc_id>[.variant].tei.xml`
/// - Versioned TEI: `<doc_id>[.variant].v<version>.tei.xml`
fn construct_filename(entry: &FileEntry) -> String {
    let encoded_doc_id = encode_filename(&entry.doc_id);
    let extension = entry.file_type.extension();

    match entry.file_type {
        FileType::Pdf => format!("{encoded_doc_id}{extension}"),
        FileType::Tei => {
            if !entry.is_gold {
                let version = entry.version.unwrap_or(0);
                match &entry.variant {
                    Some(v) => format!("{encoded_doc_id}.{v}.v{version}{extension}"),
                    None => format!("{encoded_doc_id}.v{version}{extension}"),
                }
            } else {
                match &entry.variant {
                    Some(v) => format!("{encoded_doc_id}.{v}{extension}"),
                    None => format!("{encoded_doc_id}{extension}"),
                }
            }
        }
        FileType::Rng => format!("{encoded_doc_id}{extension}"),
    }
}

/// Replace filesystem-unsafe characters (notably `/` in DOIs) with `_`.
fn encode_filename(doc_id: &str) -> String {
    doc_id.chars().map(|c| if matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') { '_' } else { c }).collect()
}

/// Walk `source_dir` and write every file into a new deflated zip at
/// `archive_path`, using the path relative to `source_dir` as the
/// archive entry name.
fn write_zip(source_dir: &Path, archive_path: &Path) -> Result<()> {
    let file = std::fs::File::create(archive_path)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in walkdir::WalkDir::new(source_dir).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(source_dir).unwrap_or(entry.path());
        let name = relative.to_string_lossy().replace('\\', "/");

        writer.start_file(name, options)?;
        let mut source = std::fs::File::open(entry.path())?;
        std::io::copy(&mut source, &mut writer)?;
    }

    writer.finish()?;
    Ok(())
}
