//! Content-addressed, hash-sharded blob storage.
//!
//! Blobs are persisted as `<root>/<hash[0:2]>/<hash><ext>`, mirroring the
//! two-character shard prefix used by the teacher's `sharding` module's
//! directory-based strategy, but fixed to content hash rather than a
//! configurable shard key. Deduplication falls out of content addressing:
//! two `put()`s of identical bytes resolve to the same path and the
//! second is a no-op.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::error::{Error, Result};

/// The three blob kinds the catalog tracks. The tag only ever
/// determines the on-disk extension; it carries no other meaning to
/// the store itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Tei,
    Rng,
}

impl FileType {
    /// On-disk extension for this type, including the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            FileType::Pdf => ".pdf",
            FileType::Tei => ".tei.xml",
            FileType::Rng => ".rng",
        }
    }

    /// Parse from the catalog's string representation.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pdf" => Ok(FileType::Pdf),
            "tei" => Ok(FileType::Tei),
            "rng" => Ok(FileType::Rng),
            other => Err(Error::InvalidArgument(format!("unknown file_type: {other}"))),
        }
    }

    /// String representation stored in the catalog.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Tei => "tei",
            FileType::Rng => "rng",
        }
    }

    /// Recover a file type and bare hash from a shard filename, e.g.
    /// `abc123....tei.xml` -> `(Tei, "abc123...")`. Returns `None` for
    /// filenames that don't match a known extension.
    pub fn split_filename(filename: &str) -> Option<(Self, &str)> {
        if let Some(hash) = filename.strip_suffix(".tei.xml") {
            Some((FileType::Tei, hash))
        } else if let Some(hash) = filename.strip_suffix(".pdf") {
            Some((FileType::Pdf, hash))
        } else if let Some(hash) = filename.strip_suffix(".rng") {
            Some((FileType::Rng, hash))
        } else {
            None
        }
    }
}

/// Breakdown of stored blobs by type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeCounts {
    pub pdf: u64,
    pub tei: u64,
    pub rng: u64,
}

/// Aggregate storage statistics, as returned by [`ShardedBlobStore::stats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_shards: u64,
    pub total_files: u64,
    pub total_size: u64,
    pub files_by_type: TypeCounts,
}

/// A content-addressed blob store rooted at a directory.
#[derive(Debug, Clone)]
pub struct ShardedBlobStore {
    root: PathBuf,
}

impl ShardedBlobStore {
    /// Open (creating if necessary) a blob store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard_dir(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[..2])
    }

    fn path_for(&self, hash: &str, file_type: FileType) -> PathBuf {
        self.shard_dir(hash)
            .join(format!("{hash}{}", file_type.extension()))
    }

    /// Compute the SHA-256 hash of `content` as a lowercase hex string.
    pub fn hash_of(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        hex::encode(hasher.finalize())
    }

    /// Persist `content`, returning its hash and on-disk path. If a blob
    /// with this hash already exists it is left untouched
    /// (deduplication) and its existing path is returned.
    ///
    /// Writes go to a temporary sibling file first, then an atomic
    /// rename into place, so a crash mid-write never leaves a partial
    /// blob visible under its final name.
    pub async fn put(&self, content: &[u8], file_type: FileType) -> Result<(String, PathBuf)> {
        let hash = Self::hash_of(content);
        let path = self.path_for(&hash, file_type);

        if fs::metadata(&path).await.is_ok() {
            return Ok((hash, path));
        }

        let shard_dir = self.shard_dir(&hash);
        fs::create_dir_all(&shard_dir).await?;

        let tmp_path = path.with_extension(format!(
            "{}.tmp-{}",
            path.extension().and_then(|e| e.to_str()).unwrap_or(""),
            uuid::Uuid::new_v4()
        ));

        let write_result = fs::write(&tmp_path, content).await;
        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        Ok((hash, path))
    }

    /// Read the bytes of a blob, or `None` if it doesn't exist.
    pub async fn get(&self, hash: &str, file_type: FileType) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(hash, file_type);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a blob. Returns `true` if a file was removed. If the
    /// shard directory is empty afterward, it is removed too.
    pub async fn delete(&self, hash: &str, file_type: FileType) -> Result<bool> {
        let path = self.path_for(hash, file_type);
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.cleanup_empty_shard(&self.shard_dir(hash)).await;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn cleanup_empty_shard(&self, shard_dir: &Path) {
        if let Ok(mut entries) = fs::read_dir(shard_dir).await {
            if entries.next_entry().await.ok().flatten().is_none() {
                let _ = fs::remove_dir(shard_dir).await;
            }
        }
    }

    /// Check whether a blob exists without reading it.
    pub async fn exists(&self, hash: &str, file_type: FileType) -> bool {
        fs::metadata(self.path_for(hash, file_type)).await.is_ok()
    }

    /// Reread a blob and recompute its hash, returning whether the
    /// stored bytes still match the expected hash.
    pub async fn verify(&self, hash: &str, file_type: FileType) -> Result<bool> {
        match self.get(hash, file_type).await? {
            Some(content) => Ok(Self::hash_of(&content) == hash),
            None => Ok(false),
        }
    }

    /// Scan the store and compute aggregate statistics.
    pub async fn stats(&self) -> Result<StorageStats> {
        let mut stats = StorageStats::default();

        let mut shards = fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            let meta = shard.metadata().await?;
            if !meta.is_dir() || shard.file_name().len() != 2 {
                continue;
            }
            stats.total_shards += 1;

            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let file_meta = file.metadata().await?;
                if !file_meta.is_file() {
                    continue;
                }
                stats.total_files += 1;
                stats.total_size += file_meta.len();

                let name = file.file_name();
                let name = name.to_string_lossy();
                match FileType::split_filename(&name) {
                    Some((FileType::Pdf, _)) => stats.files_by_type.pdf += 1,
                    Some((FileType::Tei, _)) => stats.files_by_type.tei += 1,
                    Some((FileType::Rng, _)) => stats.files_by_type.rng += 1,
                    None => {}
                }
            }
        }

        Ok(stats)
    }

    /// List every `(hash, file_type)` pair physically present on disk.
    /// Used by [`crate::refcount::RefCounter::orphans`] and garbage
    /// collection.
    pub async fn list_all(&self) -> Result<Vec<(String, FileType)>> {
        let mut out = Vec::new();

        let mut shards = match fs::read_dir(&self.root).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };

        while let Some(shard) = shards.next_entry().await? {
            if !shard.metadata().await?.is_dir() || shard.file_name().len() != 2 {
                continue;
            }
            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                if !file.metadata().await?.is_file() {
                    continue;
                }
                let name = file.file_name();
                let name = name.to_string_lossy();
                if let Some((file_type, hash)) = FileType::split_filename(&name) {
                    out.push((hash.to_string(), file_type));
                }
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (ShardedBlobStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardedBlobStore::open(dir.path()).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn put_dedupes_identical_content() {
        let (store, _dir) = store().await;
        let (h1, p1) = store.put(b"hello", FileType::Pdf).await.unwrap();
        let (h2, p2) = store.put(b"hello", FileType::Pdf).await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(p1, p2);
        assert!(store.exists(&h1, FileType::Pdf).await);
    }

    #[tokio::test]
    async fn different_content_never_collides() {
        let (store, _dir) = store().await;
        let (h1, _) = store.put(b"a", FileType::Pdf).await.unwrap();
        let (h2, _) = store.put(b"b", FileType::Pdf).await.unwrap();
        assert_ne!(h1, h2);
    }

    #[tokio::test]
    async fn delete_removes_file_and_empty_shard() {
        let (store, _dir) = store().await;
        let (hash, path) = store.put(b"content", FileType::Tei).await.unwrap();
        assert!(store.delete(&hash, FileType::Tei).await.unwrap());
        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn delete_missing_returns_false() {
        let (store, _dir) = store().await;
        assert!(!store.delete("deadbeef", FileType::Pdf).await.unwrap());
    }

    #[tokio::test]
    async fn verify_detects_no_corruption() {
        let (store, _dir) = store().await;
        let (hash, _) = store.put(b"payload", FileType::Rng).await.unwrap();
        assert!(store.verify(&hash, FileType::Rng).await.unwrap());
    }

    #[tokio::test]
    async fn stats_counts_by_type() {
        let (store, _dir) = store().await;
        store.put(b"one", FileType::Pdf).await.unwrap();
        store.put(b"two", FileType::Tei).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.files_by_type.pdf, 1);
        assert_eq!(stats.files_by_type.tei, 1);
    }

    #[tokio::test]
    async fn list_all_round_trips_type_and_hash() {
        let (store, _dir) = store().await;
        let (hash, _) = store.put(b"content", FileType::Rng).await.unwrap();
        let all = store.list_all().await.unwrap();
        assert_eq!(all, vec![(hash, FileType::Rng)]);
    }
}
