//! Client-side caches: the chunks index and the files index.
//!
//! Both live under `<cache base>/<repo id hex>/`. The chunks index file
//! records the manifest token it was synchronised against; when the
//! repository's manifest moved on without us (another client wrote), the
//! index is rebuilt by enumerating every archive's item stream and summing
//! refcounts.

pub mod chunks;
pub mod files;

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cairn_types::error::Result;

use crate::archive::manifest::Manifest;
use crate::archive::{Archive, ItemStreamReader};
use crate::config::RuntimeConfig;
use crate::crypto::{CryptoContext, ObjectType};
use crate::repo::Repository;

use self::chunks::ChunksIndex;
use self::files::FilesIndex;

#[derive(Debug, Serialize, Deserialize)]
struct ChunksFile {
    manifest_token: Vec<u8>,
    chunks: ChunksIndex,
}

#[derive(Debug, Serialize, Deserialize)]
struct FilesFile {
    files: FilesIndex,
}

pub struct Cache {
    /// `None` for a purely in-memory cache.
    dir: Option<PathBuf>,
    /// Distinguishes parallel files indices for disjoint backup sources.
    files_suffix: String,
    pub chunks: ChunksIndex,
    pub files: FilesIndex,
    manifest_token: Vec<u8>,
}

impl Cache {
    /// Open (or freshly create) the cache for a repository. Unreadable or
    /// corrupt cache files silently start fresh; the resync against the
    /// manifest restores correctness.
    pub fn open(config: &RuntimeConfig, repo_id: &[u8], files_suffix: &str) -> Self {
        let dir = config.cache_base().map(|base| base.join(hex::encode(repo_id)));
        let mut cache = Self {
            dir,
            files_suffix: files_suffix.to_string(),
            chunks: ChunksIndex::new(),
            files: FilesIndex::new(),
            manifest_token: Vec::new(),
        };
        cache.load();
        cache
    }

    pub fn in_memory() -> Self {
        Self {
            dir: None,
            files_suffix: String::new(),
            chunks: ChunksIndex::new(),
            files: FilesIndex::new(),
            manifest_token: Vec::new(),
        }
    }

    fn chunks_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join("chunks"))
    }

    fn files_path(&self) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|d| d.join(format!("files{}", self.files_suffix)))
    }

    fn load(&mut self) {
        if let Some(path) = self.chunks_path() {
            if let Ok(data) = fs::read(&path) {
                match rmp_serde::from_slice::<ChunksFile>(&data) {
                    Ok(file) => {
                        self.chunks = file.chunks;
                        self.manifest_token = file.manifest_token;
                    }
                    Err(e) => debug!("chunks cache unreadable, starting fresh: {e}"),
                }
            }
        }
        if let Some(path) = self.files_path() {
            if let Ok(data) = fs::read(&path) {
                match rmp_serde::from_slice::<FilesFile>(&data) {
                    Ok(file) => self.files = file.files,
                    Err(e) => debug!("files cache unreadable, starting fresh: {e}"),
                }
            }
        }
    }

    /// Persist both indices. No-op for in-memory caches.
    pub fn save(&self) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;
        if let Some(path) = self.chunks_path() {
            let file = ChunksFile {
                manifest_token: self.manifest_token.clone(),
                chunks: self.chunks.clone(),
            };
            fs::write(path, rmp_serde::to_vec(&file)?)?;
        }
        if let Some(path) = self.files_path() {
            let file = FilesFile {
                files: self.files.clone(),
            };
            fs::write(path, rmp_serde::to_vec(&file)?)?;
        }
        Ok(())
    }

    /// Record that the chunks index now reflects this manifest.
    pub fn mark_synced(&mut self, manifest: &Manifest, crypto: &CryptoContext) -> Result<()> {
        self.manifest_token = manifest.sync_token(crypto.keys())?;
        Ok(())
    }

    /// Bring the chunks index in line with the manifest, rebuilding it
    /// from the archive graph if the stored token does not match.
    /// Returns whether a rebuild happened.
    pub fn sync_if_needed(
        &mut self,
        repo: &mut Repository,
        crypto: &CryptoContext,
        manifest: &Manifest,
    ) -> Result<bool> {
        let token = manifest.sync_token(crypto.keys())?;
        if token == self.manifest_token {
            return Ok(false);
        }

        info!("chunks index out of sync with manifest, rebuilding");
        let mut chunks = ChunksIndex::new();
        for (name, entry) in &manifest.archives {
            debug!(archive = %name, "resync: reading item stream");
            let (archive, size, csize) = Archive::load_with_sizes(repo, crypto, &entry.id)?;
            chunks.add(entry.id, size, csize);

            for ptr in &archive.item_ptrs {
                let (plaintext, csize) =
                    crate::archive::fetch_chunk(repo, crypto, ObjectType::ItemStream, ptr)?;
                chunks.add(*ptr, plaintext.len() as u32, csize);
            }

            let reader = ItemStreamReader::new(repo, crypto, archive.item_ptrs.clone());
            reader.for_each(|item| {
                for chunk_ref in &item.chunks {
                    chunks.add(chunk_ref.id, chunk_ref.size, chunk_ref.csize);
                }
                Ok(())
            })?;
        }

        self.chunks = chunks;
        self.manifest_token = token;

        // Files-index entries may reference chunks that no longer exist.
        let chunks_ref = &self.chunks;
        let removed = self
            .files
            .prune_stale_entries(&|id| chunks_ref.contains(id));
        if removed > 0 {
            debug!(removed, "dropped files-cache entries with missing chunks");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_cache_saves_nowhere() {
        let cache = Cache::in_memory();
        cache.save().unwrap();
    }

    #[test]
    fn cache_files_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            cache_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let repo_id = [7u8; 32];

        let mut cache = Cache::open(&config, &repo_id, "");
        cache.chunks.add(cairn_types::chunk_id::ChunkId([1; 32]), 10, 5);
        cache
            .files
            .insert("a".into(), 1, 10, 20, 30, vec![]);
        cache.manifest_token = vec![9, 9, 9];
        cache.save().unwrap();

        let cache = Cache::open(&config, &repo_id, "");
        assert!(cache.chunks.contains(&cairn_types::chunk_id::ChunkId([1; 32])));
        assert!(cache.files.get("a").is_some());
        assert_eq!(cache.manifest_token, vec![9, 9, 9]);
    }

    #[test]
    fn files_suffix_separates_indices() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            cache_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let repo_id = [7u8; 32];

        let mut cache = Cache::open(&config, &repo_id, ".home");
        cache.files.insert("h".into(), 1, 1, 1, 1, vec![]);
        cache.save().unwrap();

        let other = Cache::open(&config, &repo_id, ".etc");
        assert!(other.files.is_empty());
        let same = Cache::open(&config, &repo_id, ".home");
        assert!(same.files.get("h").is_some());
    }
}
