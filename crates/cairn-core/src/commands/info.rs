//! Repository and archive statistics.

use std::path::Path;

use cairn_types::error::{CairnError, Result};

use crate::archive::{Archive, ArchiveStats};
use crate::config::RuntimeConfig;
use crate::crypto::passphrase::PromptFn;
use crate::repo::Access;

use super::open_session;

#[derive(Debug, Default)]
pub struct RepoInfo {
    pub archive_count: usize,
    pub total_chunks: usize,
    /// Sum of plaintext bytes across all references.
    pub original_size: u64,
    /// Sum of stored bytes across all references.
    pub compressed_size: u64,
    /// Stored bytes counting each chunk once: the actual repository
    /// footprint of live data.
    pub deduplicated_size: u64,
}

/// Repository-wide statistics derived from the synchronised chunks index.
pub fn repository(
    repo_path: &Path,
    runtime: &RuntimeConfig,
    prompt: PromptFn<'_>,
) -> Result<RepoInfo> {
    let mut s = open_session(repo_path, Access::ReadOnly, runtime, prompt, "")?;
    s.cache.sync_if_needed(&mut s.repo, &s.crypto, &s.manifest)?;
    let _ = s.cache.save();

    let mut info = RepoInfo {
        archive_count: s.manifest.archive_names(false).len(),
        total_chunks: s.cache.chunks.len(),
        ..Default::default()
    };
    for (_, entry) in s.cache.chunks.iter() {
        info.original_size += entry.size as u64 * entry.refcount as u64;
        info.compressed_size += entry.csize as u64 * entry.refcount as u64;
        info.deduplicated_size += entry.csize as u64;
    }
    Ok(info)
}

/// Statistics recorded in one archive's metadata.
pub fn archive(
    repo_path: &Path,
    archive_name: &str,
    runtime: &RuntimeConfig,
    prompt: PromptFn<'_>,
) -> Result<ArchiveStats> {
    let mut s = open_session(repo_path, Access::ReadOnly, runtime, prompt, "")?;
    let entry = s
        .manifest
        .get(archive_name)
        .copied()
        .ok_or_else(|| CairnError::ArchiveNotFound(archive_name.to_string()))?;
    let archive = Archive::load(&mut s.repo, &s.crypto, &entry.id)?;
    Ok(archive.stats)
}
