//! Delete archives: decrement refcounts across each archive's transitive
//! closure and issue repository DELETEs for chunks reaching zero.

use std::path::Path;

use tracing::{debug, info};

use cairn_types::error::{CairnError, Result};

use crate::archive::{Archive, ItemStreamReader};
use crate::config::RuntimeConfig;
use crate::crypto::passphrase::PromptFn;
use crate::repo::Access;

use super::{open_session, Session};

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub archives: Vec<String>,
    /// Report what would happen without changing anything.
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct DeleteStats {
    pub archives_deleted: u64,
    pub chunks_deleted: u64,
    pub bytes_freed: u64,
}

pub fn run(
    repo_path: &Path,
    options: &DeleteOptions,
    runtime: &RuntimeConfig,
    prompt: PromptFn<'_>,
) -> Result<DeleteStats> {
    let mut s = open_session(repo_path, Access::ReadWrite, runtime, prompt, "")?;
    s.cache.sync_if_needed(&mut s.repo, &s.crypto, &s.manifest)?;

    // Resolve all names up front so one typo aborts before side effects.
    for name in &options.archives {
        if s.manifest.get(name).is_none() {
            return Err(CairnError::ArchiveNotFound(name.clone()));
        }
    }

    let mut stats = DeleteStats::default();
    if options.dry_run {
        stats.archives_deleted = options.archives.len() as u64;
        return Ok(stats);
    }

    for name in &options.archives {
        let entry = s.manifest.remove(name).expect("checked above");
        let (chunks, bytes) = delete_archive_refs(&mut s, &entry.id)?;
        stats.archives_deleted += 1;
        stats.chunks_deleted += chunks;
        stats.bytes_freed += bytes;
        info!(archive = %name, chunks, bytes, "archive deleted");
    }

    s.manifest.save(&mut s.repo, &mut s.crypto)?;
    s.repo.commit(None)?;
    s.cache.mark_synced(&s.manifest, &s.crypto)?;
    s.cache.save()?;
    Ok(stats)
}

/// Drop every reference an archive holds: file chunks, item-stream
/// chunks, and the archive object itself. Chunks whose refcount reaches
/// zero get repository DELETE entries. Returns `(chunks_deleted, bytes)`.
pub(super) fn delete_archive_refs(s: &mut Session, archive_id: &cairn_types::chunk_id::ChunkId) -> Result<(u64, u64)> {
    let archive = Archive::load(&mut s.repo, &s.crypto, archive_id)?;

    let mut deleted: u64 = 0;
    let mut freed: u64 = 0;
    let mut drop_ref = |s: &mut Session, id: &cairn_types::chunk_id::ChunkId| -> Result<()> {
        if let Some((rc, entry)) = s.cache.chunks.decrement(id) {
            if rc == 0 {
                s.repo.delete(id)?;
                deleted += 1;
                freed += entry.csize as u64;
            }
        }
        Ok(())
    };

    // File chunks first, while the item stream is still readable.
    let mut data_refs: Vec<cairn_types::chunk_id::ChunkId> = Vec::new();
    {
        let reader = ItemStreamReader::new(&mut s.repo, &s.crypto, archive.item_ptrs.clone());
        reader.for_each(|item| {
            data_refs.extend(item.chunks.iter().map(|c| c.id));
            Ok(())
        })?;
    }
    for id in &data_refs {
        drop_ref(s, id)?;
    }
    for ptr in &archive.item_ptrs {
        drop_ref(s, ptr)?;
    }
    drop_ref(s, archive_id)?;

    debug!(chunks = deleted, bytes = freed, "archive references dropped");
    Ok((deleted, freed))
}
