//! List archives, or the items of one archive.

use std::path::Path;

use chrono::{DateTime, Utc};

use cairn_types::chunk_id::ChunkId;
use cairn_types::error::{CairnError, Result};

use crate::archive::item::Item;
use crate::archive::{Archive, ItemStreamReader};
use crate::config::RuntimeConfig;
use crate::crypto::passphrase::PromptFn;
use crate::repo::Access;

use super::open_session;

#[derive(Debug, Clone)]
pub struct ArchiveListing {
    pub name: String,
    pub id: ChunkId,
    pub time: DateTime<Utc>,
}

/// List archives, newest last. Checkpoint archives are hidden unless
/// `consider_checkpoints` is set.
pub fn archives(
    repo_path: &Path,
    consider_checkpoints: bool,
    runtime: &RuntimeConfig,
    prompt: PromptFn<'_>,
) -> Result<Vec<ArchiveListing>> {
    let s = open_session(repo_path, Access::ReadOnly, runtime, prompt, "")?;
    let mut out: Vec<ArchiveListing> = s
        .manifest
        .archive_names(consider_checkpoints)
        .into_iter()
        .map(|name| {
            let entry = s.manifest.get(name).expect("name from manifest");
            ArchiveListing {
                name: name.to_string(),
                id: entry.id,
                time: entry.time,
            }
        })
        .collect();
    out.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.name.cmp(&b.name)));
    Ok(out)
}

/// Stream the items of one archive into a callback, in archive order.
pub fn items(
    repo_path: &Path,
    archive_name: &str,
    runtime: &RuntimeConfig,
    prompt: PromptFn<'_>,
    f: impl FnMut(Item) -> Result<()>,
) -> Result<()> {
    let mut s = open_session(repo_path, Access::ReadOnly, runtime, prompt, "")?;
    let entry = s
        .manifest
        .get(archive_name)
        .copied()
        .ok_or_else(|| CairnError::ArchiveNotFound(archive_name.to_string()))?;
    let archive = Archive::load(&mut s.repo, &s.crypto, &entry.id)?;
    let reader = ItemStreamReader::new(&mut s.repo, &s.crypto, archive.item_ptrs);
    reader.for_each(f)
}
