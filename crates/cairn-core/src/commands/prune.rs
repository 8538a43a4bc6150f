//! Apply a retention policy to the archive list and delete the rest.

use std::path::Path;

use chrono::Utc;
use tracing::info;

use cairn_types::error::{CairnError, Result};

use crate::archive::manifest::CHECKPOINT_SUFFIX;
use crate::config::RuntimeConfig;
use crate::crypto::passphrase::PromptFn;
use crate::prune::{apply_policy, PruneDecision, PruneEntry, RetentionPolicy};
use crate::repo::Access;

use super::delete::delete_archive_refs;
use super::open_session;

#[derive(Debug, Clone, Default)]
pub struct PruneOptions {
    pub policy: RetentionPolicy,
    pub dry_run: bool,
}

#[derive(Debug)]
pub struct PruneResult {
    /// Every archive with its decision, newest first.
    pub entries: Vec<PruneEntry>,
    pub archives_deleted: u64,
    pub chunks_deleted: u64,
    pub bytes_freed: u64,
}

pub fn run(
    repo_path: &Path,
    options: &PruneOptions,
    runtime: &RuntimeConfig,
    prompt: PromptFn<'_>,
) -> Result<PruneResult> {
    if !options.policy.has_any_rule() {
        return Err(CairnError::Config(
            "prune requires at least one keep rule".into(),
        ));
    }

    let mut s = open_session(repo_path, Access::ReadWrite, runtime, prompt, "")?;
    s.cache.sync_if_needed(&mut s.repo, &s.crypto, &s.manifest)?;

    // Checkpoints are partial backups, not retention candidates.
    let archives: Vec<(String, chrono::DateTime<Utc>)> = s
        .manifest
        .archives
        .iter()
        .filter(|(name, _)| !name.ends_with(CHECKPOINT_SUFFIX))
        .map(|(name, entry)| (name.clone(), entry.time))
        .collect();

    let entries = apply_policy(&archives, &options.policy, Utc::now())?;

    let mut result = PruneResult {
        entries: entries.clone(),
        archives_deleted: 0,
        chunks_deleted: 0,
        bytes_freed: 0,
    };

    if options.dry_run {
        return Ok(result);
    }

    for entry in &entries {
        if !matches!(entry.decision, PruneDecision::Prune) {
            continue;
        }
        let manifest_entry = s
            .manifest
            .remove(&entry.name)
            .ok_or_else(|| CairnError::ArchiveNotFound(entry.name.clone()))?;
        let (chunks, bytes) = delete_archive_refs(&mut s, &manifest_entry.id)?;
        result.archives_deleted += 1;
        result.chunks_deleted += chunks;
        result.bytes_freed += bytes;
        info!(archive = %entry.name, "pruned");
    }

    if result.archives_deleted > 0 {
        s.manifest.save(&mut s.repo, &mut s.crypto)?;
        s.repo.commit(None)?;
        s.cache.mark_synced(&s.manifest, &s.crypto)?;
        s.cache.save()?;
    }
    Ok(result)
}
