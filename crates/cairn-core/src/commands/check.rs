//! Archive-graph verification and repair, layered on the structural
//! repository check.
//!
//! The graph pass walks manifest → archives → item streams → chunk
//! references, verifying that everything referenced exists; with
//! `verify_data` every referenced object is decrypted and its id
//! recomputed. Repair removes archives whose metadata object is gone,
//! drops undecodable item-stream regions, substitutes all-zero chunks for
//! lost data chunks (marking items broken and remembering the original
//! list), and heals previously broken items once their real chunks are
//! back.

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use cairn_types::chunk_id::ChunkId;
use cairn_types::error::Result;

use crate::archive::item::Item;
use crate::archive::{fetch_chunk, store_chunk, Archive, ItemDecoder, ItemStreamWriter};
use crate::compress::Compression;
use crate::config::RuntimeConfig;
use crate::crypto::passphrase::PromptFn;
use crate::crypto::ObjectType;
use crate::repo::check::{RepoCheckOptions, RepoCheckReport};
use crate::repo::Access;

use super::{open_session, Session};

#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    /// Salvage damaged segments, rebuild the index, and fix the archive
    /// graph.
    pub repair: bool,
    /// Decrypt every referenced object and re-verify its id.
    pub verify_data: bool,
    /// Bound the structural pass; the graph pass is skipped, and the next
    /// bounded run resumes where this one stopped.
    pub max_duration: Option<Duration>,
}

#[derive(Debug)]
pub struct CheckError {
    pub context: String,
    pub message: String,
}

#[derive(Debug)]
pub struct CheckReport {
    pub repo: RepoCheckReport,
    pub archives_checked: usize,
    pub items_checked: u64,
    pub chunks_verified: u64,
    pub completed: bool,
    pub errors: Vec<CheckError>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.repo.is_ok() && self.errors.is_empty()
    }
}

pub fn run(
    repo_path: &Path,
    options: &CheckOptions,
    runtime: &RuntimeConfig,
    prompt: PromptFn<'_>,
) -> Result<CheckReport> {
    let mut s = open_session(repo_path, Access::ReadWrite, runtime, prompt, "")?;

    let repo_report = s.repo.check(&RepoCheckOptions {
        repair: options.repair,
        max_duration: options.max_duration,
    })?;

    let mut report = CheckReport {
        completed: repo_report.completed,
        repo: repo_report,
        archives_checked: 0,
        items_checked: 0,
        chunks_verified: 0,
        errors: Vec::new(),
    };

    // A bounded run is structural only; resume and finish before walking
    // the archive graph.
    if options.max_duration.is_some() || !report.completed {
        return Ok(report);
    }

    s.cache.sync_if_needed(&mut s.repo, &s.crypto, &s.manifest)?;

    let names: Vec<String> = s
        .manifest
        .archive_names(true)
        .into_iter()
        .map(String::from)
        .collect();
    let mut manifest_changed = false;

    for name in names {
        let entry = match s.manifest.get(&name) {
            Some(entry) => *entry,
            None => continue,
        };

        let archive = match Archive::load(&mut s.repo, &s.crypto, &entry.id) {
            Ok(archive) => archive,
            Err(e) => {
                report.errors.push(CheckError {
                    context: format!("archive '{name}'"),
                    message: format!("metadata object unreadable: {e}"),
                });
                if options.repair {
                    warn!(archive = %name, "removing archive with lost metadata");
                    s.manifest.remove(&name);
                    manifest_changed = true;
                }
                continue;
            }
        };

        let needs_rewrite = inspect_archive(&mut s, &name, &archive, options, &mut report)?;
        report.archives_checked += 1;

        if options.repair && needs_rewrite {
            rewrite_archive(&mut s, &name, &archive, &entry.id, options, &mut report)?;
            manifest_changed = true;
        }
    }

    if options.repair && (manifest_changed || !report.repo.is_ok()) {
        s.manifest.save(&mut s.repo, &mut s.crypto)?;
        s.repo.commit(None)?;
        s.cache.mark_synced(&s.manifest, &s.crypto)?;
        s.cache.save()?;
        info!("repair finished");
    }

    Ok(report)
}

/// Whether a file chunk is intact: present, and (with `verify_data`)
/// decryptable with a matching id.
fn chunk_ok(s: &mut Session, options: &CheckOptions, id: &ChunkId) -> bool {
    if !s.repo.contains(id) {
        return false;
    }
    if !options.verify_data {
        return true;
    }
    fetch_chunk(&mut s.repo, &s.crypto, ObjectType::FileChunk, id).is_ok()
}

/// Read-only pass over one archive. Records errors; returns whether a
/// repair rewrite would change anything.
fn inspect_archive(
    s: &mut Session,
    name: &str,
    archive: &Archive,
    options: &CheckOptions,
    report: &mut CheckReport,
) -> Result<bool> {
    let mut needs_rewrite = false;

    let gaps = stream_items_tolerant(s, &archive.item_ptrs, |s, item| {
        report.items_checked += 1;
        let mut missing = 0usize;
        for chunk_ref in &item.chunks {
            let ok = chunk_ok(s, options, &chunk_ref.id);
            if options.verify_data {
                report.chunks_verified += 1;
            }
            if !ok {
                missing += 1;
            }
        }
        if missing > 0 {
            report.errors.push(CheckError {
                context: format!("archive '{name}' file '{}'", item.path),
                message: format!("{missing} content chunk(s) missing or corrupt"),
            });
            needs_rewrite = true;
        }
        // A broken item whose original chunks are all back can be healed.
        if item.broken {
            if let Some(healthy) = &item.chunks_healthy {
                if healthy.iter().all(|cr| chunk_ok(s, options, &cr.id)) {
                    needs_rewrite = true;
                }
            }
        }
        Ok(())
    })?;

    for (context, message) in gaps {
        report.errors.push(CheckError {
            context: format!("archive '{name}' {context}"),
            message,
        });
        needs_rewrite = true;
    }
    Ok(needs_rewrite)
}

/// Repair rewrite: re-stream the archive applying zero-chunk substitution
/// and healing, store the new item stream, republish under the same name,
/// and drop the old generation's references.
fn rewrite_archive(
    s: &mut Session,
    name: &str,
    old: &Archive,
    old_id: &ChunkId,
    options: &CheckOptions,
    report: &mut CheckReport,
) -> Result<()> {
    warn!(archive = %name, "rewriting archive during repair");
    let mut writer = ItemStreamWriter::new()?;
    let mut item_ptrs: Vec<ChunkId> = Vec::new();

    let store_meta = |s: &mut Session, ptrs: &mut Vec<ChunkId>, chunks: Vec<Vec<u8>>| -> Result<()> {
        for chunk in chunks {
            let (chunk_ref, _) = store_chunk(
                &mut s.repo,
                &mut s.crypto,
                &mut s.cache.chunks,
                ObjectType::ItemStream,
                &crate::archive::metadata_compression(),
                &chunk,
            )?;
            ptrs.push(chunk_ref.id);
        }
        Ok(())
    };

    // Every branch registers one cache reference per chunk the rewritten
    // item ends up holding, so the new stream's refcounts stay exact.
    let rewrite_item = |s: &mut Session, mut item: Item| -> Result<Item> {
        // Heal first: if the original chunks all came back, restore them.
        if item.broken {
            if let Some(healthy) = item.chunks_healthy.clone() {
                if healthy.iter().all(|cr| chunk_ok(s, options, &cr.id)) {
                    info!(path = %item.path, "healed previously broken item");
                    item.chunks = healthy;
                    item.chunks_healthy = None;
                    item.broken = false;
                    for chunk_ref in &item.chunks {
                        s.cache
                            .chunks
                            .add(chunk_ref.id, chunk_ref.size, chunk_ref.csize);
                    }
                    return Ok(item);
                }
            }
        }

        let any_missing = item
            .chunks
            .iter()
            .any(|cr| !chunk_ok(s, options, &cr.id));
        if !any_missing {
            for chunk_ref in &item.chunks {
                s.cache
                    .chunks
                    .add(chunk_ref.id, chunk_ref.size, chunk_ref.csize);
            }
            return Ok(item);
        }

        // Substitute an all-zero chunk of the original plaintext size for
        // every lost chunk so the file keeps its length.
        let original = item.chunks.clone();
        let mut replaced = Vec::with_capacity(item.chunks.len());
        for chunk_ref in &item.chunks {
            if chunk_ok(s, options, &chunk_ref.id) {
                // Re-register the surviving reference for the new stream.
                s.cache
                    .chunks
                    .add(chunk_ref.id, chunk_ref.size, chunk_ref.csize);
                replaced.push(chunk_ref.clone());
            } else {
                let zeros = vec![0u8; chunk_ref.size as usize];
                let (zero_ref, _) = store_chunk(
                    &mut s.repo,
                    &mut s.crypto,
                    &mut s.cache.chunks,
                    ObjectType::FileChunk,
                    &Compression::Lz4,
                    &zeros,
                )?;
                replaced.push(zero_ref);
            }
        }
        if item.chunks_healthy.is_none() {
            item.chunks_healthy = Some(original);
        }
        item.chunks = replaced;
        item.broken = true;
        Ok(item)
    };

    let gaps = {
        let mut gap_list = Vec::new();
        let mut decoder = ItemDecoder::new();
        let mut ptr_iter = old.item_ptrs.clone().into_iter();
        loop {
            match decoder.next_item() {
                Ok(Some(item)) => {
                    let fixed = rewrite_item(s, item)?;
                    writer.push_item(&fixed)?;
                    let complete = writer.take_complete();
                    store_meta(s, &mut item_ptrs, complete)?;
                }
                Ok(None) => match ptr_iter.next() {
                    Some(ptr) => {
                        match fetch_chunk(&mut s.repo, &s.crypto, ObjectType::ItemStream, &ptr) {
                            Ok((plaintext, _)) => decoder.feed(&plaintext),
                            Err(e) => {
                                gap_list.push(format!("meta-chunk {ptr}: {e}"));
                                decoder.reset();
                            }
                        }
                    }
                    None => break,
                },
                Err(e) => {
                    gap_list.push(format!("undecodable item records: {e}"));
                    decoder.reset();
                }
            }
        }
        gap_list
    };
    for gap in gaps {
        report.errors.push(CheckError {
            context: format!("archive '{name}' repair"),
            message: format!("dropped items: {gap}"),
        });
    }

    let complete = writer.flush();
    store_meta(s, &mut item_ptrs, complete)?;

    let new = Archive {
        item_ptrs,
        ..old.clone()
    };
    let (new_id, size, csize) = new.save(&mut s.repo, &mut s.crypto)?;
    s.cache.chunks.add(new_id, size, csize);
    let time = s
        .manifest
        .get(name)
        .map(|e| e.time)
        .unwrap_or(old.time_start);
    s.manifest.insert(name.to_string(), new_id, time);

    // Drop the old generation's bookkeeping: meta chunks, data references
    // (healed/substituted lists), and the old archive object.
    drop_old_generation(s, old, old_id)?;
    Ok(())
}

/// Decrement the old archive generation's references after a rewrite.
/// Chunks reaching zero get DELETEs; already-missing chunks are skipped.
fn drop_old_generation(s: &mut Session, old: &Archive, old_id: &ChunkId) -> Result<()> {
    // Old data references, collected from the *old* stream where readable.
    let mut old_refs: Vec<ChunkId> = Vec::new();
    stream_items_tolerant(s, &old.item_ptrs, |_s, item| {
        old_refs.extend(item.chunks.iter().map(|c| c.id));
        Ok(())
    })?;

    for id in old_refs.iter().chain(old.item_ptrs.iter()).chain([old_id]) {
        if let Some((rc, _)) = s.cache.chunks.decrement(id) {
            if rc == 0 && s.repo.contains(id) {
                s.repo.delete(id)?;
            }
        }
    }
    Ok(())
}

/// Stream an archive's items, tolerating missing or undecodable
/// meta-chunks. Returns the list of gaps as `(context, message)` pairs.
fn stream_items_tolerant(
    s: &mut Session,
    ptrs: &[ChunkId],
    mut f: impl FnMut(&mut Session, Item) -> Result<()>,
) -> Result<Vec<(String, String)>> {
    let mut gaps = Vec::new();
    let mut decoder = ItemDecoder::new();
    let mut ptr_iter = ptrs.iter();
    loop {
        match decoder.next_item() {
            Ok(Some(item)) => f(s, item)?,
            Ok(None) => match ptr_iter.next() {
                Some(ptr) => {
                    match fetch_chunk(&mut s.repo, &s.crypto, ObjectType::ItemStream, ptr) {
                        Ok((plaintext, _)) => decoder.feed(&plaintext),
                        Err(e) => {
                            gaps.push((
                                "item stream".to_string(),
                                format!("meta-chunk {ptr} unreadable: {e}"),
                            ));
                            decoder.reset();
                        }
                    }
                }
                None => break,
            },
            Err(e) => {
                gaps.push((
                    "item stream".to_string(),
                    format!("undecodable item records: {e}"),
                ));
                decoder.reset();
            }
        }
    }
    Ok(gaps)
}
