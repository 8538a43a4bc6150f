//! Rewrite archives with different chunker or compression parameters.
//!
//! Operates archive by archive: stream the old items, re-chunk file
//! content through the new parameters, store the result, publish the new
//! archive object under the same name, then drop the old references. Item
//! identity (paths, metadata, order) is preserved exactly.

use std::path::Path;

use tracing::info;

use cairn_types::chunk_id::ChunkId;
use cairn_types::error::{CairnError, Result};

use crate::archive::item::{ChunkRef, Item};
use crate::archive::manifest::CHECKPOINT_SUFFIX;
use crate::archive::{store_chunk, Archive, ItemDecoder, ItemStreamWriter};
use crate::chunker::Chunker;
use crate::compress::Compression;
use crate::config::{ChunkerParams, RuntimeConfig};
use crate::crypto::passphrase::PromptFn;
use crate::crypto::ObjectType;
use crate::repo::Access;

use super::delete::delete_archive_refs;
use super::{open_session, Session};

#[derive(Debug, Clone, Default)]
pub struct RecreateOptions {
    /// Archives to rewrite; empty means all (checkpoints excluded).
    pub archives: Vec<String>,
    /// New chunker parameters; `None` keeps each archive's own.
    pub chunker_params: Option<ChunkerParams>,
    /// New compression spec; `None` keeps each archive's own.
    pub compression: Option<String>,
    /// Replace the archive comment.
    pub comment: Option<String>,
}

#[derive(Debug, Default)]
pub struct RecreateStats {
    pub archives_recreated: u64,
    pub chunks_deleted: u64,
    pub bytes_freed: u64,
}

pub fn run(
    repo_path: &Path,
    options: &RecreateOptions,
    runtime: &RuntimeConfig,
    prompt: PromptFn<'_>,
) -> Result<RecreateStats> {
    if let Some(params) = &options.chunker_params {
        params.validate()?;
    }
    if let Some(spec) = &options.compression {
        Compression::from_spec(spec)?;
    }

    let mut s = open_session(repo_path, Access::ReadWrite, runtime, prompt, "")?;
    s.cache.sync_if_needed(&mut s.repo, &s.crypto, &s.manifest)?;

    let targets: Vec<String> = if options.archives.is_empty() {
        s.manifest
            .archive_names(false)
            .into_iter()
            .map(String::from)
            .collect()
    } else {
        for name in &options.archives {
            if name.ends_with(CHECKPOINT_SUFFIX) {
                return Err(CairnError::InvalidArchiveName(name.clone()));
            }
            if s.manifest.get(name).is_none() {
                return Err(CairnError::ArchiveNotFound(name.clone()));
            }
        }
        options.archives.clone()
    };

    let mut stats = RecreateStats::default();
    for name in &targets {
        let entry = *s
            .manifest
            .get(name)
            .ok_or_else(|| CairnError::ArchiveNotFound(name.clone()))?;
        let (chunks, bytes) = recreate_one(&mut s, name, &entry.id, options)?;
        stats.archives_recreated += 1;
        stats.chunks_deleted += chunks;
        stats.bytes_freed += bytes;
    }
    Ok(stats)
}

fn recreate_one(
    s: &mut Session,
    name: &str,
    old_id: &ChunkId,
    options: &RecreateOptions,
) -> Result<(u64, u64)> {
    let old = Archive::load(&mut s.repo, &s.crypto, old_id)?;
    let chunker_params = options
        .chunker_params
        .clone()
        .unwrap_or_else(|| old.chunker_params.clone());
    let compression_spec = options
        .compression
        .clone()
        .unwrap_or_else(|| old.compression.clone());
    let compression = Compression::from_spec(&compression_spec)?;

    info!(
        archive = %name,
        compression = %compression_spec,
        "recreating archive"
    );

    let mut writer = ItemStreamWriter::new()?;
    let mut item_ptrs: Vec<ChunkId> = Vec::new();

    // Stream old items; the decoder keeps repo free for chunk traffic.
    let mut decoder = ItemDecoder::new();
    let mut old_ptrs = old.item_ptrs.iter();
    loop {
        let mut item = match decoder.next_item()? {
            Some(item) => item,
            None => match old_ptrs.next() {
                Some(ptr) => {
                    let (plaintext, _) = crate::archive::fetch_chunk(
                        &mut s.repo,
                        &s.crypto,
                        ObjectType::ItemStream,
                        ptr,
                    )?;
                    decoder.feed(&plaintext);
                    continue;
                }
                None => break,
            },
        };

        if !item.chunks.is_empty() {
            item.chunks = rechunk_content(s, &item, &chunker_params, &compression)?;
            item.size = item.chunks_size();
        }
        writer.push_item(&item)?;
        for chunk in writer.take_complete() {
            item_ptrs.push(store_meta(s, &chunk)?);
        }
    }
    for chunk in writer.flush() {
        item_ptrs.push(store_meta(s, &chunk)?);
    }

    let new = Archive {
        comment: options.comment.clone().unwrap_or(old.comment.clone()),
        chunker_params,
        compression: compression_spec,
        item_ptrs,
        ..old.clone()
    };
    let (new_id, size, csize) = new.save(&mut s.repo, &mut s.crypto)?;
    s.cache.chunks.add(new_id, size, csize);
    // Keep the original manifest timestamp: recreation is not a new backup.
    let time = s.manifest.get(name).map(|e| e.time).unwrap_or(old.time_start);
    s.manifest.insert(name.to_string(), new_id, time);

    // New references are in place; now the old generation can go.
    let freed = delete_archive_refs(s, old_id)?;
    s.manifest.save(&mut s.repo, &mut s.crypto)?;
    s.repo.commit(None)?;
    s.cache.mark_synced(&s.manifest, &s.crypto)?;
    s.cache.save()?;
    Ok(freed)
}

/// Re-chunk one file's content: fetch the old chunks in order, feed them
/// through the new chunker, store what comes out.
fn rechunk_content(
    s: &mut Session,
    item: &Item,
    params: &ChunkerParams,
    compression: &Compression,
) -> Result<Vec<ChunkRef>> {
    let mut chunker = Chunker::new(params)?;
    let mut refs: Vec<ChunkRef> = Vec::new();

    for old_ref in &item.chunks {
        let (plaintext, _) =
            crate::archive::fetch_chunk(&mut s.repo, &s.crypto, ObjectType::FileChunk, &old_ref.id)?;
        for chunk in chunker.push(&plaintext) {
            refs.push(store_data(s, compression, &chunk)?);
        }
    }
    if let Some(chunk) = chunker.finish() {
        refs.push(store_data(s, compression, &chunk)?);
    }
    Ok(refs)
}

fn store_meta(s: &mut Session, chunk: &[u8]) -> Result<ChunkId> {
    let (chunk_ref, _) = store_chunk(
        &mut s.repo,
        &mut s.crypto,
        &mut s.cache.chunks,
        ObjectType::ItemStream,
        &crate::archive::metadata_compression(),
        chunk,
    )?;
    Ok(chunk_ref.id)
}

fn store_data(s: &mut Session, compression: &Compression, chunk: &[u8]) -> Result<ChunkRef> {
    let (chunk_ref, _) = store_chunk(
        &mut s.repo,
        &mut s.crypto,
        &mut s.cache.chunks,
        ObjectType::FileChunk,
        compression,
        chunk,
    )?;
    Ok(chunk_ref)
}
