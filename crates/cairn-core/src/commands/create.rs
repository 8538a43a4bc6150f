//! Create an archive: walk the sources, short-circuit unchanged files via
//! the files index, chunk and store new data, stream item records, and
//! finally publish the archive in the manifest.
//!
//! Long runs flush checkpoint archives (`<name>.checkpoint`) so an
//! interrupted backup leaves a usable partial snapshot behind; each
//! checkpoint replaces the previous one and the final archive replaces
//! the last checkpoint.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use cairn_types::chunk_id::ChunkId;
use cairn_types::error::{CairnError, Result};

use crate::archive::item::{normalize_path, ChunkRef, Item, ItemType};
use crate::archive::manifest::CHECKPOINT_SUFFIX;
use crate::archive::{store_chunk, Archive, ArchiveStats, ItemStreamWriter};
use crate::chunker::Chunker;
use crate::compress::Compression;
use crate::config::{RuntimeConfig, DEFAULT_CHECKPOINT_INTERVAL_SECS, DEFAULT_FILES_CACHE_TTL};
use crate::crypto::passphrase::PromptFn;
use crate::crypto::ObjectType;
use crate::placeholders::{replace_placeholders, validate_archive_name, PlaceholderContext};
use crate::platform;
use crate::repo::Access;
use crate::walk::{build_walker, is_soft_io_error, is_soft_walk_error, Matcher};

use super::{open_session, Session};

const READ_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Clone)]
pub struct CreateOptions {
    /// Archive name template; placeholders are expanded at create time.
    pub archive_name: String,
    pub paths: Vec<PathBuf>,
    pub matcher: Option<Matcher>,
    /// Compression spec override; falls back to the manifest default.
    pub compression: Option<String>,
    pub comment: String,
    pub command_line: Vec<String>,
    pub checkpoint_interval: Duration,
    pub files_cache_suffix: String,
    pub files_cache_ttl: u8,
    /// Skip the inode comparison in the files index (filesystems with
    /// unstable inodes).
    pub ignore_inode: bool,
    /// Cooperative cancellation: when set, the writer flushes a checkpoint
    /// archive and returns early.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            archive_name: "{hostname}-{utcnow}".into(),
            paths: Vec::new(),
            matcher: None,
            compression: None,
            comment: String::new(),
            command_line: Vec::new(),
            checkpoint_interval: Duration::from_secs(DEFAULT_CHECKPOINT_INTERVAL_SECS),
            files_cache_suffix: String::new(),
            files_cache_ttl: DEFAULT_FILES_CACHE_TTL,
            ignore_inode: false,
            cancel: None,
        }
    }
}

#[derive(Debug)]
pub struct CreateResult {
    pub name: String,
    pub archive_id: ChunkId,
    pub stats: ArchiveStats,
    /// True when cancellation flushed a checkpoint instead of the full
    /// archive; `name` is then the checkpoint name.
    pub cancelled: bool,
}

/// Caches uid/gid to name lookups for the duration of one run.
#[derive(Default)]
struct OwnerNames {
    users: HashMap<u32, Option<String>>,
    groups: HashMap<u32, Option<String>>,
}

impl OwnerNames {
    fn user(&mut self, uid: u32) -> Option<String> {
        self.users
            .entry(uid)
            .or_insert_with(|| lookup_user(uid))
            .clone()
    }

    fn group(&mut self, gid: u32) -> Option<String> {
        self.groups
            .entry(gid)
            .or_insert_with(|| lookup_group(gid))
            .clone()
    }
}

#[cfg(unix)]
fn lookup_user(uid: u32) -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
}

#[cfg(unix)]
fn lookup_group(gid: u32) -> Option<String> {
    nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|g| g.name)
}

#[cfg(not(unix))]
fn lookup_user(_uid: u32) -> Option<String> {
    None
}

#[cfg(not(unix))]
fn lookup_group(_gid: u32) -> Option<String> {
    None
}

/// Everything accumulated while an archive is being written.
struct ArchiveBuild {
    name: String,
    comment: String,
    command_line: Vec<String>,
    compression_spec: String,
    compression: Compression,
    writer: ItemStreamWriter,
    item_ptrs: Vec<ChunkId>,
    stats: ArchiveStats,
    time_start: DateTime<Utc>,
    ctx: PlaceholderContext,
    /// (device, inode) of already-seen multi-link files.
    hard_links: HashMap<(u64, u64), String>,
    prev_checkpoint: Option<(String, ChunkId)>,
}

impl ArchiveBuild {
    /// Store every meta-chunk the item stream has completed so far.
    fn store_complete_meta(&mut self, s: &mut Session) -> Result<()> {
        for chunk in self.writer.take_complete() {
            self.store_meta_chunk(s, chunk)?;
        }
        Ok(())
    }

    fn store_meta_chunk(&mut self, s: &mut Session, chunk: Vec<u8>) -> Result<()> {
        let (chunk_ref, new) = store_chunk(
            &mut s.repo,
            &mut s.crypto,
            &mut s.cache.chunks,
            ObjectType::ItemStream,
            &crate::archive::metadata_compression(),
            &chunk,
        )?;
        self.stats.original_size += chunk_ref.size as u64;
        self.stats.compressed_size += chunk_ref.csize as u64;
        if new {
            self.stats.deduplicated_size += chunk_ref.csize as u64;
        }
        self.item_ptrs.push(chunk_ref.id);
        Ok(())
    }

    fn push_item(&mut self, s: &mut Session, item: &Item) -> Result<()> {
        self.writer.push_item(item)?;
        self.store_complete_meta(s)
    }

    /// Flush the partial item-stream chunk and write an archive object
    /// under `name`, leaving the stream ready to continue.
    fn write_archive_object(&mut self, s: &mut Session, name: &str) -> Result<ChunkId> {
        for chunk in self.writer.flush() {
            self.store_meta_chunk(s, chunk)?;
        }
        let archive = Archive {
            version: 1,
            name: name.to_string(),
            comment: self.comment.clone(),
            hostname: self.ctx.hostname.clone(),
            username: self.ctx.user.clone(),
            command_line: self.command_line.clone(),
            time_start: self.time_start,
            time_end: Utc::now(),
            chunker_params: s.manifest.config.chunker_params.clone(),
            compression: self.compression_spec.clone(),
            item_ptrs: self.item_ptrs.clone(),
            stats: self.stats.clone(),
        };
        let (id, size, csize) = archive.save(&mut s.repo, &mut s.crypto)?;
        s.cache.chunks.add(id, size, csize);
        Ok(id)
    }

    /// Drop the previous checkpoint, if any. Only the archive object goes:
    /// its chunk references transferred to the successor archive.
    fn drop_prev_checkpoint(&mut self, s: &mut Session) -> Result<()> {
        if let Some((ckpt_name, ckpt_id)) = self.prev_checkpoint.take() {
            s.manifest.remove(&ckpt_name);
            if let Some((rc, _)) = s.cache.chunks.decrement(&ckpt_id) {
                if rc == 0 {
                    s.repo.delete(&ckpt_id)?;
                }
            }
        }
        Ok(())
    }

    /// Publish a checkpoint archive and commit the transaction so work up
    /// to here survives interruption.
    fn checkpoint(&mut self, s: &mut Session) -> Result<ChunkId> {
        let ckpt_name = format!("{}{}", self.name, CHECKPOINT_SUFFIX);
        debug!(name = %ckpt_name, "writing checkpoint archive");
        let id = self.write_archive_object(s, &ckpt_name)?;
        self.drop_prev_checkpoint(s)?;
        s.manifest.insert(ckpt_name.clone(), id, Utc::now());
        s.manifest.save(&mut s.repo, &mut s.crypto)?;
        s.repo.commit(None)?;
        s.cache.mark_synced(&s.manifest, &s.crypto)?;
        if let Err(e) = s.cache.save() {
            warn!("failed to save cache after checkpoint: {e}");
        }
        self.prev_checkpoint = Some((ckpt_name, id));
        Ok(id)
    }
}

pub fn run(
    repo_path: &Path,
    options: &CreateOptions,
    runtime: &RuntimeConfig,
    prompt: PromptFn<'_>,
) -> Result<CreateResult> {
    let ctx = PlaceholderContext::capture();
    let name = replace_placeholders(&options.archive_name, &ctx)?;
    validate_archive_name(&name)?;

    let mut s = open_session(
        repo_path,
        Access::ReadWrite,
        runtime,
        prompt,
        &options.files_cache_suffix,
    )?;
    if s.manifest.get(&name).is_some() {
        return Err(CairnError::ArchiveAlreadyExists(name));
    }
    s.cache.sync_if_needed(&mut s.repo, &s.crypto, &s.manifest)?;

    // Age the files index and drop entries whose chunks are gone; cache
    // hits below skip per-chunk existence checks and rely on this.
    s.cache.files.begin_generation();
    {
        let chunks = &s.cache.chunks;
        s.cache.files.prune_stale_entries(&|id| chunks.contains(id));
    }

    let compression_spec = options
        .compression
        .clone()
        .or_else(|| s.manifest.config.compression.clone())
        .unwrap_or_else(|| "auto,lz4".to_string());
    let compression = Compression::from_spec(&compression_spec)?;

    let mut build = ArchiveBuild {
        name: name.clone(),
        comment: options.comment.clone(),
        command_line: options.command_line.clone(),
        compression_spec,
        compression,
        writer: ItemStreamWriter::new()?,
        item_ptrs: Vec::new(),
        stats: ArchiveStats::default(),
        time_start: Utc::now(),
        ctx,
        hard_links: HashMap::new(),
        prev_checkpoint: None,
    };
    let mut owners = OwnerNames::default();
    let mut last_checkpoint = Instant::now();
    let mut cancelled = false;

    'sources: for source in &options.paths {
        let walker = build_walker(source, options.matcher.clone())?;
        for entry in walker {
            if let Some(cancel) = &options.cancel {
                if cancel.load(Ordering::Relaxed) {
                    info!("cancellation requested, flushing checkpoint");
                    cancelled = true;
                    break 'sources;
                }
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if is_soft_walk_error(&e) => {
                    warn!("skipping unreadable entry: {e}");
                    build.stats.errors += 1;
                    continue;
                }
                Err(e) => return Err(CairnError::Other(format!("walk failed: {e}"))),
            };

            match process_entry(&mut s, &mut build, &mut owners, entry.path(), options) {
                Ok(()) => {}
                Err(CairnError::Io(e)) if is_soft_io_error(&e) => {
                    warn!(path = %entry.path().display(), "skipping: {e}");
                    build.stats.errors += 1;
                }
                Err(e) => return Err(e),
            }

            if last_checkpoint.elapsed() >= options.checkpoint_interval {
                build.checkpoint(&mut s)?;
                last_checkpoint = Instant::now();
            }
        }
    }

    let final_name = if cancelled {
        format!("{name}{CHECKPOINT_SUFFIX}")
    } else {
        name
    };
    let id = build.write_archive_object(&mut s, &final_name)?;
    build.drop_prev_checkpoint(&mut s)?;
    s.manifest.insert(final_name.clone(), id, Utc::now());
    s.manifest.save(&mut s.repo, &mut s.crypto)?;
    s.repo.commit(None)?;

    s.cache.files.evict_older_than(options.files_cache_ttl);
    s.cache.mark_synced(&s.manifest, &s.crypto)?;
    s.cache.save()?;

    info!(
        archive = %final_name,
        files = build.stats.nfiles,
        original = build.stats.original_size,
        deduplicated = build.stats.deduplicated_size,
        "archive written"
    );
    Ok(CreateResult {
        name: final_name,
        archive_id: id,
        stats: build.stats,
        cancelled,
    })
}

/// Capture one filesystem entry as an item and feed it to the stream.
fn process_entry(
    s: &mut Session,
    build: &mut ArchiveBuild,
    owners: &mut OwnerNames,
    path: &Path,
    options: &CreateOptions,
) -> Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    let summary = platform::summarize_metadata(&meta);
    let stored_path = normalize_path(path);
    if stored_path.is_empty() {
        return Ok(());
    }

    let mut item = Item {
        path: stored_path.clone(),
        item_type: ItemType::Directory,
        mode: summary.mode & 0o7777,
        uid: summary.uid,
        gid: summary.gid,
        user: owners.user(summary.uid),
        group: owners.group(summary.gid),
        mtime_ns: summary.mtime_ns,
        atime_ns: summary.atime_ns,
        ctime_ns: Some(summary.ctime_ns),
        birthtime_ns: summary.birthtime_ns,
        size: 0,
        chunks: Vec::new(),
        source: None,
        rdev: None,
        xattrs: None,
        broken: false,
        chunks_healthy: None,
    };

    let file_type = meta.file_type();
    if file_type.is_dir() {
        item.item_type = ItemType::Directory;
    } else if file_type.is_symlink() {
        item.item_type = ItemType::Symlink;
        item.source = Some(std::fs::read_link(path)?.to_string_lossy().into_owned());
    } else if file_type.is_file() {
        if summary.nlink > 1 {
            if let Some(master) = build.hard_links.get(&(summary.device, summary.inode)) {
                item.item_type = ItemType::Hardlink;
                item.source = Some(master.clone());
                build.push_item(s, &item)?;
                return Ok(());
            }
            build
                .hard_links
                .insert((summary.device, summary.inode), stored_path.clone());
        }
        item.item_type = ItemType::RegularFile;
        process_file_content(s, build, &mut item, path, &summary, options)?;
        build.stats.nfiles += 1;
    } else {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if file_type.is_fifo() {
                item.item_type = ItemType::Fifo;
            } else if file_type.is_char_device() {
                item.item_type = ItemType::CharDevice;
                item.rdev = Some(summary.rdev);
            } else if file_type.is_block_device() {
                item.item_type = ItemType::BlockDevice;
                item.rdev = Some(summary.rdev);
            } else {
                // Sockets and other ephemera are not archived.
                return Ok(());
            }
        }
        #[cfg(not(unix))]
        {
            return Ok(());
        }
    }

    build.push_item(s, &item)
}

/// Chunk and store a regular file's content, or reuse the cached chunk
/// list when the files index proves it unchanged.
fn process_file_content(
    s: &mut Session,
    build: &mut ArchiveBuild,
    item: &mut Item,
    path: &Path,
    summary: &platform::MetadataSummary,
    options: &CreateOptions,
) -> Result<()> {
    if let Some(cached) = s.cache.files.lookup(
        &item.path,
        summary.inode,
        summary.size,
        summary.mtime_ns,
        summary.ctime_ns,
        options.ignore_inode,
    ) {
        let refs = cached.clone();
        for chunk_ref in &refs {
            s.cache
                .chunks
                .add(chunk_ref.id, chunk_ref.size, chunk_ref.csize);
            build.stats.original_size += chunk_ref.size as u64;
            build.stats.compressed_size += chunk_ref.csize as u64;
        }
        item.size = refs.iter().map(|r| r.size as u64).sum();
        item.chunks = refs;
        return Ok(());
    }

    let mut file = std::fs::File::open(path)?;
    let mut chunker = Chunker::new(&s.manifest.config.chunker_params)?;
    let mut refs: Vec<ChunkRef> = Vec::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for chunk in chunker.push(&buf[..n]) {
            store_file_chunk(s, build, &mut refs, &chunk)?;
        }
    }
    if let Some(chunk) = chunker.finish() {
        store_file_chunk(s, build, &mut refs, &chunk)?;
    }

    item.size = refs.iter().map(|r| r.size as u64).sum();
    item.chunks = refs.clone();
    s.cache.files.insert(
        item.path.clone(),
        summary.inode,
        summary.size,
        summary.mtime_ns,
        summary.ctime_ns,
        refs,
    );
    Ok(())
}

fn store_file_chunk(
    s: &mut Session,
    build: &mut ArchiveBuild,
    refs: &mut Vec<ChunkRef>,
    data: &[u8],
) -> Result<()> {
    let (chunk_ref, new) = store_chunk(
        &mut s.repo,
        &mut s.crypto,
        &mut s.cache.chunks,
        ObjectType::FileChunk,
        &build.compression,
        data,
    )?;
    build.stats.original_size += chunk_ref.size as u64;
    build.stats.compressed_size += chunk_ref.csize as u64;
    if new {
        build.stats.deduplicated_size += chunk_ref.csize as u64;
    }
    refs.push(chunk_ref);
    Ok(())
}
