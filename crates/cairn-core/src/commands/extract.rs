//! Restore an archive into a destination directory.
//!
//! Items are streamed in archive order: directories first create their
//! skeleton, file content is fetched chunk by chunk (each decrypted,
//! decompressed, and id-verified), and directory mtimes are fixed up last
//! so restoring children does not disturb them.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use tracing::{info, warn};

use cairn_types::error::{CairnError, Result};

use crate::archive::item::{Item, ItemType};
use crate::archive::{fetch_chunk, Archive, ItemDecoder};
use crate::config::RuntimeConfig;
use crate::crypto::passphrase::PromptFn;
use crate::crypto::ObjectType;
use crate::platform;
use crate::repo::Access;
use crate::walk::Matcher;

use super::open_session;

#[derive(Clone, Default)]
pub struct ExtractOptions {
    pub archive: String,
    pub dest: PathBuf,
    /// Restrict extraction to matching item paths.
    pub matcher: Option<Matcher>,
}

#[derive(Debug, Default)]
pub struct ExtractStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub specials: u64,
    pub hardlinks: u64,
    pub bytes: u64,
    pub errors: u64,
}

pub fn run(
    repo_path: &Path,
    options: &ExtractOptions,
    runtime: &RuntimeConfig,
    prompt: PromptFn<'_>,
) -> Result<ExtractStats> {
    let mut s = open_session(repo_path, Access::ReadOnly, runtime, prompt, "")?;

    let entry = s
        .manifest
        .get(&options.archive)
        .copied()
        .ok_or_else(|| CairnError::ArchiveNotFound(options.archive.clone()))?;
    let archive = Archive::load(&mut s.repo, &s.crypto, &entry.id)?;

    let mut stats = ExtractStats::default();
    let mut dir_times: Vec<(PathBuf, i64)> = Vec::new();

    // Stream items: fetch meta-chunks one at a time, restore each item as
    // soon as it decodes. The archive is never materialised in memory.
    let mut decoder = ItemDecoder::new();
    let mut ptrs = archive.item_ptrs.iter();
    loop {
        let item = match decoder.next_item()? {
            Some(item) => item,
            None => match ptrs.next() {
                Some(ptr) => {
                    let (plaintext, _) =
                        fetch_chunk(&mut s.repo, &s.crypto, ObjectType::ItemStream, ptr)?;
                    decoder.feed(&plaintext);
                    continue;
                }
                None => break,
            },
        };

        if let Some(matcher) = &options.matcher {
            let is_dir = item.item_type == ItemType::Directory;
            if !matcher(Path::new(&item.path), is_dir) {
                continue;
            }
        }
        let target = match safe_join(&options.dest, &item.path) {
            Some(t) => t,
            None => {
                warn!(path = %item.path, "refusing to extract outside destination");
                stats.errors += 1;
                continue;
            }
        };
        match restore_item(&mut s, &item, &target, &options.dest, &mut stats, &mut dir_times) {
            Ok(()) => {}
            Err(e) => {
                warn!(path = %item.path, "failed to restore: {e}");
                stats.errors += 1;
            }
        }
    }

    // Directory mtimes last, deepest first.
    dir_times.sort_by(|a, b| b.0.components().count().cmp(&a.0.components().count()));
    for (dir, mtime_ns) in dir_times {
        let _ = filetime::set_file_mtime(&dir, file_time(mtime_ns));
    }

    info!(
        archive = %options.archive,
        files = stats.files,
        dirs = stats.dirs,
        bytes = stats.bytes,
        "extraction finished"
    );
    Ok(stats)
}

/// Join an archived (already normalised) path onto the destination,
/// rejecting anything that would escape it.
fn safe_join(dest: &Path, stored: &str) -> Option<PathBuf> {
    let rel = Path::new(stored);
    for component in rel.components() {
        match component {
            Component::Normal(_) => {}
            _ => return None,
        }
    }
    Some(dest.join(rel))
}

fn file_time(ns: i64) -> filetime::FileTime {
    filetime::FileTime::from_unix_time(ns.div_euclid(1_000_000_000), ns.rem_euclid(1_000_000_000) as u32)
}

fn restore_item(
    s: &mut super::Session,
    item: &Item,
    target: &Path,
    dest: &Path,
    stats: &mut ExtractStats,
    dir_times: &mut Vec<(PathBuf, i64)>,
) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    match item.item_type {
        ItemType::Directory => {
            fs::create_dir_all(target)?;
            restore_metadata(item, target)?;
            dir_times.push((target.to_path_buf(), item.mtime_ns));
            stats.dirs += 1;
        }
        ItemType::RegularFile => {
            let mut file = fs::File::create(target)?;
            for chunk_ref in &item.chunks {
                let (plaintext, _) =
                    fetch_chunk(&mut s.repo, &s.crypto, ObjectType::FileChunk, &chunk_ref.id)?;
                file.write_all(&plaintext)?;
                stats.bytes += plaintext.len() as u64;
            }
            file.sync_all()?;
            drop(file);
            restore_metadata(item, target)?;
            let _ = filetime::set_file_mtime(target, file_time(item.mtime_ns));
            stats.files += 1;
        }
        ItemType::Hardlink => {
            let source = item
                .source
                .as_deref()
                .ok_or_else(|| CairnError::InvalidFormat("hardlink item without source".into()))?;
            let source_path = safe_join(dest, source)
                .ok_or_else(|| CairnError::InvalidFormat("hardlink source escapes dest".into()))?;
            fs::hard_link(&source_path, target)?;
            stats.hardlinks += 1;
        }
        ItemType::Symlink => {
            let link_target = item
                .source
                .as_deref()
                .ok_or_else(|| CairnError::InvalidFormat("symlink item without target".into()))?;
            platform::create_symlink(Path::new(link_target), target)?;
            let _ = filetime::set_symlink_file_times(
                target,
                file_time(item.atime_ns.unwrap_or(item.mtime_ns)),
                file_time(item.mtime_ns),
            );
            stats.symlinks += 1;
        }
        ItemType::Fifo => {
            platform::create_fifo(target, item.mode)?;
            restore_metadata(item, target)?;
            stats.specials += 1;
        }
        ItemType::CharDevice | ItemType::BlockDevice => {
            restore_device(item, target)?;
            restore_metadata(item, target)?;
            stats.specials += 1;
        }
    }
    Ok(())
}

fn restore_metadata(item: &Item, target: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(target, fs::Permissions::from_mode(item.mode))?;
        // Ownership restore needs privilege; best effort.
        let _ = std::os::unix::fs::chown(target, Some(item.uid), Some(item.gid));
    }
    #[cfg(not(unix))]
    {
        let _ = (item, target);
    }
    Ok(())
}

#[cfg(unix)]
fn restore_device(item: &Item, target: &Path) -> Result<()> {
    use nix::sys::stat::{mknod, Mode, SFlag};
    let kind = match item.item_type {
        ItemType::CharDevice => SFlag::S_IFCHR,
        _ => SFlag::S_IFBLK,
    };
    let rdev = item
        .rdev
        .ok_or_else(|| CairnError::InvalidFormat("device item without rdev".into()))?;
    mknod(
        target,
        kind,
        Mode::from_bits_truncate(item.mode),
        rdev as nix::sys::stat::dev_t,
    )
    .map_err(|e| CairnError::Io(std::io::Error::from_raw_os_error(e as i32)))
}

#[cfg(not(unix))]
fn restore_device(_item: &Item, _target: &Path) -> Result<()> {
    Err(CairnError::Other("device nodes are not supported here".into()))
}
