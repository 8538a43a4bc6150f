//! Item records: one per filesystem entry in an archive.

use std::collections::HashMap;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use cairn_types::chunk_id::ChunkId;

/// Reference to a content chunk stored in the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub id: ChunkId,
    /// Plaintext size of this chunk.
    pub size: u32,
    /// Size as stored (compressed + encrypted).
    pub csize: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemType {
    RegularFile,
    Directory,
    Symlink,
    Fifo,
    CharDevice,
    BlockDevice,
    /// A regular file whose content lives in an earlier item; `source`
    /// names that item's path.
    Hardlink,
}

/// A single filesystem entry stored in an archive.
///
/// Paths are stored normalised: relative, forward-slash separators, never
/// a leading separator, regardless of source OS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub path: String,
    pub item_type: ItemType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    /// Nanoseconds since the Unix epoch.
    pub mtime_ns: i64,
    #[serde(default)]
    pub atime_ns: Option<i64>,
    #[serde(default)]
    pub ctime_ns: Option<i64>,
    #[serde(default)]
    pub birthtime_ns: Option<i64>,
    pub size: u64,
    /// For regular files: ordered chunks whose concatenation is the content.
    #[serde(default)]
    pub chunks: Vec<ChunkRef>,
    /// Symlink target, or hardlink source path.
    #[serde(default)]
    pub source: Option<String>,
    /// Device number for character/block devices.
    #[serde(default)]
    pub rdev: Option<u64>,
    #[serde(default)]
    pub xattrs: Option<HashMap<String, Vec<u8>>>,
    /// Set by repair when content chunks were lost and replaced by
    /// all-zero substitutes.
    #[serde(default)]
    pub broken: bool,
    /// The original chunk list, kept so a later check can heal the item
    /// once the real chunks reappear.
    #[serde(default)]
    pub chunks_healthy: Option<Vec<ChunkRef>>,
}

impl Item {
    /// Total plaintext bytes according to the chunk list.
    pub fn chunks_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size as u64).sum()
    }
}

/// Normalise a path for storage: strip root and `.` components, join the
/// rest with forward slashes.
pub fn normalize_path(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                // ".." cannot be stored; normalisation drops the previous
                // component, pinned at the top.
                parts.pop();
            }
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
        }
    }
    parts.join("/")
}
