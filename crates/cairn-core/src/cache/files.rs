//! The files index: skip re-reading files that have not changed since the
//! previous backup.
//!
//! A file is considered unchanged iff size, mtime, ctime (and, unless
//! disabled, inode) all match the cached entry. Entries age one generation
//! per backup and are evicted after a TTL, so moved-away trees eventually
//! stop occupying memory.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::archive::item::ChunkRef;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Generations since this entry was last seen. Zero means this run.
    pub age: u8,
    pub inode: u64,
    pub size: u64,
    pub mtime_ns: i64,
    pub ctime_ns: i64,
    pub chunks: Vec<ChunkRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilesIndex {
    entries: HashMap<String, FileEntry>,
}

impl FilesIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a file. A hit resets the entry's age and returns its chunk
    /// list; any metadata mismatch is a miss.
    #[allow(clippy::too_many_arguments)]
    pub fn lookup(
        &mut self,
        path: &str,
        inode: u64,
        size: u64,
        mtime_ns: i64,
        ctime_ns: i64,
        ignore_inode: bool,
    ) -> Option<&Vec<ChunkRef>> {
        let entry = self.entries.get_mut(path)?;
        let unchanged = entry.size == size
            && entry.mtime_ns == mtime_ns
            && entry.ctime_ns == ctime_ns
            && (ignore_inode || entry.inode == inode);
        if unchanged {
            entry.age = 0;
            Some(&entry.chunks)
        } else {
            None
        }
    }

    /// Record a file's current state and content chunks.
    pub fn insert(
        &mut self,
        path: String,
        inode: u64,
        size: u64,
        mtime_ns: i64,
        ctime_ns: i64,
        chunks: Vec<ChunkRef>,
    ) {
        self.entries.insert(
            path,
            FileEntry {
                age: 0,
                inode,
                size,
                mtime_ns,
                ctime_ns,
                chunks,
            },
        );
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start a new backup generation: every entry ages by one.
    /// Entries touched during the run get their age reset to zero.
    pub fn begin_generation(&mut self) {
        for entry in self.entries.values_mut() {
            entry.age = entry.age.saturating_add(1);
        }
    }

    /// Drop entries unseen for more than `ttl` generations. Returns the
    /// number evicted.
    pub fn evict_older_than(&mut self, ttl: u8) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.age <= ttl);
        before - self.entries.len()
    }

    /// Drop entries referencing chunks that no longer exist.
    ///
    /// Must run before a backup begins: cache-hit paths skip per-chunk
    /// existence checks and rely on this pre-sanitization.
    pub fn prune_stale_entries(
        &mut self,
        chunk_exists: &dyn Fn(&cairn_types::chunk_id::ChunkId) -> bool,
    ) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.chunks.iter().all(|cr| chunk_exists(&cr.id)));
        before - self.entries.len()
    }
}
