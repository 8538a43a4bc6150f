//! The chunks index: the client-side authority on which chunks already
//! exist in the repository, with reference counts and sizes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use cairn_types::chunk_id::ChunkId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub refcount: u32,
    /// Plaintext size.
    pub size: u32,
    /// Stored (compressed + encrypted) size.
    pub csize: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunksIndex {
    entries: HashMap<ChunkId, ChunkEntry>,
}

impl ChunksIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &ChunkId) -> Option<&ChunkEntry> {
        self.entries.get(id)
    }

    /// Register a reference: bump the refcount, or insert with refcount 1.
    pub fn add(&mut self, id: ChunkId, size: u32, csize: u32) -> ChunkEntry {
        let entry = self
            .entries
            .entry(id)
            .and_modify(|e| e.refcount = e.refcount.saturating_add(1))
            .or_insert(ChunkEntry {
                refcount: 1,
                size,
                csize,
            });
        *entry
    }

    /// Drop one reference. At zero the entry is removed and returned, which
    /// is the caller's cue to issue a repository DELETE.
    pub fn decrement(&mut self, id: &ChunkId) -> Option<(u32, ChunkEntry)> {
        let entry = self.entries.get_mut(id)?;
        entry.refcount = entry.refcount.saturating_sub(1);
        let rc = entry.refcount;
        let snapshot = *entry;
        if rc == 0 {
            self.entries.remove(id);
        }
        Some((rc, snapshot))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChunkId, &ChunkEntry)> {
        self.entries.iter()
    }

    /// Total stored bytes of chunks with exactly one reference, i.e. the
    /// space freed if their sole referrer were deleted.
    pub fn unique_csize(&self) -> u64 {
        self.entries
            .values()
            .filter(|e| e.refcount == 1)
            .map(|e| e.csize as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> ChunkId {
        ChunkId([b; 32])
    }

    #[test]
    fn add_and_refcount() {
        let mut index = ChunksIndex::new();
        let e = index.add(id(1), 100, 50);
        assert_eq!(e.refcount, 1);
        let e = index.add(id(1), 100, 50);
        assert_eq!(e.refcount, 2);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn decrement_to_zero_removes() {
        let mut index = ChunksIndex::new();
        index.add(id(1), 100, 50);
        index.add(id(1), 100, 50);

        let (rc, _) = index.decrement(&id(1)).unwrap();
        assert_eq!(rc, 1);
        assert!(index.contains(&id(1)));

        let (rc, entry) = index.decrement(&id(1)).unwrap();
        assert_eq!(rc, 0);
        assert_eq!(entry.csize, 50);
        assert!(!index.contains(&id(1)));

        assert!(index.decrement(&id(1)).is_none());
    }

    #[test]
    fn unique_csize_counts_singly_referenced() {
        let mut index = ChunksIndex::new();
        index.add(id(1), 100, 60);
        index.add(id(2), 100, 40);
        index.add(id(2), 100, 40);
        assert_eq!(index.unique_csize(), 60);
    }
}
