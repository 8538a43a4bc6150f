//! Repository index and hints.
//!
//! The index maps object id to physical location `(segment, offset)`. It
//! is held in memory and persisted as `index.<N>` where `N` is the highest
//! committed segment; it is always rebuildable by replaying segments. The
//! hints file tracks per-segment byte accounting so compaction knows where
//! reclaimable space lives.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cairn_types::chunk_id::ChunkId;
use cairn_types::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub segment: u64,
    pub offset: u64,
    /// Full on-disk entry size, kept so freed bytes can be accounted to
    /// the hints without re-reading the superseded entry.
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoIndex {
    entries: HashMap<ChunkId, Location>,
}

impl RepoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ChunkId) -> Option<Location> {
        self.entries.get(id).copied()
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn insert(&mut self, id: ChunkId, location: Location) -> Option<Location> {
        self.entries.insert(id, location)
    }

    pub fn remove(&mut self, id: &ChunkId) -> Option<Location> {
        self.entries.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChunkId, &Location)> {
        self.entries.iter()
    }

    /// Ids in lexicographic order, optionally resuming after a marker.
    pub fn ids_sorted(&self, after: Option<&ChunkId>, limit: usize) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> = match after {
            Some(marker) => self.entries.keys().filter(|id| *id > marker).copied().collect(),
            None => self.entries.keys().copied().collect(),
        };
        ids.sort();
        ids.truncate(limit);
        ids
    }
}

/// Per-segment byte accounting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SegmentStats {
    pub used: u64,
    pub free: u64,
}

impl SegmentStats {
    pub fn free_ratio(&self) -> f64 {
        let total = self.used + self.free;
        if total == 0 {
            0.0
        } else {
            self.free as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hints {
    pub segments: BTreeMap<u64, SegmentStats>,
    /// Segments that accumulated freed bytes since the last compaction.
    pub compact: BTreeSet<u64>,
}

impl Hints {
    pub fn record_used(&mut self, segment: u64, bytes: u64) {
        self.segments.entry(segment).or_default().used += bytes;
    }

    /// Move bytes from used to free, flagging the segment for compaction.
    pub fn record_freed(&mut self, segment: u64, bytes: u64) {
        let stats = self.segments.entry(segment).or_default();
        let bytes = bytes.min(stats.used);
        stats.used -= bytes;
        stats.free += bytes;
        self.compact.insert(segment);
    }

    pub fn forget_segment(&mut self, segment: u64) {
        self.segments.remove(&segment);
        self.compact.remove(&segment);
    }

    /// Compaction candidates: flagged segments whose free ratio meets the
    /// threshold, excluding `current` (the open segment).
    pub fn candidates(&self, threshold: f64, current: Option<u64>) -> Vec<u64> {
        self.compact
            .iter()
            .copied()
            .filter(|seg| Some(*seg) != current)
            .filter(|seg| {
                self.segments
                    .get(seg)
                    .map(|s| s.free_ratio() >= threshold)
                    .unwrap_or(false)
            })
            .collect()
    }
}

/// Write a serialized blob atomically: temp file, fsync, rename, fsync dir.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Find the latest `<prefix>.<N>` snapshot in a repository directory.
pub fn latest_snapshot(repo_dir: &Path, prefix: &str) -> Result<Option<(u64, PathBuf)>> {
    let mut best: Option<(u64, PathBuf)> = None;
    for entry in fs::read_dir(repo_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(num) = name
            .strip_prefix(prefix)
            .and_then(|r| r.strip_prefix('.'))
            .and_then(|n| n.parse::<u64>().ok())
        else {
            continue;
        };
        if best.as_ref().map_or(true, |(n, _)| num > *n) {
            best = Some((num, entry.path()));
        }
    }
    Ok(best)
}

/// Remove all `<prefix>.<N>` snapshots except the given transaction id.
pub fn remove_old_snapshots(repo_dir: &Path, prefix: &str, keep: u64) -> Result<()> {
    for entry in fs::read_dir(repo_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(num) = name
            .strip_prefix(prefix)
            .and_then(|r| r.strip_prefix('.'))
            .and_then(|n| n.parse::<u64>().ok())
        {
            if num != keep {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_accounting() {
        let mut hints = Hints::default();
        hints.record_used(3, 1000);
        hints.record_freed(3, 400);
        let stats = hints.segments[&3];
        assert_eq!(stats.used, 600);
        assert_eq!(stats.free, 400);
        assert!((stats.free_ratio() - 0.4).abs() < 1e-9);

        assert_eq!(hints.candidates(0.3, None), vec![3]);
        assert!(hints.candidates(0.5, None).is_empty());
        assert!(hints.candidates(0.3, Some(3)).is_empty());
    }

    #[test]
    fn freed_never_exceeds_used() {
        let mut hints = Hints::default();
        hints.record_used(1, 100);
        hints.record_freed(1, 5000);
        let stats = hints.segments[&1];
        assert_eq!(stats.used, 0);
        assert_eq!(stats.free, 100);
    }

    #[test]
    fn snapshot_discovery() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.3"), b"a").unwrap();
        fs::write(dir.path().join("index.11"), b"b").unwrap();
        fs::write(dir.path().join("hints.11"), b"c").unwrap();
        fs::write(dir.path().join("indexold"), b"d").unwrap();

        let (num, path) = latest_snapshot(dir.path(), "index").unwrap().unwrap();
        assert_eq!(num, 11);
        assert!(path.ends_with("index.11"));

        remove_old_snapshots(dir.path(), "index", 11).unwrap();
        assert!(!dir.path().join("index.3").exists());
        assert!(dir.path().join("index.11").exists());
        assert!(dir.path().join("hints.11").exists());
    }

    #[test]
    fn ids_sorted_pagination() {
        let mut index = RepoIndex::new();
        for b in [5u8, 1, 9, 3] {
            index.insert(
                ChunkId([b; 32]),
                Location {
                    segment: 0,
                    offset: 0,
                    size: 0,
                },
            );
        }
        let first_two = index.ids_sorted(None, 2);
        assert_eq!(first_two, vec![ChunkId([1; 32]), ChunkId([3; 32])]);
        let rest = index.ids_sorted(Some(&ChunkId([3; 32])), 10);
        assert_eq!(rest, vec![ChunkId([5; 32]), ChunkId([9; 32])]);
    }
}
