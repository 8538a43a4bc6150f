//! The content-addressed object store: a segmented append-only log with a
//! persistent index and a multi-transaction recovery protocol.
//!
//! All mutation happens inside a transaction. PUT and DELETE entries are
//! appended to the open segment; `commit` writes a COMMIT entry, fsyncs,
//! rotates to a fresh segment, and atomically replaces the persistent
//! index and hints snapshots. A crash mid-transaction is indistinguishable
//! from "did not happen" after recovery: on open, everything past the last
//! durable COMMIT is rolled back.

pub mod check;
pub mod index;
pub mod lock;
pub mod segment;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cairn_types::chunk_id::ChunkId;
use cairn_types::error::{CairnError, Result};

use crate::crypto::key::{EncryptedKey, KeyMode};
use crate::crypto::CipherSuite;

use self::index::{latest_snapshot, remove_old_snapshots, write_atomic, Hints, Location, RepoIndex};
use self::lock::RepoLock;
use self::segment::{put_entry_size, LogEntry, SegmentScan, SegmentWriter, DELETE_SIZE};

const README_TEXT: &str = "This is a cairn backup repository.\n\
See https://github.com/cairn-backup/cairn for details.\n";

/// Persisted (unencrypted) at `<repo>/config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: u32,
    pub id: Vec<u8>, // 32 bytes
    pub segments_per_dir: u64,
    pub max_segment_size: u64,
    pub key_mode: KeyMode,
    pub suite: CipherSuite,
    /// Wrapped key material, present in repokey mode only.
    pub key: Option<EncryptedKey>,
    pub created: DateTime<Utc>,
}

/// How a repository is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Exclusive lock; may mutate. Rolls back uncommitted state on open.
    ReadWrite,
    /// Shared lock; never modifies repository files.
    ReadOnly,
}

/// A handle to an opened repository.
pub struct Repository {
    path: PathBuf,
    pub config: RepoConfig,
    index: RepoIndex,
    hints: Hints,
    writer: Option<SegmentWriter>,
    /// Highest committed transaction (segment number of its COMMIT).
    committed_segment: Option<u64>,
    next_segment: u64,
    in_transaction: bool,
    /// Segments emptied by compaction, unlinked after the next COMMIT.
    compact_unlink: Vec<u64>,
    access: Access,
    retry: crate::retry::RetryConfig,
    _lock: RepoLock,
}

impl Repository {
    /// Initialize a new repository at `path`.
    ///
    /// The caller provides the prepared config (id, key mode, wrapped key);
    /// the repository itself never sees key material.
    pub fn create(path: &Path, config: RepoConfig, host_id: &str) -> Result<Self> {
        if path.exists() {
            let occupied = fs::read_dir(path)?.next().is_some();
            if occupied {
                return Err(CairnError::RepoAlreadyExists(path.display().to_string()));
            }
        } else {
            fs::create_dir_all(path)?;
        }

        fs::write(path.join("README"), README_TEXT)?;
        write_atomic(&path.join("config"), &rmp_serde::to_vec(&config)?)?;
        fs::create_dir_all(path.join("data"))?;

        let lock = lock::acquire_exclusive(path, host_id)?;
        Ok(Self {
            path: path.to_path_buf(),
            config,
            index: RepoIndex::new(),
            hints: Hints::default(),
            writer: None,
            committed_segment: None,
            next_segment: 0,
            in_transaction: false,
            compact_unlink: Vec::new(),
            access: Access::ReadWrite,
            retry: crate::retry::RetryConfig::default(),
            _lock: lock,
        })
    }

    /// Open an existing repository, recovering to the last committed state.
    pub fn open(path: &Path, access: Access, host_id: &str) -> Result<Self> {
        let config_data = fs::read(path.join("config")).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CairnError::RepoNotFound(path.display().to_string())
            } else {
                e.into()
            }
        })?;
        let config: RepoConfig = rmp_serde::from_slice(&config_data)?;
        if config.version != 1 {
            return Err(CairnError::UnsupportedVersion(config.version));
        }

        let lock = match access {
            Access::ReadWrite => lock::acquire_exclusive(path, host_id)?,
            Access::ReadOnly => lock::acquire_shared(path, host_id)?,
        };

        let mut repo = Self {
            path: path.to_path_buf(),
            config,
            index: RepoIndex::new(),
            hints: Hints::default(),
            writer: None,
            committed_segment: None,
            next_segment: 0,
            in_transaction: false,
            compact_unlink: Vec::new(),
            access,
            retry: crate::retry::RetryConfig::default(),
            _lock: lock,
        };
        repo.load_state()?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Canonical location string recorded in the security directory.
    pub fn location(&self) -> String {
        fs::canonicalize(&self.path)
            .unwrap_or_else(|_| self.path.clone())
            .display()
            .to_string()
    }

    pub fn id(&self) -> &[u8] {
        &self.config.id
    }

    /// Replace the stored (wrapped) key material in the repository config.
    /// Used by passphrase changes in repokey mode.
    pub fn store_key(&mut self, key: EncryptedKey) -> Result<()> {
        self.require_writable()?;
        self.config.key = Some(key);
        write_atomic(&self.path.join("config"), &rmp_serde::to_vec(&self.config)?)
    }

    pub fn index(&self) -> &RepoIndex {
        &self.index
    }

    pub fn hints(&self) -> &Hints {
        &self.hints
    }

    pub fn committed_segment(&self) -> Option<u64> {
        self.committed_segment
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    // ----- segment file layout -----

    pub fn segment_path(&self, segment: u64) -> PathBuf {
        let per_dir = self.config.segments_per_dir.max(1);
        self.path
            .join("data")
            .join((segment / per_dir).to_string())
            .join(segment.to_string())
    }

    /// All segment files on disk, sorted by segment number.
    pub fn list_segments(&self) -> Result<Vec<u64>> {
        let mut segments = Vec::new();
        let data = self.path.join("data");
        for bucket in fs::read_dir(&data)? {
            let bucket = bucket?;
            if !bucket.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(bucket.path())? {
                let entry = entry?;
                if let Some(num) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                    segments.push(num);
                }
            }
        }
        segments.sort_unstable();
        Ok(segments)
    }

    // ----- recovery -----

    /// Load index and hints snapshots, roll back any uncommitted tail, and
    /// replay committed segments newer than the snapshot.
    fn load_state(&mut self) -> Result<()> {
        let segments = self.list_segments()?;

        // Find the last durable COMMIT, scanning from the newest segment.
        let mut committed: Option<(u64, u64)> = None; // (segment, end offset)
        for &seg in segments.iter().rev() {
            if let Some(end) = scan_last_commit(&self.segment_path(seg), seg) {
                committed = Some((seg, end));
                break;
            }
        }

        if self.access == Access::ReadWrite {
            // Delete uncommitted segments; truncate garbage after the last
            // COMMIT in the committed segment.
            for &seg in &segments {
                if committed.map_or(true, |(cseg, _)| seg > cseg) {
                    warn!(segment = seg, "rolling back uncommitted segment");
                    fs::remove_file(self.segment_path(seg))?;
                    self.hints.forget_segment(seg);
                }
            }
            if let Some((cseg, end)) = committed {
                let path = self.segment_path(cseg);
                let len = fs::metadata(&path)?.len();
                if len > end {
                    warn!(
                        segment = cseg,
                        bytes = len - end,
                        "truncating uncommitted bytes after last COMMIT"
                    );
                    let file = fs::OpenOptions::new().write(true).open(&path)?;
                    file.set_len(end)?;
                    file.sync_all()?;
                }
            }
        }

        // Load the newest index snapshot not past the committed point.
        let mut base: Option<u64> = None;
        if let Some((num, path)) = latest_snapshot(&self.path, "index")? {
            let usable = committed.map_or(false, |(cseg, _)| num <= cseg);
            if usable {
                self.index = rmp_serde::from_slice(&fs::read(&path)?)?;
                base = Some(num);
                let hints_path = self.path.join(format!("hints.{num}"));
                match fs::read(&hints_path) {
                    Ok(data) => self.hints = rmp_serde::from_slice(&data)?,
                    Err(_) => {
                        debug!("hints.{num} missing, rebuilding from segments");
                        self.index = RepoIndex::new();
                        base = None;
                    }
                }
            }
        }

        // Replay committed segments after the snapshot.
        if let Some((cseg, cend)) = committed {
            let replay_from = base;
            for &seg in &segments {
                if seg > cseg {
                    continue; // uncommitted (read-only open keeps the files)
                }
                if replay_from.map_or(false, |b| seg <= b) {
                    continue;
                }
                let limit = if seg == cseg { Some(cend) } else { None };
                self.replay_segment(seg, limit)?;
            }
        }

        self.committed_segment = committed.map(|(seg, _)| seg);
        self.next_segment = committed.map_or(0, |(seg, _)| seg + 1);

        // Garbage from an interrupted compaction: committed segments that
        // the hints no longer know about and the index never references.
        if self.access == Access::ReadWrite && base.is_some() {
            for &seg in &segments {
                if Some(seg) <= self.committed_segment
                    && !self.hints.segments.contains_key(&seg)
                    && self.segment_path(seg).exists()
                {
                    debug!(segment = seg, "removing segment left by interrupted compaction");
                    let _ = fs::remove_file(self.segment_path(seg));
                }
            }
        }

        debug!(
            objects = self.index.len(),
            committed = ?self.committed_segment,
            "repository opened"
        );
        Ok(())
    }

    /// Replay one committed segment's entries into index and hints.
    fn replay_segment(&mut self, seg: u64, limit: Option<u64>) -> Result<()> {
        let mut scan = SegmentScan::open(&self.segment_path(seg), seg)?;
        loop {
            if let Some(limit) = limit {
                if scan.offset() >= limit {
                    break;
                }
            }
            let Some((offset, entry)) = scan.next_entry()? else {
                break;
            };
            match entry {
                LogEntry::Put { id, payload } => {
                    let size = put_entry_size(payload.len() as u64);
                    self.apply_put(id, Location {
                        segment: seg,
                        offset,
                        size,
                    });
                }
                LogEntry::Delete { id } => {
                    self.apply_delete(&id, seg);
                }
                LogEntry::Commit => {}
            }
        }
        Ok(())
    }

    fn apply_put(&mut self, id: ChunkId, location: Location) {
        if let Some(old) = self.index.insert(id, location) {
            self.hints.record_freed(old.segment, old.size);
        }
        self.hints.record_used(location.segment, location.size);
    }

    fn apply_delete(&mut self, id: &ChunkId, tombstone_segment: u64) {
        if let Some(old) = self.index.remove(id) {
            self.hints.record_freed(old.segment, old.size);
        }
        self.hints.record_used(tombstone_segment, DELETE_SIZE);
    }

    // ----- transaction plumbing -----

    fn require_writable(&self) -> Result<()> {
        if self.access != Access::ReadWrite {
            return Err(CairnError::Other(
                "repository opened read-only; writes are not permitted".into(),
            ));
        }
        Ok(())
    }

    /// The open segment writer, creating one (and starting a transaction)
    /// on first use. `upcoming` is the size of the entry about to be
    /// written, so a full segment rotates before it, never splitting it.
    fn writer_for(&mut self, upcoming: u64) -> Result<&mut SegmentWriter> {
        self.require_writable()?;

        let needs_rotation = match &self.writer {
            Some(w) => {
                w.offset() + upcoming > self.config.max_segment_size
                    && w.offset() > segment::SEGMENT_HEADER_SIZE
            }
            None => false,
        };
        if needs_rotation {
            let mut w = self.writer.take().unwrap();
            w.sync()?;
        }

        if self.writer.is_none() {
            let seg = self.next_segment;
            self.next_segment += 1;
            let writer = SegmentWriter::create(&self.segment_path(seg), seg)?;
            self.writer = Some(writer);
            self.in_transaction = true;
        }
        Ok(self.writer.as_mut().unwrap())
    }

    // ----- object operations -----

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.index.contains(id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Store an object. Within a transaction the caller observes its own
    /// write immediately; durability comes only with the next COMMIT.
    pub fn put(&mut self, id: &ChunkId, payload: &[u8]) -> Result<()> {
        let entry_size = put_entry_size(payload.len() as u64);
        let writer = self.writer_for(entry_size)?;
        let seg = writer.segment();
        let (offset, size) = writer.put(id, payload)?;
        self.apply_put(*id, Location {
            segment: seg,
            offset,
            size,
        });
        Ok(())
    }

    /// Fetch an object's stored payload, verifying entry CRC and id.
    /// Plain I/O failures are retried a bounded number of times;
    /// integrity failures never are.
    pub fn get(&mut self, id: &ChunkId) -> Result<Vec<u8>> {
        let location = self.index.get(id).ok_or(CairnError::ObjectMissing(*id))?;
        // Reading back our own uncommitted write requires the buffered
        // entry to be visible in the file.
        if let Some(w) = &mut self.writer {
            if w.segment() == location.segment {
                w.flush()?;
            }
        }
        let path = self.segment_path(location.segment);
        crate::retry::with_retries(&self.retry, "segment read", || {
            segment::read_put(&path, location.segment, location.offset, id)
        })
    }

    /// Remove an object. Its bytes are reclaimed by a later compaction.
    pub fn delete(&mut self, id: &ChunkId) -> Result<()> {
        if !self.index.contains(id) {
            return Err(CairnError::ObjectMissing(*id));
        }
        let writer = self.writer_for(DELETE_SIZE)?;
        let seg = writer.segment();
        writer.delete(id)?;
        self.apply_delete(id, seg);
        Ok(())
    }

    /// List ids in stable order, resuming after a marker.
    pub fn list(&self, after: Option<&ChunkId>, limit: usize) -> Vec<ChunkId> {
        self.index.ids_sorted(after, limit)
    }

    // ----- commit / rollback -----

    /// Durably commit the current transaction.
    ///
    /// When `compact_threshold` is set, segments whose free ratio meets it
    /// are rewritten into the current transaction first and unlinked after
    /// the COMMIT is durable.
    pub fn commit(&mut self, compact_threshold: Option<f64>) -> Result<()> {
        self.require_writable()?;

        if let Some(threshold) = compact_threshold {
            self.compact_segments(threshold)?;
        }
        if !self.in_transaction {
            return Ok(());
        }

        let writer = self.writer.as_mut().expect("transaction implies writer");
        writer.commit()?;
        writer.sync()?;
        let committed = writer.segment();
        let seg_dir = writer.path().parent().map(Path::to_path_buf);
        self.writer = None;
        if let Some(dir) = seg_dir {
            if let Ok(d) = fs::File::open(dir) {
                let _ = d.sync_all();
            }
        }

        self.committed_segment = Some(committed);
        self.next_segment = committed + 1;
        self.in_transaction = false;

        // The COMMIT is durable; compacted segments are now garbage.
        for seg in std::mem::take(&mut self.compact_unlink) {
            if let Err(e) = fs::remove_file(self.segment_path(seg)) {
                warn!(segment = seg, "failed to unlink compacted segment: {e}");
            }
        }

        write_atomic(
            &self.path.join(format!("index.{committed}")),
            &rmp_serde::to_vec(&self.index)?,
        )?;
        write_atomic(
            &self.path.join(format!("hints.{committed}")),
            &rmp_serde::to_vec(&self.hints)?,
        )?;
        remove_old_snapshots(&self.path, "index", committed)?;
        remove_old_snapshots(&self.path, "hints", committed)?;

        debug!(transaction = committed, "committed");
        Ok(())
    }

    /// Abandon the current transaction and restore the last committed
    /// state, exactly as a crash-and-reopen would.
    pub fn rollback(&mut self) -> Result<()> {
        self.require_writable()?;
        self.writer = None;
        self.in_transaction = false;
        self.compact_unlink.clear();
        self.index = RepoIndex::new();
        self.hints = Hints::default();
        self.load_state()
    }

    // ----- compaction -----

    /// Rewrite sparse committed segments into the current transaction.
    /// Live PUTs are copied; tombstones still shadowing replayable PUTs in
    /// older segments are carried forward, all others are dropped.
    fn compact_segments(&mut self, threshold: f64) -> Result<()> {
        let current = self.writer.as_ref().map(|w| w.segment());
        let mut candidates = self.hints.candidates(threshold, current);
        candidates.retain(|seg| Some(*seg) <= self.committed_segment);
        candidates.sort_unstable();

        for seg in candidates {
            debug!(segment = seg, "compacting");
            let mut scan = SegmentScan::open(&self.segment_path(seg), seg)?;
            while let Some((offset, entry)) = scan.next_entry()? {
                match entry {
                    LogEntry::Put { id, payload } => {
                        let live = self
                            .index
                            .get(&id)
                            .map_or(false, |loc| loc.segment == seg && loc.offset == offset);
                        if live {
                            self.put(&id, &payload)?;
                        }
                    }
                    LogEntry::Delete { id } => {
                        if !self.index.contains(&id) {
                            // Still shadowing an older PUT that replay
                            // could resurrect; keep the tombstone.
                            let writer = self.writer_for(DELETE_SIZE)?;
                            let tseg = writer.segment();
                            writer.delete(&id)?;
                            self.hints.record_used(tseg, DELETE_SIZE);
                        }
                    }
                    LogEntry::Commit => {}
                }
            }
            self.hints.forget_segment(seg);
            self.compact_unlink.push(seg);
        }
        Ok(())
    }
}

/// Scan a segment for its last COMMIT entry; returns the offset just past
/// it. Scanning stops at the first framing error (a torn tail).
fn scan_last_commit(path: &Path, segment: u64) -> Option<u64> {
    let mut scan = SegmentScan::open(path, segment).ok()?;
    let mut last_commit_end = None;
    loop {
        match scan.next_entry() {
            Ok(Some((_, LogEntry::Commit))) => last_commit_end = Some(scan.offset()),
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
    last_commit_end
}
