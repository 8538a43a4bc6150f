//! On-disk repository locking.
//!
//! One exclusive holder may mutate; any number of shared holders may read.
//! The exclusive lock is the atomic creation of the `lock.exclusive`
//! directory; shared readers register entry files under `lock.roster/`.
//! Every entry records host id, pid, and acquisition time so contention is
//! diagnosable. A lock is broken automatically only when its holder is
//! demonstrably gone: same host id and the process no longer exists.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cairn_types::error::{CairnError, Result};

use crate::platform;

const EXCLUSIVE_DIR: &str = "lock.exclusive";
const ROSTER_DIR: &str = "lock.roster";
const OWNER_FILE: &str = "owner";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEntry {
    pub host_id: String,
    pub pid: u32,
    pub time: DateTime<Utc>,
}

impl LockEntry {
    fn ours(host_id: &str) -> Self {
        Self {
            host_id: host_id.to_string(),
            pid: platform::pid(),
            time: Utc::now(),
        }
    }

    pub fn describe(&self) -> String {
        format!("{} pid {} since {}", self.host_id, self.pid, self.time)
    }

    /// Demonstrably stale: held by this host and the process is gone.
    fn is_stale(&self, our_host_id: &str) -> bool {
        self.host_id == our_host_id && !platform::process_alive(self.pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Exclusive,
    Shared,
}

#[derive(Debug)]
pub struct RepoLock {
    repo_dir: PathBuf,
    kind: LockKind,
    /// For shared locks, our roster entry file.
    roster_entry: Option<PathBuf>,
}

fn read_entry(path: &Path) -> Option<LockEntry> {
    let data = fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

fn roster_entries(repo_dir: &Path) -> Vec<(PathBuf, LockEntry)> {
    let mut out = Vec::new();
    let roster = repo_dir.join(ROSTER_DIR);
    let Ok(entries) = fs::read_dir(&roster) else {
        return out;
    };
    for entry in entries.flatten() {
        if let Some(lock) = read_entry(&entry.path()) {
            out.push((entry.path(), lock));
        }
    }
    out
}

/// Drop roster entries from dead processes on this host.
fn cleanup_stale_roster(repo_dir: &Path, host_id: &str) {
    for (path, entry) in roster_entries(repo_dir) {
        if entry.is_stale(host_id) {
            debug!(holder = %entry.describe(), "removing stale shared lock");
            let _ = fs::remove_file(path);
        }
    }
}

/// Acquire the exclusive (writer) lock.
pub fn acquire_exclusive(repo_dir: &Path, host_id: &str) -> Result<RepoLock> {
    cleanup_stale_roster(repo_dir, host_id);

    let dir = repo_dir.join(EXCLUSIVE_DIR);
    for attempt in 0..2 {
        match fs::create_dir(&dir) {
            Ok(()) => {
                let entry = LockEntry::ours(host_id);
                fs::write(dir.join(OWNER_FILE), serde_json::to_vec(&entry).unwrap())?;

                // Writers must not race live readers.
                let readers: Vec<_> = roster_entries(repo_dir)
                    .into_iter()
                    .filter(|(_, e)| !(e.host_id == host_id && e.pid == platform::pid()))
                    .collect();
                if !readers.is_empty() {
                    let holder = readers[0].1.describe();
                    release_exclusive_dir(&dir);
                    return Err(CairnError::Locked(format!("shared lock: {holder}")));
                }
                return Ok(RepoLock {
                    repo_dir: repo_dir.to_path_buf(),
                    kind: LockKind::Exclusive,
                    roster_entry: None,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let owner = read_entry(&dir.join(OWNER_FILE));
                match owner {
                    Some(entry) if entry.is_stale(host_id) && attempt == 0 => {
                        warn!(holder = %entry.describe(), "breaking stale exclusive lock");
                        release_exclusive_dir(&dir);
                        continue;
                    }
                    Some(entry) => return Err(CairnError::Locked(entry.describe())),
                    // Owner file not written yet (or unreadable): treat as
                    // held; the holder's identity is simply unknown.
                    None => return Err(CairnError::Locked("unknown holder".into())),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(CairnError::Locked("unknown holder".into()))
}

/// Acquire a shared (reader) lock.
pub fn acquire_shared(repo_dir: &Path, host_id: &str) -> Result<RepoLock> {
    cleanup_stale_roster(repo_dir, host_id);

    let exclusive = repo_dir.join(EXCLUSIVE_DIR);
    if exclusive.exists() {
        match read_entry(&exclusive.join(OWNER_FILE)) {
            Some(entry) if entry.is_stale(host_id) => {
                warn!(holder = %entry.describe(), "breaking stale exclusive lock");
                release_exclusive_dir(&exclusive);
            }
            Some(entry) => return Err(CairnError::Locked(entry.describe())),
            None => return Err(CairnError::Locked("unknown holder".into())),
        }
    }

    let roster = repo_dir.join(ROSTER_DIR);
    fs::create_dir_all(&roster)?;
    let entry = LockEntry::ours(host_id);
    let name = format!("{:020}-{}.json", Utc::now().timestamp_micros(), entry.pid);
    let path = roster.join(name);
    fs::write(&path, serde_json::to_vec(&entry).unwrap())?;

    // An exclusive holder may have appeared while we registered.
    if exclusive.exists() {
        let _ = fs::remove_file(&path);
        let holder = read_entry(&exclusive.join(OWNER_FILE))
            .map(|e| e.describe())
            .unwrap_or_else(|| "unknown holder".into());
        return Err(CairnError::Locked(holder));
    }

    Ok(RepoLock {
        repo_dir: repo_dir.to_path_buf(),
        kind: LockKind::Shared,
        roster_entry: Some(path),
    })
}

fn release_exclusive_dir(dir: &Path) {
    let _ = fs::remove_file(dir.join(OWNER_FILE));
    let _ = fs::remove_dir(dir);
}

impl RepoLock {
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn release(self) {
        // Drop does the work.
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        match self.kind {
            LockKind::Exclusive => release_exclusive_dir(&self.repo_dir.join(EXCLUSIVE_DIR)),
            LockKind::Shared => {
                if let Some(path) = &self.roster_entry {
                    let _ = fs::remove_file(path);
                }
            }
        }
    }
}

/// Forcibly remove all locks. Recovery tool for stale locks left by a
/// killed process on another host. Returns the number of locks removed.
pub fn break_lock(repo_dir: &Path) -> Result<usize> {
    let mut removed = 0;
    let exclusive = repo_dir.join(EXCLUSIVE_DIR);
    if exclusive.exists() {
        release_exclusive_dir(&exclusive);
        removed += 1;
    }
    for (path, _) in roster_entries(repo_dir) {
        let _ = fs::remove_file(path);
        removed += 1;
    }
    Ok(removed)
}
