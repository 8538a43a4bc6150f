//! Persistent monotonic nonce counter.
//!
//! The counter lives in two places: a `nonce` file in the repository and a
//! per-repository file in the client's security directory. A write session
//! opens both under the exclusive lock, starts from their maximum, and
//! fsyncs a new reservation to both files before any ciphertext using it
//! can become durable.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use cairn_types::error::{CairnError, Result};

/// Reject absurd stored values; a counter past 2^63 means corruption.
const MAX_COUNTER: u64 = 1 << 63;

#[derive(Debug)]
pub struct NonceManager {
    repo_file: PathBuf,
    local_file: PathBuf,
    next: u64,
}

fn read_counter(path: &Path) -> Result<Option<u64>> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value = u64::from_str_radix(text.trim(), 16)
        .map_err(|_| CairnError::InvalidFormat(format!("bad nonce file: {}", path.display())))?;
    if value > MAX_COUNTER {
        return Err(CairnError::NonceRegression);
    }
    Ok(Some(value))
}

/// Write, fsync, and rename into place so a crash never truncates the file.
fn write_counter(path: &Path, value: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(format!("{value:016x}").as_bytes())?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

impl NonceManager {
    /// Open the counter for a write session.
    ///
    /// A repository value lower than our local record means the repository
    /// was rolled back to an earlier state; encrypting with the repo's
    /// counter would reuse nonces. This is fatal unless explicitly
    /// acknowledged, in which case the (safe) local maximum is used.
    pub fn open(
        repo_file: PathBuf,
        local_file: PathBuf,
        allow_regression: bool,
    ) -> Result<Self> {
        let repo = read_counter(&repo_file)?.unwrap_or(0);
        let local = read_counter(&local_file)?.unwrap_or(0);
        if repo < local && !allow_regression {
            return Err(CairnError::NonceRegression);
        }
        if repo < local {
            warn!(
                repo,
                local, "nonce counter regression acknowledged; continuing from local maximum"
            );
        }
        Ok(Self {
            repo_file,
            local_file,
            next: repo.max(local),
        })
    }

    /// An in-memory manager for tests and ephemeral repositories.
    pub fn ephemeral(dir: &Path) -> Self {
        Self {
            repo_file: dir.join("nonce"),
            local_file: dir.join("nonce.local"),
            next: 0,
        }
    }

    /// Current next-counter value (the lowest unused nonce).
    pub fn next(&self) -> u64 {
        self.next
    }

    /// Raise the counter past a nonce observed in existing ciphertext.
    pub fn advance_past(&mut self, observed: u64) {
        if observed >= self.next {
            self.next = observed + 1;
        }
    }

    /// Reserve `count` nonces, persisting the advanced counter to both
    /// files before returning the first reserved value.
    pub fn reserve(&mut self, count: u64) -> Result<u64> {
        let start = self.next;
        let end = start
            .checked_add(count)
            .filter(|&e| e <= MAX_COUNTER)
            .ok_or(CairnError::NonceRegression)?;
        // Local first: if we crash between the writes, the local file is
        // ahead, which is the safe direction.
        write_counter(&self.local_file, end)?;
        write_counter(&self.repo_file, end)?;
        self.next = end;
        Ok(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_are_monotonic_and_persistent() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("nonce");
        let local = dir.path().join("local-nonce");

        let mut mgr = NonceManager::open(repo.clone(), local.clone(), false).unwrap();
        assert_eq!(mgr.reserve(10).unwrap(), 0);
        assert_eq!(mgr.reserve(1).unwrap(), 10);
        drop(mgr);

        let mut mgr = NonceManager::open(repo, local, false).unwrap();
        assert_eq!(mgr.reserve(1).unwrap(), 11);
    }

    #[test]
    fn regression_is_fatal_without_acknowledgement() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("nonce");
        let local = dir.path().join("local-nonce");

        write_counter(&repo, 5).unwrap();
        write_counter(&local, 50).unwrap();

        match NonceManager::open(repo.clone(), local.clone(), false) {
            Err(CairnError::NonceRegression) => {}
            other => panic!("expected NonceRegression, got {other:?}"),
        }

        // Acknowledged: continues from the safe local maximum.
        let mut mgr = NonceManager::open(repo, local, true).unwrap();
        assert_eq!(mgr.reserve(1).unwrap(), 50);
    }

    #[test]
    fn advance_past_skips_observed_nonces() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = NonceManager::ephemeral(dir.path());
        mgr.advance_past(99);
        assert_eq!(mgr.reserve(1).unwrap(), 100);
        mgr.advance_past(50); // lower than next: no effect
        assert_eq!(mgr.reserve(1).unwrap(), 101);
    }
}
