//! High-level operations: one module per command, sharing an open
//! repository session (repository + key + caches + manifest).

pub mod check;
pub mod create;
pub mod delete;
pub mod extract;
pub mod info;
pub mod init;
pub mod key;
pub mod list;
pub mod prune;
pub mod recreate;

use std::path::Path;

use cairn_types::chunk_id::MANIFEST_ID;
use cairn_types::error::{CairnError, Result};

use crate::archive::manifest::Manifest;
use crate::cache::Cache;
use crate::config::RuntimeConfig;
use crate::crypto::key::{keyfile_path, load_keyfile, KeyMode};
use crate::crypto::nonce::NonceManager;
use crate::crypto::passphrase::{self, PromptFn};
use crate::crypto::security::SecurityManager;
use crate::crypto::{CryptoContext, KeyData};
use crate::platform;
use crate::repo::{Access, Repository};

/// An opened repository with its unlocked key, caches, and manifest.
pub struct Session {
    pub repo: Repository,
    pub crypto: CryptoContext,
    pub cache: Cache,
    pub manifest: Manifest,
}

/// Open a repository end to end: lock, key unlock, security checks, nonce
/// reservation state (write sessions), manifest authentication, caches.
pub fn open_session(
    repo_path: &Path,
    access: Access,
    runtime: &RuntimeConfig,
    prompt: PromptFn<'_>,
    files_suffix: &str,
) -> Result<Session> {
    let host_id = platform::host_id(runtime.host_id.as_deref());
    let mut repo = Repository::open(repo_path, access, &host_id)?;

    let keys = unlock_key(&repo, runtime, prompt)?;

    let security = SecurityManager::for_repo(runtime, repo.id())?;
    security.assert_access(runtime, &repo.location(), repo.config.key_mode)?;

    let nonces = if access == Access::ReadWrite && repo.config.suite.is_encrypting() {
        Some(NonceManager::open(
            repo.path().join("nonce"),
            security.nonce_file(),
            runtime.workarounds.contains("ignore-nonce-regression"),
        )?)
    } else {
        None
    };

    let mut crypto = CryptoContext::new(repo.config.suite, keys, nonces);

    // Advance the counter past the newest ciphertext we can cheaply see.
    let manifest_raw = repo.get(&MANIFEST_ID)?;
    crypto.observe_nonce(&manifest_raw);

    let manifest = Manifest::load(&mut repo, &crypto)?;
    let cache = Cache::open(runtime, repo.id(), files_suffix);

    Ok(Session {
        repo,
        crypto,
        cache,
        manifest,
    })
}

/// Resolve and unwrap the repository key according to its key mode.
fn unlock_key(repo: &Repository, runtime: &RuntimeConfig, prompt: PromptFn<'_>) -> Result<KeyData> {
    match repo.config.key_mode {
        KeyMode::None => Ok(KeyData::for_unencrypted(repo.id())),
        KeyMode::Repokey => {
            let encrypted = repo.config.key.clone().ok_or_else(|| {
                CairnError::InvalidFormat("repokey repository has no stored key".into())
            })?;
            let pass =
                passphrase::for_open(runtime, prompt)?.ok_or(CairnError::PassphraseRequired)?;
            KeyData::from_encrypted(&encrypted, &pass)
        }
        KeyMode::Keyfile => {
            let path = keyfile_path(runtime, repo.id())?;
            let key_file = load_keyfile(&path)?;
            if key_file.repo_id != repo.id() {
                return Err(CairnError::InvalidFormat(format!(
                    "key file {} belongs to a different repository",
                    path.display()
                )));
            }
            let pass =
                passphrase::for_open(runtime, prompt)?.ok_or(CairnError::PassphraseRequired)?;
            KeyData::from_encrypted(&key_file.encrypted, &pass)
        }
    }
}

/// Forcibly clear all repository locks. Returns how many were removed.
pub fn break_lock(repo_path: &Path) -> Result<usize> {
    crate::repo::lock::break_lock(repo_path)
}
