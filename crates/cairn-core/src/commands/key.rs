//! Key maintenance: passphrase changes, key export, TAM upgrade.

use std::path::{Path, PathBuf};

use tracing::info;

use cairn_types::error::{CairnError, Result};

use crate::config::RuntimeConfig;
use crate::crypto::key::{keyfile_path, load_keyfile, save_keyfile, KeyFile, KeyMode};
use crate::crypto::passphrase::{self, PromptFn};
use crate::repo::Access;

use super::open_session;

/// Re-wrap the repository key under a new passphrase. The key material
/// itself (and therefore every stored object) is unchanged.
pub fn change_passphrase(
    repo_path: &Path,
    runtime: &RuntimeConfig,
    prompt: PromptFn<'_>,
) -> Result<()> {
    let mut s = open_session(repo_path, Access::ReadWrite, runtime, prompt, "")?;
    if s.repo.config.key_mode == KeyMode::None {
        return Err(CairnError::Config(
            "unencrypted repositories have no passphrase".into(),
        ));
    }

    let new_pass =
        passphrase::for_new(runtime, prompt)?.ok_or(CairnError::PassphraseRequired)?;
    let wrapped = s.crypto.keys().change_passphrase(&new_pass)?;

    match s.repo.config.key_mode {
        KeyMode::Repokey => s.repo.store_key(wrapped)?,
        KeyMode::Keyfile => {
            let path = keyfile_path(runtime, s.repo.id())?;
            let mut key_file = load_keyfile(&path)?;
            key_file.encrypted = wrapped;
            save_keyfile(&path, &key_file)?;
        }
        KeyMode::None => unreachable!("checked above"),
    }
    info!("passphrase changed");
    Ok(())
}

/// Export the wrapped key to a file (disaster recovery copy). The export
/// stays passphrase-protected.
pub fn export(
    repo_path: &Path,
    dest: &PathBuf,
    runtime: &RuntimeConfig,
    prompt: PromptFn<'_>,
) -> Result<()> {
    let s = open_session(repo_path, Access::ReadOnly, runtime, prompt, "")?;
    let encrypted = match s.repo.config.key_mode {
        KeyMode::None => {
            return Err(CairnError::Config(
                "unencrypted repositories have no key to export".into(),
            ))
        }
        KeyMode::Repokey => s
            .repo
            .config
            .key
            .clone()
            .ok_or_else(|| CairnError::InvalidFormat("repokey repository has no stored key".into()))?,
        KeyMode::Keyfile => load_keyfile(&keyfile_path(runtime, s.repo.id())?)?.encrypted,
    };
    save_keyfile(
        dest,
        &KeyFile {
            version: 1,
            repo_id: s.repo.id().to_vec(),
            suite: s.repo.config.suite,
            encrypted,
        },
    )?;
    info!(dest = %dest.display(), "key exported");
    Ok(())
}

/// One-shot upgrade attaching a TAM to a manifest that predates it, and
/// flipping the key's TAM-required policy so future opens enforce it.
/// Archive contents are untouched; only the manifest object is rewritten.
pub fn tam_upgrade(repo_path: &Path, runtime: &RuntimeConfig, prompt: PromptFn<'_>) -> Result<()> {
    let mut s = open_session(repo_path, Access::ReadWrite, runtime, prompt, "")?;
    if s.manifest.has_tam() && s.crypto.keys().tam_required {
        info!("manifest already carries a TAM");
        return Ok(());
    }
    s.manifest.save(&mut s.repo, &mut s.crypto)?;
    s.repo.commit(None)?;

    if s.repo.config.key_mode != KeyMode::None && !s.crypto.keys().tam_required {
        let pass =
            passphrase::for_open(runtime, prompt)?.ok_or(CairnError::PassphraseRequired)?;
        let mut keys = s.crypto.keys().clone();
        keys.tam_required = true;
        let wrapped = keys.to_encrypted(&pass)?;
        match s.repo.config.key_mode {
            KeyMode::Repokey => s.repo.store_key(wrapped)?,
            KeyMode::Keyfile => {
                let path = keyfile_path(runtime, s.repo.id())?;
                let mut key_file = load_keyfile(&path)?;
                key_file.encrypted = wrapped;
                save_keyfile(&path, &key_file)?;
            }
            KeyMode::None => {}
        }
    }
    info!("manifest TAM attached");
    Ok(())
}
