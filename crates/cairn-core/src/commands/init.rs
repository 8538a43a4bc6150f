//! Initialize a new repository: key generation, on-disk layout, empty
//! authenticated manifest, first commit.

use std::path::Path;

use chrono::Utc;
use rand::RngCore;
use tracing::info;

use cairn_types::error::{CairnError, Result};

use crate::archive::manifest::Manifest;
use crate::config::{ChunkerParams, RuntimeConfig};
use crate::crypto::key::{keyfile_path, save_keyfile, KeyFile, KeyMode};
use crate::crypto::nonce::NonceManager;
use crate::crypto::passphrase::{self, PromptFn};
use crate::crypto::security::SecurityManager;
use crate::crypto::{CipherSuite, CryptoContext, KeyData};
use crate::platform;
use crate::repo::segment::{DEFAULT_MAX_SEGMENT_SIZE, DEFAULT_SEGMENTS_PER_DIR};
use crate::repo::{RepoConfig, Repository};

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub key_mode: KeyMode,
    pub suite: CipherSuite,
    pub chunker_params: ChunkerParams,
    /// Default compression spec recorded in the manifest.
    pub compression: Option<String>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            key_mode: KeyMode::Repokey,
            suite: CipherSuite::Chacha20Poly1305,
            chunker_params: ChunkerParams::default(),
            compression: None,
        }
    }
}

pub fn run(
    repo_path: &Path,
    options: &InitOptions,
    runtime: &RuntimeConfig,
    prompt: PromptFn<'_>,
) -> Result<()> {
    options.chunker_params.validate()?;
    if let Some(spec) = &options.compression {
        crate::compress::Compression::from_spec(spec)?;
    }
    match (options.key_mode, options.suite.is_encrypting()) {
        (KeyMode::None, true) => {
            return Err(CairnError::Config(
                "an encrypting cipher suite requires repokey or keyfile mode".into(),
            ))
        }
        (KeyMode::Repokey | KeyMode::Keyfile, false) => {
            return Err(CairnError::Config(
                "repokey/keyfile modes require an encrypting cipher suite".into(),
            ))
        }
        _ => {}
    }

    let mut repo_id = vec![0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut repo_id);

    // Generate and (for encrypted modes) wrap the key material.
    let (keys, wrapped) = match options.key_mode {
        KeyMode::None => (KeyData::for_unencrypted(&repo_id), None),
        KeyMode::Repokey | KeyMode::Keyfile => {
            let keys = KeyData::generate();
            let pass =
                passphrase::for_new(runtime, prompt)?.ok_or(CairnError::PassphraseRequired)?;
            let wrapped = keys.to_encrypted(&pass)?;
            (keys, Some(wrapped))
        }
    };

    let repo_config = RepoConfig {
        version: 1,
        id: repo_id.clone(),
        segments_per_dir: DEFAULT_SEGMENTS_PER_DIR,
        max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
        key_mode: options.key_mode,
        suite: options.suite,
        key: match options.key_mode {
            KeyMode::Repokey => wrapped.clone(),
            _ => None,
        },
        created: Utc::now(),
    };

    let host_id = platform::host_id(runtime.host_id.as_deref());
    let mut repo = Repository::create(repo_path, repo_config, &host_id)?;

    if options.key_mode == KeyMode::Keyfile {
        let path = keyfile_path(runtime, &repo_id)?;
        save_keyfile(
            &path,
            &KeyFile {
                version: 1,
                repo_id: repo_id.clone(),
                suite: options.suite,
                encrypted: wrapped.expect("keyfile mode always wraps"),
            },
        )?;
        info!(path = %path.display(), "key file written");
    }

    let security = SecurityManager::for_repo(runtime, &repo_id)?;
    security.register(&repo.location(), options.key_mode)?;

    let nonces = options.suite.is_encrypting().then(|| {
        NonceManager::open(repo.path().join("nonce"), security.nonce_file(), false)
    });
    let nonces = nonces.transpose()?;

    let mut crypto = CryptoContext::new(options.suite, keys, nonces);
    let mut manifest = Manifest::new(
        options.chunker_params.clone(),
        options.compression.clone(),
    );
    manifest.save(&mut repo, &mut crypto)?;
    repo.commit(None)?;

    info!(
        repo = %repo.location(),
        mode = options.key_mode.as_str(),
        suite = options.suite.as_str(),
        "repository initialized"
    );
    Ok(())
}
