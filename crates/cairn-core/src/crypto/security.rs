//! Client-side security state for known repositories.
//!
//! The security directory holds one subdirectory per repository id with a
//! record of where that repository was last seen and which key mode it
//! used. Accessing an unknown unencrypted repository, or a repository that
//! moved, is refused unless explicitly acknowledged; both are the classic
//! setup for swapping a hostile repository under a trusting client.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use cairn_types::error::{CairnError, Result};

use super::key::KeyMode;
use crate::config::RuntimeConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SecurityRecord {
    location: String,
    key_mode: KeyMode,
}

pub struct SecurityManager {
    dir: PathBuf,
}

impl SecurityManager {
    /// Security state directory for one repository.
    pub fn for_repo(config: &RuntimeConfig, repo_id: &[u8]) -> Result<Self> {
        let base = config
            .security_base()
            .ok_or_else(|| CairnError::Config("no security directory available".into()))?;
        Ok(Self {
            dir: base.join(hex::encode(repo_id)),
        })
    }

    /// A throwaway manager rooted at an explicit directory (tests).
    pub fn at(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn nonce_file(&self) -> PathBuf {
        self.dir.join("nonce")
    }

    fn record_file(&self) -> PathBuf {
        self.dir.join("location")
    }

    fn load(&self) -> Result<Option<SecurityRecord>> {
        match fs::read(self.record_file()) {
            Ok(data) => Ok(Some(rmp_serde::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, record: &SecurityRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.record_file(), rmp_serde::to_vec(record)?)?;
        Ok(())
    }

    /// Record a repository we just created ourselves; no checks apply to
    /// first contact with our own repository.
    pub fn register(&self, location: &str, key_mode: KeyMode) -> Result<()> {
        self.store(&SecurityRecord {
            location: location.to_string(),
            key_mode,
        })
    }

    /// Validate this access against the stored record and update it.
    ///
    /// - First contact with an unencrypted repository requires the
    ///   unknown-unencrypted acknowledgement.
    /// - A changed location requires the relocation acknowledgement.
    pub fn assert_access(
        &self,
        config: &RuntimeConfig,
        location: &str,
        key_mode: KeyMode,
    ) -> Result<()> {
        match self.load()? {
            None => {
                if key_mode == KeyMode::None && !config.unknown_unencrypted_repo_ok {
                    return Err(CairnError::UnknownUnencryptedRepo(location.to_string()));
                }
                debug!(location, "registering repository in security directory");
            }
            Some(record) => {
                if record.location != location && !config.relocated_repo_ok {
                    return Err(CairnError::RepositoryRelocated {
                        previous: record.location,
                        current: location.to_string(),
                    });
                }
            }
        }
        self.store(&SecurityRecord {
            location: location.to_string(),
            key_mode,
        })
    }
}
