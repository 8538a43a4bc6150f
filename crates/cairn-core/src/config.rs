use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use cairn_types::error::{CairnError, Result};

/// Content-defined chunker parameters.
///
/// Cut points occur where the low `mask_bits` bits of the rolling hash are
/// zero, so the expected chunk size is about `2^mask_bits` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerParams {
    pub min_size: u32,
    pub max_size: u32,
    pub mask_bits: u32,
    pub window_size: u32,
}

impl Default for ChunkerParams {
    fn default() -> Self {
        Self {
            min_size: 512 * 1024,
            max_size: 8 * 1024 * 1024,
            mask_bits: 21,
            window_size: 4095,
        }
    }
}

impl ChunkerParams {
    /// Finer-grained profile for the item metadata stream.
    pub fn item_stream() -> Self {
        Self {
            min_size: 32 * 1024,
            max_size: 512 * 1024,
            mask_bits: 17,
            window_size: 4095,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_size == 0 || self.min_size >= self.max_size {
            return Err(CairnError::Config(format!(
                "chunker: min_size ({}) must be > 0 and < max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if !(6..=31).contains(&self.mask_bits) {
            return Err(CairnError::Config(format!(
                "chunker: mask_bits ({}) out of range 6..=31",
                self.mask_bits
            )));
        }
        if self.window_size == 0 || self.window_size > self.min_size {
            return Err(CairnError::Config(format!(
                "chunker: window_size ({}) must be > 0 and <= min_size ({})",
                self.window_size, self.min_size
            )));
        }
        Ok(())
    }
}

/// How often `create` flushes a checkpoint archive, in seconds.
pub const DEFAULT_CHECKPOINT_INTERVAL_SECS: u64 = 30 * 60;

/// Generations a files-index entry survives without being seen.
pub const DEFAULT_FILES_CACHE_TTL: u8 = 20;

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_truthy(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref(),
        Some("1") | Some("yes") | Some("YES") | Some("true") | Some("TRUE")
    )
}

/// Environment-derived configuration, collected once at startup into an
/// immutable record. Nothing else in the engine reads the environment.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Default repository location (`CAIRN_REPO`).
    pub repository: Option<String>,
    /// New passphrase for key-change operations (`CAIRN_NEW_PASSPHRASE`).
    pub new_passphrase: Option<String>,
    /// Fixed passphrase (`CAIRN_PASSPHRASE`).
    pub passphrase: Option<String>,
    /// Command whose stdout is the passphrase (`CAIRN_PASSCOMMAND`).
    pub passcommand: Option<String>,
    /// File descriptor to read the passphrase from (`CAIRN_PASSPHRASE_FD`).
    pub passphrase_fd: Option<i32>,
    /// Remote-invocation program override (`CAIRN_RSH`).
    pub rsh: Option<String>,
    /// Path of the engine binary on the remote side (`CAIRN_REMOTE_PATH`).
    pub remote_path: Option<String>,
    /// Cache directory base override (`CAIRN_CACHE_DIR`).
    pub cache_dir: Option<PathBuf>,
    /// Config directory base override (`CAIRN_CONFIG_DIR`).
    pub config_dir: Option<PathBuf>,
    /// Security directory override (`CAIRN_SECURITY_DIR`).
    pub security_dir: Option<PathBuf>,
    /// Explicit key file path (`CAIRN_KEY_FILE`).
    pub key_file: Option<PathBuf>,
    /// Host id override (`CAIRN_HOST_ID`).
    pub host_id: Option<String>,
    /// Self-test disable switch (`CAIRN_SELFTEST=disabled`).
    pub selftest_disabled: bool,
    /// Enabled workarounds (`CAIRN_WORKAROUNDS`, comma-separated).
    pub workarounds: HashSet<String>,
    /// FUSE backend preference list (`CAIRN_FUSE_IMPL`, comma-separated).
    pub fuse_impl: Vec<String>,
    /// Acknowledge access to an unknown unencrypted repository
    /// (`CAIRN_UNKNOWN_UNENCRYPTED_REPO_ACCESS_IS_OK`).
    pub unknown_unencrypted_repo_ok: bool,
    /// Acknowledge access to a relocated repository
    /// (`CAIRN_RELOCATED_REPO_ACCESS_IS_OK`).
    pub relocated_repo_ok: bool,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            repository: env_nonempty("CAIRN_REPO"),
            new_passphrase: env_nonempty("CAIRN_NEW_PASSPHRASE"),
            passphrase: std::env::var("CAIRN_PASSPHRASE").ok(),
            passcommand: env_nonempty("CAIRN_PASSCOMMAND"),
            passphrase_fd: env_nonempty("CAIRN_PASSPHRASE_FD").and_then(|v| v.parse().ok()),
            rsh: env_nonempty("CAIRN_RSH"),
            remote_path: env_nonempty("CAIRN_REMOTE_PATH"),
            cache_dir: env_nonempty("CAIRN_CACHE_DIR").map(PathBuf::from),
            config_dir: env_nonempty("CAIRN_CONFIG_DIR").map(PathBuf::from),
            security_dir: env_nonempty("CAIRN_SECURITY_DIR").map(PathBuf::from),
            key_file: env_nonempty("CAIRN_KEY_FILE").map(PathBuf::from),
            host_id: env_nonempty("CAIRN_HOST_ID"),
            selftest_disabled: std::env::var("CAIRN_SELFTEST").ok().as_deref()
                == Some("disabled"),
            workarounds: env_nonempty("CAIRN_WORKAROUNDS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            fuse_impl: env_nonempty("CAIRN_FUSE_IMPL")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            unknown_unencrypted_repo_ok: env_truthy("CAIRN_UNKNOWN_UNENCRYPTED_REPO_ACCESS_IS_OK"),
            relocated_repo_ok: env_truthy("CAIRN_RELOCATED_REPO_ACCESS_IS_OK"),
        }
    }

    /// Base directory for client-side caches (chunks index, files index).
    pub fn cache_base(&self) -> Option<PathBuf> {
        self.cache_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|d| d.join("cairn")))
    }

    /// Base directory for configuration (key files, security dir).
    pub fn config_base(&self) -> Option<PathBuf> {
        self.config_dir
            .clone()
            .or_else(|| dirs::config_dir().map(|d| d.join("cairn")))
    }

    /// Directory holding per-repository security state (location, nonce).
    pub fn security_base(&self) -> Option<PathBuf> {
        self.security_dir
            .clone()
            .or_else(|| self.config_base().map(|d| d.join("security")))
    }

    /// Directory holding key files for keyfile-mode repositories.
    pub fn key_dir(&self) -> Option<PathBuf> {
        self.config_base().map(|d| d.join("keys"))
    }
}
