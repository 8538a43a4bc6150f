use std::path::{Path, PathBuf};

use crate::commands::init::{self, InitOptions};
use crate::config::{ChunkerParams, RuntimeConfig};
use crate::crypto::key::KeyMode;
use crate::crypto::CipherSuite;

pub const TEST_PASSPHRASE: &str = "test-pass";

/// A runtime config fully contained in a temp directory: no environment
/// reads, no writes outside the test sandbox.
pub fn test_runtime(base: &Path) -> RuntimeConfig {
    RuntimeConfig {
        passphrase: Some(TEST_PASSPHRASE.to_string()),
        cache_dir: Some(base.join("cache")),
        config_dir: Some(base.join("config")),
        security_dir: Some(base.join("security")),
        unknown_unencrypted_repo_ok: true,
        ..Default::default()
    }
}

/// Small chunker parameters so tests exercise multi-chunk files without
/// megabytes of fixture data.
pub fn tiny_chunker_params() -> ChunkerParams {
    ChunkerParams {
        min_size: 128,
        max_size: 4096,
        mask_bits: 8,
        window_size: 63,
    }
}

pub fn init_repo(repo: &Path, runtime: &RuntimeConfig, key_mode: KeyMode) {
    let suite = match key_mode {
        KeyMode::None => CipherSuite::Plain,
        _ => CipherSuite::Chacha20Poly1305,
    };
    init::run(
        repo,
        &InitOptions {
            key_mode,
            suite,
            chunker_params: tiny_chunker_params(),
            compression: Some("auto,lz4".into()),
        },
        runtime,
        None,
    )
    .expect("failed to init test repo");
}

/// A sandbox holding a repository plus source and restore directories.
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub runtime: RuntimeConfig,
}

impl TestEnv {
    pub fn new(key_mode: KeyMode) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        init_repo(&dir.path().join("repo"), &runtime, key_mode);
        Self { dir, runtime }
    }

    pub fn repo_path(&self) -> PathBuf {
        self.dir.path().join("repo")
    }

    pub fn src_path(&self) -> PathBuf {
        let p = self.dir.path().join("src");
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    pub fn restore_path(&self) -> PathBuf {
        let p = self.dir.path().join("restore");
        std::fs::create_dir_all(&p).unwrap();
        p
    }
}

/// Deterministic pseudo-random bytes for fixtures (content-defined cuts
/// need non-constant data).
pub fn patterned_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}
