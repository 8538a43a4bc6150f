//! Key formats and passphrase wrapping.
//!
//! Three modes: `none` (no stored key; ids use a key derived from the
//! repository id), `repokey` (wrapped key material embedded in the
//! repository config) and `keyfile` (same wrapping, stored in the client's
//! key directory). Wrapping is Argon2id over the passphrase plus
//! AES-256-GCM, with the KDF parameters bound as associated data so a
//! tampered header cannot redirect the derivation.

use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use cairn_types::error::{CairnError, Result};

use super::{CipherSuite, KeyData};
use crate::config::RuntimeConfig;

/// Where the key material for a repository lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyMode {
    None,
    Repokey,
    Keyfile,
}

impl KeyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyMode::None => "none",
            KeyMode::Repokey => "repokey",
            KeyMode::Keyfile => "keyfile",
        }
    }
}

/// KDF parameters stored alongside the wrapped key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

/// Passphrase-wrapped key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKey {
    pub kdf: KdfParams,
    pub nonce: Vec<u8>,
    pub payload: Vec<u8>,
}

/// On-disk format of a keyfile-mode key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub version: u32,
    pub repo_id: Vec<u8>,
    pub suite: CipherSuite,
    pub encrypted: EncryptedKey,
}

/// Serialized payload inside the wrapped blob. Zeroized on drop.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeyPayload {
    enc_key: Vec<u8>,
    id_key: Vec<u8>,
    chunk_seed: Vec<u8>,
    #[zeroize(skip)]
    tam_required: bool,
}

// KDF parameter bounds to reject maliciously crafted key blobs.
const MAX_TIME_COST: u32 = 10;
const MAX_PARALLELISM: u32 = 16;
const MAX_MEMORY_KIB: u32 = 524_288; // 512 MiB
const MIN_SALT_LEN: usize = 16;
const MAX_SALT_LEN: usize = 64;

fn validate_kdf_params(kdf: &KdfParams) -> Result<()> {
    if kdf.algorithm != "argon2id"
        || kdf.time_cost == 0
        || kdf.time_cost > MAX_TIME_COST
        || kdf.parallelism == 0
        || kdf.parallelism > MAX_PARALLELISM
        || kdf.memory_cost == 0
        || kdf.memory_cost > MAX_MEMORY_KIB
        || kdf.salt.len() < MIN_SALT_LEN
        || kdf.salt.len() > MAX_SALT_LEN
    {
        return Err(CairnError::DecryptionFailed);
    }
    Ok(())
}

/// Stable AAD bytes from KDF parameters: manual byte encoding with no
/// serde dependency, so it never shifts across serializer versions.
fn kdf_params_aad(kdf: &KdfParams) -> Vec<u8> {
    let prefix = b"cairn:kdf-aad:v1\0";
    let algo_bytes = kdf.algorithm.as_bytes();
    let mut buf =
        Vec::with_capacity(prefix.len() + 4 + algo_bytes.len() + 4 + 4 + 4 + 4 + kdf.salt.len());
    buf.extend_from_slice(prefix);
    buf.extend_from_slice(&(algo_bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(algo_bytes);
    buf.extend_from_slice(&kdf.time_cost.to_le_bytes());
    buf.extend_from_slice(&kdf.memory_cost.to_le_bytes());
    buf.extend_from_slice(&kdf.parallelism.to_le_bytes());
    buf.extend_from_slice(&(kdf.salt.len() as u32).to_le_bytes());
    buf.extend_from_slice(&kdf.salt);
    buf
}

fn derive_wrapping_key(passphrase: &str, kdf: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    let params = argon2::Params::new(kdf.memory_cost, kdf.time_cost, kdf.parallelism, Some(32))
        .map_err(|e| CairnError::KeyDerivation(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), &kdf.salt, output.as_mut())
        .map_err(|e| CairnError::KeyDerivation(format!("argon2 hash: {e}")))?;
    Ok(output)
}

impl KeyData {
    /// Wrap the key material with a passphrase.
    pub fn to_encrypted(&self, passphrase: &str) -> Result<EncryptedKey> {
        let mut salt = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        let kdf = KdfParams {
            algorithm: "argon2id".to_string(),
            time_cost: 3,
            memory_cost: 65536, // 64 MiB
            parallelism: 4,
            salt,
        };
        let wrapping_key = derive_wrapping_key(passphrase, &kdf)?;

        let payload = KeyPayload {
            enc_key: self.enc_key.to_vec(),
            id_key: self.id_key.to_vec(),
            chunk_seed: self.chunk_seed.to_vec(),
            tam_required: self.tam_required,
        };
        let plaintext = Zeroizing::new(rmp_serde::to_vec(&payload)?);

        let aad = kdf_params_aad(&kdf);
        let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
            .map_err(|e| CairnError::KeyDerivation(format!("cipher init: {e}")))?;
        let mut nonce_bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext.as_ref(),
                    aad: &aad,
                },
            )
            .map_err(|e| CairnError::KeyDerivation(format!("encrypt: {e}")))?;

        Ok(EncryptedKey {
            kdf,
            nonce: nonce_bytes.to_vec(),
            payload: ciphertext,
        })
    }

    /// Unwrap key material from its stored form.
    pub fn from_encrypted(encrypted: &EncryptedKey, passphrase: &str) -> Result<Self> {
        if encrypted.nonce.len() != 12 {
            return Err(CairnError::DecryptionFailed);
        }
        validate_kdf_params(&encrypted.kdf)?;

        let wrapping_key = derive_wrapping_key(passphrase, &encrypted.kdf)?;
        let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
            .map_err(|_| CairnError::DecryptionFailed)?;
        let aad = kdf_params_aad(&encrypted.kdf);
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&encrypted.nonce),
                Payload {
                    msg: encrypted.payload.as_ref(),
                    aad: &aad,
                },
            )
            .map_err(|_| CairnError::DecryptionFailed)?;
        let plaintext = Zeroizing::new(plaintext);

        let payload: KeyPayload =
            rmp_serde::from_slice(&plaintext).map_err(|_| CairnError::DecryptionFailed)?;
        if payload.enc_key.len() != 32
            || payload.id_key.len() != 32
            || payload.chunk_seed.len() != 32
        {
            return Err(CairnError::DecryptionFailed);
        }

        let mut enc_key = [0u8; 32];
        let mut id_key = [0u8; 32];
        let mut chunk_seed = [0u8; 32];
        enc_key.copy_from_slice(&payload.enc_key);
        id_key.copy_from_slice(&payload.id_key);
        chunk_seed.copy_from_slice(&payload.chunk_seed);

        Ok(Self {
            enc_key,
            id_key,
            chunk_seed,
            tam_required: payload.tam_required,
        })
    }

    /// Key material for an unencrypted repository: the id key is derived
    /// from the repository id so ids are still repository-specific, and
    /// nothing needs to be stored.
    pub fn for_unencrypted(repo_id: &[u8]) -> Self {
        let mut id_key = [0u8; 32];
        let mut hasher = Blake2bVar::new(32).unwrap();
        hasher.update(repo_id);
        hasher.finalize_variable(&mut id_key).unwrap();
        Self {
            enc_key: [0u8; 32],
            id_key,
            chunk_seed: [0u8; 32],
            tam_required: false,
        }
    }

    /// Re-wrap the same key material under a new passphrase.
    pub fn change_passphrase(&self, new_passphrase: &str) -> Result<EncryptedKey> {
        self.to_encrypted(new_passphrase)
    }
}

/// Path of the key file for a repository: explicit override, else
/// `<key dir>/<repo id hex>`.
pub fn keyfile_path(config: &RuntimeConfig, repo_id: &[u8]) -> Result<PathBuf> {
    if let Some(path) = &config.key_file {
        return Ok(path.clone());
    }
    config
        .key_dir()
        .map(|d| d.join(hex::encode(repo_id)))
        .ok_or_else(|| CairnError::Config("no key directory available".into()))
}

pub fn save_keyfile(path: &Path, key_file: &KeyFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, rmp_serde::to_vec(key_file)?)?;
    Ok(())
}

pub fn load_keyfile(path: &Path) -> Result<KeyFile> {
    let data = std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CairnError::KeyFileNotFound(path.display().to_string())
        } else {
            e.into()
        }
    })?;
    Ok(rmp_serde::from_slice(&data)?)
}
