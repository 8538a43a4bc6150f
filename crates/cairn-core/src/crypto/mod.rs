//! Authenticated encryption and keyed hashing for repository objects.
//!
//! Every stored object is `[suite tag][suite-specific data]`; for AEAD
//! suites the data is `[12-byte nonce][ciphertext + 16-byte tag]` with the
//! suite tag authenticated as associated data. The plaintext always begins
//! with a one-byte object type tag, so the type travels under the MAC.
//! Nonces are drawn from a strictly monotonic counter persisted in the
//! security directory, never at random.

pub mod key;
pub mod nonce;
pub mod passphrase;
pub mod security;
pub mod tam;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use cairn_types::chunk_id::ChunkId;
use cairn_types::error::{CairnError, Result};

use self::nonce::NonceManager;

/// Object type tags carried in the plaintext prefix of every object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    Manifest = 0,
    Archive = 1,
    ItemStream = 2,
    FileChunk = 3,
}

impl ObjectType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Manifest),
            1 => Ok(Self::Archive),
            2 => Ok(Self::ItemStream),
            3 => Ok(Self::FileChunk),
            _ => Err(CairnError::UnknownObjectType(v)),
        }
    }
}

/// Cipher suite tag, the first byte of every stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CipherSuite {
    Plain = 0x00,
    Aes256Gcm = 0x01,
    Chacha20Poly1305 = 0x02,
}

impl CipherSuite {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x00 => Ok(Self::Plain),
            0x01 => Ok(Self::Aes256Gcm),
            0x02 => Ok(Self::Chacha20Poly1305),
            _ => Err(CairnError::InvalidFormat(format!(
                "unknown cipher suite tag: {v:#04x}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CipherSuite::Plain => "none",
            CipherSuite::Aes256Gcm => "aes256gcm",
            CipherSuite::Chacha20Poly1305 => "chacha20poly1305",
        }
    }

    pub fn is_encrypting(&self) -> bool {
        !matches!(self, CipherSuite::Plain)
    }
}

/// The repository key material. Never stored in plaintext on disk;
/// zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyData {
    pub enc_key: [u8; 32],
    pub id_key: [u8; 32],
    pub chunk_seed: [u8; 32],
    #[zeroize(skip)]
    pub tam_required: bool,
}

impl KeyData {
    /// Generate fresh key material from OS entropy.
    pub fn generate() -> Self {
        let mut enc_key = [0u8; 32];
        let mut id_key = [0u8; 32];
        let mut chunk_seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut enc_key);
        rand::rngs::OsRng.fill_bytes(&mut id_key);
        rand::rngs::OsRng.fill_bytes(&mut chunk_seed);
        Self {
            enc_key,
            id_key,
            chunk_seed,
            tam_required: true,
        }
    }

    /// Compute the id of a plaintext: keyed BLAKE2b-256 under the id key,
    /// XORed with the chunk seed. Stable across re-encryption.
    pub fn id_hash(&self, data: &[u8]) -> ChunkId {
        ChunkId::compute(&self.id_key, &self.chunk_seed, data)
    }

    /// Derive a distinct subkey for a named purpose (TAM, etc).
    pub fn derive_subkey(&self, domain: &[u8]) -> [u8; 32] {
        let mut mac = <Blake2bMac<U32> as Mac>::new_from_slice(&self.id_key)
            .expect("valid 32-byte key for BLAKE2b");
        Mac::update(&mut mac, domain);
        let digest = mac.finalize().into_bytes();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }
}

enum EngineInner {
    Plain,
    Aes(Box<Aes256Gcm>),
    Chacha(Box<ChaCha20Poly1305>),
}

/// Encryption/decryption session for one opened repository.
///
/// Encryption consumes nonces from the [`NonceManager`]; the manager is
/// only present for write sessions holding the exclusive lock.
pub struct CryptoContext {
    suite: CipherSuite,
    keys: KeyData,
    engine: EngineInner,
    nonces: Option<NonceManager>,
}

impl CryptoContext {
    pub fn new(suite: CipherSuite, keys: KeyData, nonces: Option<NonceManager>) -> Self {
        let engine = match suite {
            CipherSuite::Plain => EngineInner::Plain,
            CipherSuite::Aes256Gcm => EngineInner::Aes(Box::new(
                Aes256Gcm::new_from_slice(&keys.enc_key).expect("valid 32-byte key"),
            )),
            CipherSuite::Chacha20Poly1305 => EngineInner::Chacha(Box::new(
                ChaCha20Poly1305::new_from_slice(&keys.enc_key).expect("valid 32-byte key"),
            )),
        };
        Self {
            suite,
            keys,
            engine,
            nonces,
        }
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    pub fn keys(&self) -> &KeyData {
        &self.keys
    }

    pub fn id_hash(&self, data: &[u8]) -> ChunkId {
        self.keys.id_hash(data)
    }

    /// Serialize a typed payload into an encrypted repository object:
    /// plaintext `[type tag][payload]` goes under the AEAD, the suite tag
    /// is authenticated as AAD.
    pub fn pack_object(&mut self, obj_type: ObjectType, payload: &[u8]) -> Result<Vec<u8>> {
        let mut plaintext = Vec::with_capacity(1 + payload.len());
        plaintext.push(obj_type as u8);
        plaintext.extend_from_slice(payload);

        let suite_tag = self.suite as u8;
        match &self.engine {
            EngineInner::Plain => {
                let mut out = Vec::with_capacity(1 + plaintext.len());
                out.push(suite_tag);
                out.extend_from_slice(&plaintext);
                Ok(out)
            }
            _ => {
                let counter = self
                    .nonces
                    .as_mut()
                    .ok_or_else(|| {
                        CairnError::Other("encryption attempted without a nonce reservation".into())
                    })?
                    .reserve(1)?;
                let nonce_bytes = counter_nonce(counter);
                let ciphertext = self.aead_encrypt(&nonce_bytes, &plaintext, &[suite_tag])?;

                let mut out = Vec::with_capacity(1 + 12 + ciphertext.len());
                out.push(suite_tag);
                out.extend_from_slice(&nonce_bytes);
                out.extend_from_slice(&ciphertext);
                Ok(out)
            }
        }
    }

    /// Decrypt and split a stored object into `(type, payload)`.
    /// Rejects any tampering, including a suite tag mismatch.
    pub fn unpack_object(&self, data: &[u8]) -> Result<(ObjectType, Vec<u8>)> {
        if data.is_empty() {
            return Err(CairnError::InvalidFormat("empty object".into()));
        }
        let suite = CipherSuite::from_u8(data[0])?;
        if suite != self.suite {
            // A plaintext object in an encrypted repo (or vice versa) is
            // tampering, not a format variation.
            return Err(CairnError::DecryptionFailed);
        }
        let plaintext = match &self.engine {
            EngineInner::Plain => data[1..].to_vec(),
            _ => {
                if data.len() < 1 + 12 + 16 {
                    return Err(CairnError::DecryptionFailed);
                }
                let nonce_bytes: [u8; 12] = data[1..13].try_into().unwrap();
                self.aead_decrypt(&nonce_bytes, &data[13..], &[data[0]])?
            }
        };
        if plaintext.is_empty() {
            return Err(CairnError::InvalidFormat("empty object plaintext".into()));
        }
        let obj_type = ObjectType::from_u8(plaintext[0])?;
        Ok((obj_type, plaintext[1..].to_vec()))
    }

    /// Decrypt expecting a specific object type.
    pub fn unpack_object_expect(&self, data: &[u8], expected: ObjectType) -> Result<Vec<u8>> {
        let (obj_type, payload) = self.unpack_object(data)?;
        if obj_type != expected {
            return Err(CairnError::InvalidFormat(format!(
                "object has type {obj_type:?}, expected {expected:?}"
            )));
        }
        Ok(payload)
    }

    /// Largest nonce counter this context has observed in stored data.
    /// Used on open to advance the counter past everything in the repo.
    pub fn observe_nonce(&mut self, data: &[u8]) {
        if data.len() >= 13 && CipherSuite::from_u8(data[0]).map_or(false, |s| s.is_encrypting()) {
            let counter = u64::from_be_bytes(data[5..13].try_into().unwrap());
            if let Some(nonces) = self.nonces.as_mut() {
                nonces.advance_past(counter);
            }
        }
    }

    fn aead_encrypt(&self, nonce: &[u8; 12], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        match &self.engine {
            EngineInner::Aes(cipher) => cipher
                .encrypt(Nonce::from_slice(nonce), payload)
                .map_err(|e| CairnError::Other(format!("AES-GCM encrypt: {e}"))),
            EngineInner::Chacha(cipher) => cipher
                .encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
                .map_err(|e| CairnError::Other(format!("ChaCha20-Poly1305 encrypt: {e}"))),
            EngineInner::Plain => unreachable!("plain suite never calls aead_encrypt"),
        }
    }

    fn aead_decrypt(&self, nonce: &[u8; 12], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        match &self.engine {
            EngineInner::Aes(cipher) => cipher
                .decrypt(Nonce::from_slice(nonce), payload)
                .map_err(|_| CairnError::DecryptionFailed),
            EngineInner::Chacha(cipher) => cipher
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
                .map_err(|_| CairnError::DecryptionFailed),
            EngineInner::Plain => unreachable!("plain suite never calls aead_decrypt"),
        }
    }
}

/// Build a 12-byte nonce from the monotonic counter: 4 zero bytes then the
/// counter big-endian. Uniqueness follows from counter monotonicity.
fn counter_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}
