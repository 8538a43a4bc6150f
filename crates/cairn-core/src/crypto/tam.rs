//! Tertiary authentication for the manifest (TAM).
//!
//! The manifest is the root of trust for the archive list, so it carries
//! its own keyed MAC under a subkey distinct from the id key. Clients
//! refuse manifests lacking or failing the TAM whenever the key demands
//! it; repositories created before TAM can be upgraded in place.

use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use cairn_types::error::{CairnError, Result};

use super::KeyData;

const TAM_DOMAIN: &[u8] = b"cairn manifest tam v1";

/// The authentication record embedded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tam {
    pub salt: Vec<u8>,
    pub mac: Vec<u8>,
}

fn mac_bytes(key: &KeyData, salt: &[u8], data: &[u8]) -> Vec<u8> {
    let subkey = key.derive_subkey(TAM_DOMAIN);
    let mut mac =
        Blake2bMac::<U32>::new_from_slice(&subkey).expect("valid 32-byte key for BLAKE2b");
    Mac::update(&mut mac, salt);
    Mac::update(&mut mac, data);
    mac.finalize().into_bytes().to_vec()
}

/// Authenticate canonical manifest bytes.
pub fn sign(key: &KeyData, canonical: &[u8]) -> Tam {
    let mut salt = vec![0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let mac = mac_bytes(key, &salt, canonical);
    Tam { salt, mac }
}

/// Verify a TAM over canonical manifest bytes.
///
/// `required` reflects the key's policy: a missing TAM is fatal when
/// required, silently tolerated otherwise (pre-upgrade repositories).
pub fn verify(key: &KeyData, canonical: &[u8], tam: Option<&Tam>, required: bool) -> Result<()> {
    let Some(tam) = tam else {
        return if required {
            Err(CairnError::TamRequired)
        } else {
            Ok(())
        };
    };
    let expected = mac_bytes(key, &tam.salt, canonical);
    // Constant-time-ish comparison; a length mismatch is an outright reject.
    if tam.mac.len() != expected.len() {
        return Err(CairnError::TamInvalid);
    }
    let mut diff = 0u8;
    for (a, b) in tam.mac.iter().zip(expected.iter()) {
        diff |= a ^ b;
    }
    if diff != 0 {
        return Err(CairnError::TamInvalid);
    }
    Ok(())
}
