//! The manifest: the repository-root object listing every archive.
//!
//! It lives at the fixed all-zero id and is updated read-modify-write
//! under the exclusive lock. When the key demands it, the manifest
//! carries a TAM (a keyed MAC over its canonical serialisation) and
//! clients refuse manifests lacking or failing it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cairn_types::chunk_id::MANIFEST_ID;
use cairn_types::chunk_id::ChunkId;
use cairn_types::error::Result;

use crate::config::ChunkerParams;
use crate::crypto::tam::{self, Tam};
use crate::crypto::{CryptoContext, KeyData, ObjectType};
use crate::repo::Repository;

pub const MANIFEST_VERSION: u32 = 1;

/// Suffix marking partial archives flushed during long-running backups.
pub const CHECKPOINT_SUFFIX: &str = ".checkpoint";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub id: ChunkId,
    pub time: DateTime<Utc>,
}

/// Server-side defaults recorded at init time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    pub chunker_params: ChunkerParams,
    /// Compression spec hint for new archives.
    pub compression: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub archives: BTreeMap<String, ArchiveEntry>,
    pub config: ManifestConfig,
    pub tam: Option<Tam>,
}

impl Manifest {
    pub fn new(chunker_params: ChunkerParams, compression: Option<String>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            timestamp: Utc::now(),
            archives: BTreeMap::new(),
            config: ManifestConfig {
                chunker_params,
                compression,
            },
            tam: None,
        }
    }

    /// The TAM-covered bytes: the manifest serialised with the TAM field
    /// cleared.
    fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut stripped = self.clone();
        stripped.tam = None;
        Ok(rmp_serde::to_vec(&stripped)?)
    }

    /// Load and authenticate the manifest.
    pub fn load(repo: &mut Repository, crypto: &CryptoContext) -> Result<Self> {
        let data = repo.get(&MANIFEST_ID)?;
        let compressed = crypto.unpack_object_expect(&data, ObjectType::Manifest)?;
        let payload = crate::compress::decompress(&compressed)?;
        let manifest: Manifest = rmp_serde::from_slice(&payload)?;
        tam::verify(
            crypto.keys(),
            &manifest.canonical_bytes()?,
            manifest.tam.as_ref(),
            crypto.keys().tam_required,
        )?;
        Ok(manifest)
    }

    /// Authenticate and store the manifest (read-modify-write tail).
    pub fn save(&mut self, repo: &mut Repository, crypto: &mut CryptoContext) -> Result<()> {
        self.timestamp = Utc::now();
        self.tam = None;
        let canonical = self.canonical_bytes()?;
        self.tam = Some(tam::sign(crypto.keys(), &canonical));
        let payload = rmp_serde::to_vec(self)?;
        let compressed = crate::compress::compress(&super::metadata_compression(), &payload)?;
        let packed = crypto.pack_object(ObjectType::Manifest, &compressed)?;
        repo.put(&MANIFEST_ID, &packed)
    }

    pub fn has_tam(&self) -> bool {
        self.tam.is_some()
    }

    /// Token identifying the archive set, used to validate client caches.
    pub fn sync_token(&self, keys: &KeyData) -> Result<Vec<u8>> {
        let bytes = rmp_serde::to_vec(&self.archives)?;
        Ok(keys.id_hash(&bytes).0.to_vec())
    }

    pub fn get(&self, name: &str) -> Option<&ArchiveEntry> {
        self.archives.get(name)
    }

    /// Archive names in sorted order. Checkpoint archives are hidden
    /// unless explicitly requested.
    pub fn archive_names(&self, consider_checkpoints: bool) -> Vec<&str> {
        self.archives
            .keys()
            .filter(|name| consider_checkpoints || !name.ends_with(CHECKPOINT_SUFFIX))
            .map(String::as_str)
            .collect()
    }

    pub fn insert(&mut self, name: String, id: ChunkId, time: DateTime<Utc>) {
        self.archives.insert(name, ArchiveEntry { id, time });
    }

    pub fn remove(&mut self, name: &str) -> Option<ArchiveEntry> {
        self.archives.remove(name)
    }
}
