//! Archive metadata objects and the item stream.
//!
//! An archive names an ordered list of meta-chunk ids; those chunks hold
//! the serialised item records and are produced by running the item
//! stream through the ordinary chunker, so archive metadata deduplicates
//! across snapshots. Nothing here ever materialises a whole archive in
//! memory: items are written out as the stream crosses chunk boundaries
//! and read back one at a time.

pub mod item;
pub mod manifest;

use std::io::Cursor;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cairn_types::chunk_id::ChunkId;
use cairn_types::error::{CairnError, Result};

use crate::cache::chunks::ChunksIndex;
use crate::chunker::Chunker;
use crate::compress::{self, Compression};
use crate::config::ChunkerParams;
use crate::crypto::{CryptoContext, ObjectType};
use crate::repo::Repository;

use self::item::{ChunkRef, Item};

/// Compression for metadata objects (manifest, archive, item stream).
/// File content uses the configured spec; metadata always packs well.
pub fn metadata_compression() -> Compression {
    Compression::Lz4
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub nfiles: u64,
    pub original_size: u64,
    pub compressed_size: u64,
    pub deduplicated_size: u64,
    /// Files skipped because they could not be read.
    #[serde(default)]
    pub errors: u64,
}

/// The archive metadata object. Its id is the keyed hash of its
/// serialised form, so identical archives share one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive {
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub comment: String,
    pub hostname: String,
    pub username: String,
    #[serde(default)]
    pub command_line: Vec<String>,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub chunker_params: ChunkerParams,
    pub compression: String,
    /// Ordered meta-chunks holding the serialised item stream.
    pub item_ptrs: Vec<ChunkId>,
    #[serde(default)]
    pub stats: ArchiveStats,
}

impl Archive {
    /// Store the archive object. Returns `(id, size, csize)`.
    pub fn save(
        &self,
        repo: &mut Repository,
        crypto: &mut CryptoContext,
    ) -> Result<(ChunkId, u32, u32)> {
        let payload = rmp_serde::to_vec(self)?;
        let id = crypto.id_hash(&payload);
        let compressed = compress::compress(&metadata_compression(), &payload)?;
        let packed = crypto.pack_object(ObjectType::Archive, &compressed)?;
        let csize = packed.len() as u32;
        repo.put(&id, &packed)?;
        Ok((id, payload.len() as u32, csize))
    }

    /// Fetch, decrypt, and verify an archive object.
    pub fn load(repo: &mut Repository, crypto: &CryptoContext, id: &ChunkId) -> Result<Archive> {
        Ok(Self::load_with_sizes(repo, crypto, id)?.0)
    }

    /// As [`load`](Self::load), also returning `(size, csize)`.
    pub fn load_with_sizes(
        repo: &mut Repository,
        crypto: &CryptoContext,
        id: &ChunkId,
    ) -> Result<(Archive, u32, u32)> {
        let data = repo.get(id)?;
        let compressed = crypto.unpack_object_expect(&data, ObjectType::Archive)?;
        let payload = compress::decompress(&compressed)?;
        if &crypto.id_hash(&payload) != id {
            return Err(CairnError::IdMismatch(*id));
        }
        let archive: Archive = rmp_serde::from_slice(&payload)?;
        Ok((archive, payload.len() as u32, data.len() as u32))
    }
}

// ----- chunk storage with dedup -----

/// Store one chunk, deduplicating against the chunks index.
///
/// On a dedup hit only the refcount moves; otherwise the chunk is
/// compressed, encrypted, and PUT. Returns the reference and whether new
/// data was written.
pub fn store_chunk(
    repo: &mut Repository,
    crypto: &mut CryptoContext,
    chunks: &mut ChunksIndex,
    obj_type: ObjectType,
    compression: &Compression,
    data: &[u8],
) -> Result<(ChunkRef, bool)> {
    let id = crypto.id_hash(data);
    if let Some(entry) = chunks.get(&id).copied() {
        // The index check guards against a cache that survived a repair:
        // a recorded chunk the repository no longer holds must be
        // rewritten, not deduplicated against.
        if repo.contains(&id) {
            chunks.add(id, entry.size, entry.csize);
            return Ok((
                ChunkRef {
                    id,
                    size: entry.size,
                    csize: entry.csize,
                },
                false,
            ));
        }
    }

    let compressed = compress::compress(compression, data)?;
    let packed = crypto.pack_object(obj_type, &compressed)?;
    let csize = packed.len() as u32;
    repo.put(&id, &packed)?;
    chunks.add(id, data.len() as u32, csize);
    Ok((
        ChunkRef {
            id,
            size: data.len() as u32,
            csize,
        },
        true,
    ))
}

/// Fetch a stored chunk of the given type, decrypt, decompress, and verify
/// that the plaintext re-hashes to its id. Returns `(plaintext, csize)`.
pub fn fetch_chunk(
    repo: &mut Repository,
    crypto: &CryptoContext,
    obj_type: ObjectType,
    id: &ChunkId,
) -> Result<(Vec<u8>, u32)> {
    let data = repo.get(id)?;
    let compressed = crypto.unpack_object_expect(&data, obj_type)?;
    let plaintext = compress::decompress(&compressed)?;
    if &crypto.id_hash(&plaintext) != id {
        return Err(CairnError::IdMismatch(*id));
    }
    Ok((plaintext, data.len() as u32))
}

// ----- item stream writer -----

/// Serialises items and cuts the resulting byte stream into meta-chunks
/// with the item-stream chunker profile. The caller stores each completed
/// chunk as it appears, keeping memory bounded.
pub struct ItemStreamWriter {
    chunker: Chunker,
    complete: Vec<Vec<u8>>,
}

impl ItemStreamWriter {
    pub fn new() -> Result<Self> {
        Ok(Self {
            chunker: Chunker::new(&ChunkerParams::item_stream())?,
            complete: Vec::new(),
        })
    }

    /// Append one item to the stream.
    pub fn push_item(&mut self, item: &Item) -> Result<()> {
        let bytes = rmp_serde::to_vec(item)?;
        self.complete.extend(self.chunker.push(&bytes));
        Ok(())
    }

    /// Meta-chunks completed so far; the caller stores them immediately.
    pub fn take_complete(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.complete)
    }

    /// Flush the trailing partial chunk. The writer starts a fresh chunk
    /// afterwards, so checkpointing can flush mid-stream and continue.
    pub fn flush(&mut self) -> Vec<Vec<u8>> {
        let mut out = std::mem::take(&mut self.complete);
        if let Some(last) = self.chunker.finish() {
            out.push(last);
        }
        out
    }
}

// ----- item stream reader -----

/// Incremental decoder over the concatenated plaintext of meta-chunks.
///
/// Feed chunk plaintexts as they are fetched; decoded items come out one
/// at a time. A decode that runs out of bytes simply waits for the next
/// feed, so items spanning chunk boundaries need no special handling and
/// the whole stream is never buffered at once.
#[derive(Default)]
pub struct ItemDecoder {
    buf: Vec<u8>,
    pos: usize,
}

impl ItemDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, plaintext: &[u8]) {
        // Drop consumed bytes before growing the buffer.
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(plaintext);
    }

    /// Decode the next complete item; `Ok(None)` when more bytes are
    /// needed (or the stream ended cleanly).
    pub fn next_item(&mut self) -> Result<Option<Item>> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&self.buf[self.pos..]);
        match rmp_serde::from_read::<_, Item>(&mut cursor) {
            Ok(item) => {
                self.pos += cursor.position() as usize;
                Ok(Some(item))
            }
            Err(rmp_serde::decode::Error::InvalidMarkerRead(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                Ok(None)
            }
            Err(rmp_serde::decode::Error::InvalidDataRead(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// True when every fed byte was consumed by decoded items.
    pub fn is_drained(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Discard any partially buffered bytes (used by repair when a gap in
    /// the meta-chunks makes the tail undecodable).
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }
}

/// Streamed reader over an archive's items: fetches meta-chunks lazily
/// and yields one item at a time.
pub struct ItemStreamReader<'a> {
    repo: &'a mut Repository,
    crypto: &'a CryptoContext,
    ptrs: Vec<ChunkId>,
    next: usize,
    decoder: ItemDecoder,
}

impl<'a> ItemStreamReader<'a> {
    pub fn new(repo: &'a mut Repository, crypto: &'a CryptoContext, ptrs: Vec<ChunkId>) -> Self {
        Self {
            repo,
            crypto,
            ptrs,
            next: 0,
            decoder: ItemDecoder::new(),
        }
    }

    /// Decode the next item; `Ok(None)` at the clean end of the stream.
    pub fn next_item(&mut self) -> Result<Option<Item>> {
        loop {
            if let Some(item) = self.decoder.next_item()? {
                return Ok(Some(item));
            }
            if self.next >= self.ptrs.len() {
                if !self.decoder.is_drained() {
                    return Err(CairnError::InvalidFormat(
                        "item stream ends with a truncated record".into(),
                    ));
                }
                return Ok(None);
            }
            let id = self.ptrs[self.next];
            self.next += 1;
            let (plaintext, _) =
                fetch_chunk(self.repo, self.crypto, ObjectType::ItemStream, &id)?;
            self.decoder.feed(&plaintext);
        }
    }

    /// Drain the stream into a callback.
    pub fn for_each(mut self, mut f: impl FnMut(Item) -> Result<()>) -> Result<()> {
        while let Some(item) = self.next_item()? {
            f(item)?;
        }
        Ok(())
    }
}
