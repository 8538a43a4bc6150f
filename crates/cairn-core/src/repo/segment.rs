//! Segment file format.
//!
//! A segment is an append-only file starting with a magic header, followed
//! by framed entries:
//!
//! ```text
//! [crc32 LE][size LE][tag][id: 32 bytes (PUT/DELETE)][payload (PUT)]
//! ```
//!
//! `size` is the total entry size including the CRC and size fields; the
//! CRC covers everything after itself. A COMMIT entry seals the segment
//! and marks a transaction boundary. No entry ever straddles segments.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use cairn_types::chunk_id::ChunkId;
use cairn_types::error::{CairnError, Result};

pub const SEGMENT_MAGIC: &[u8; 8] = b"CAIRNSEG";
pub const SEGMENT_VERSION: u32 = 1;
pub const SEGMENT_HEADER_SIZE: u64 = 12;

pub const TAG_PUT: u8 = 0;
pub const TAG_DELETE: u8 = 1;
pub const TAG_COMMIT: u8 = 2;

/// crc32 + size + tag.
const ENTRY_HEADER_SIZE: u64 = 9;
const ID_SIZE: u64 = 32;

pub const PUT_OVERHEAD: u64 = ENTRY_HEADER_SIZE + ID_SIZE;
pub const DELETE_SIZE: u64 = ENTRY_HEADER_SIZE + ID_SIZE;
pub const COMMIT_SIZE: u64 = ENTRY_HEADER_SIZE;

/// Hard cap on a single object payload (well above the largest chunk the
/// engine produces, incl. compression/encryption overhead).
pub const MAX_OBJECT_SIZE: u64 = 40 * 1024 * 1024;

/// Default upper bound for one segment file.
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 500 * 1024 * 1024;

/// Directory fan-out: at most this many segments per `data/<bucket>/`.
pub const DEFAULT_SEGMENTS_PER_DIR: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Put { id: ChunkId, payload: Vec<u8> },
    Delete { id: ChunkId },
    Commit,
}

fn encode_entry(tag: u8, id: Option<&ChunkId>, payload: Option<&[u8]>) -> Vec<u8> {
    let size = ENTRY_HEADER_SIZE
        + id.map_or(0, |_| ID_SIZE)
        + payload.map_or(0, |p| p.len() as u64);
    let mut buf = Vec::with_capacity(size as usize);
    buf.extend_from_slice(&[0u8; 4]); // crc placeholder
    buf.extend_from_slice(&(size as u32).to_le_bytes());
    buf.push(tag);
    if let Some(id) = id {
        buf.extend_from_slice(&id.0);
    }
    if let Some(payload) = payload {
        buf.extend_from_slice(payload);
    }
    let crc = crc32fast::hash(&buf[4..]);
    buf[..4].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Append-only writer for one segment file.
pub struct SegmentWriter {
    out: BufWriter<File>,
    path: PathBuf,
    segment: u64,
    offset: u64,
}

impl SegmentWriter {
    pub fn create(path: &Path, segment: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let mut out = BufWriter::new(file);
        out.write_all(SEGMENT_MAGIC)?;
        out.write_all(&SEGMENT_VERSION.to_le_bytes())?;
        Ok(Self {
            out,
            path: path.to_path_buf(),
            segment,
            offset: SEGMENT_HEADER_SIZE,
        })
    }

    pub fn segment(&self) -> u64 {
        self.segment
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn append(&mut self, entry: Vec<u8>) -> Result<u64> {
        let offset = self.offset;
        self.out.write_all(&entry)?;
        self.offset += entry.len() as u64;
        Ok(offset)
    }

    /// Append a PUT entry; returns its offset and on-disk size.
    pub fn put(&mut self, id: &ChunkId, payload: &[u8]) -> Result<(u64, u64)> {
        if payload.len() as u64 > MAX_OBJECT_SIZE {
            return Err(CairnError::InvalidFormat(format!(
                "object of {} bytes exceeds the maximum object size",
                payload.len()
            )));
        }
        let entry = encode_entry(TAG_PUT, Some(id), Some(payload));
        let size = entry.len() as u64;
        Ok((self.append(entry)?, size))
    }

    pub fn delete(&mut self, id: &ChunkId) -> Result<u64> {
        self.append(encode_entry(TAG_DELETE, Some(id), None))
    }

    pub fn commit(&mut self) -> Result<u64> {
        self.append(encode_entry(TAG_COMMIT, None, None))
    }

    /// Make buffered entries visible to readers of the same file.
    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    /// Flush and fsync. Durability point for COMMIT.
    pub fn sync(&mut self) -> Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Validate a segment file's header, returning the opened file positioned
/// after it.
fn open_checked(path: &Path, segment: u64) -> Result<File> {
    let mut file = File::open(path)?;
    let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
    if file.read_exact(&mut header).is_err() {
        return Err(CairnError::UnknownSegmentMagic { segment });
    }
    if &header[..8] != SEGMENT_MAGIC {
        return Err(CairnError::UnknownSegmentMagic { segment });
    }
    let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
    if version != SEGMENT_VERSION {
        return Err(CairnError::UnknownSegmentMagic { segment });
    }
    Ok(file)
}

/// Sequential scanner over a segment's entries.
pub struct SegmentScan {
    file: File,
    segment: u64,
    offset: u64,
    len: u64,
}

impl SegmentScan {
    pub fn open(path: &Path, segment: u64) -> Result<Self> {
        let file = open_checked(path, segment)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            segment,
            offset: SEGMENT_HEADER_SIZE,
            len,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next entry. `Ok(None)` at a clean end of file; a CRC or
    /// framing failure is an error carrying the offending offset.
    pub fn next_entry(&mut self) -> Result<Option<(u64, LogEntry)>> {
        if self.offset >= self.len {
            return Ok(None);
        }
        let entry_offset = self.offset;
        let err = || CairnError::CrcMismatch {
            segment: self.segment,
            offset: entry_offset,
        };

        if self.len - self.offset < ENTRY_HEADER_SIZE {
            return Err(err());
        }
        let mut header = [0u8; ENTRY_HEADER_SIZE as usize];
        self.file.seek(SeekFrom::Start(self.offset))?;
        self.file.read_exact(&mut header)?;
        let crc = u32::from_le_bytes(header[..4].try_into().unwrap());
        let size = u32::from_le_bytes(header[4..8].try_into().unwrap()) as u64;
        let tag = header[8];

        if size < ENTRY_HEADER_SIZE
            || size > ENTRY_HEADER_SIZE + ID_SIZE + MAX_OBJECT_SIZE
            || self.offset + size > self.len
        {
            return Err(err());
        }

        let mut rest = vec![0u8; (size - ENTRY_HEADER_SIZE) as usize];
        self.file.read_exact(&mut rest)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header[4..]);
        hasher.update(&rest);
        if hasher.finalize() != crc {
            return Err(err());
        }

        let entry = match tag {
            TAG_PUT => {
                if rest.len() < ID_SIZE as usize {
                    return Err(err());
                }
                let id = ChunkId(rest[..32].try_into().unwrap());
                LogEntry::Put {
                    id,
                    payload: rest[32..].to_vec(),
                }
            }
            TAG_DELETE => {
                if rest.len() != ID_SIZE as usize {
                    return Err(err());
                }
                LogEntry::Delete {
                    id: ChunkId(rest[..32].try_into().unwrap()),
                }
            }
            TAG_COMMIT => {
                if !rest.is_empty() {
                    return Err(err());
                }
                LogEntry::Commit
            }
            _ => return Err(err()),
        };

        self.offset += size;
        Ok(Some((entry_offset, entry)))
    }

    /// After a framing error, advance byte-by-byte until a valid entry
    /// parses again. Used by repair to salvage what follows a damaged
    /// region. Returns the next valid offset, if any.
    pub fn resync(&mut self) -> u64 {
        let mut probe = self.offset + 1;
        while probe < self.len {
            self.offset = probe;
            let saved = self.offset;
            match self.next_entry() {
                Ok(Some(_)) => {
                    // Rewind so the caller re-reads the recovered entry.
                    self.offset = saved;
                    return saved;
                }
                _ => probe = saved + 1,
            }
        }
        self.offset = self.len;
        self.len
    }
}

/// Read and verify one PUT entry at a known location. Returns the payload.
pub fn read_put(path: &Path, segment: u64, offset: u64, expected: &ChunkId) -> Result<Vec<u8>> {
    let mut file = open_checked(path, segment)?;
    let err = || CairnError::CrcMismatch { segment, offset };

    file.seek(SeekFrom::Start(offset))?;
    let mut header = [0u8; ENTRY_HEADER_SIZE as usize];
    file.read_exact(&mut header).map_err(|_| err())?;
    let crc = u32::from_le_bytes(header[..4].try_into().unwrap());
    let size = u32::from_le_bytes(header[4..8].try_into().unwrap()) as u64;
    let tag = header[8];
    if tag != TAG_PUT || size < PUT_OVERHEAD || size > PUT_OVERHEAD + MAX_OBJECT_SIZE {
        return Err(err());
    }

    let mut rest = vec![0u8; (size - ENTRY_HEADER_SIZE) as usize];
    file.read_exact(&mut rest).map_err(|_| err())?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[4..]);
    hasher.update(&rest);
    if hasher.finalize() != crc {
        return Err(err());
    }

    let id = ChunkId(rest[..32].try_into().unwrap());
    if &id != expected {
        return Err(CairnError::IdMismatch(id));
    }
    Ok(rest[32..].to_vec())
}

/// On-disk size of a PUT entry for a payload of `len` bytes.
pub fn put_entry_size(len: u64) -> u64 {
    PUT_OVERHEAD + len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_id(b: u8) -> ChunkId {
        ChunkId([b; 32])
    }

    #[test]
    fn write_scan_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0");
        let mut w = SegmentWriter::create(&path, 0).unwrap();
        let (off_a, _) = w.put(&sample_id(1), b"payload a").unwrap();
        w.delete(&sample_id(2)).unwrap();
        w.commit().unwrap();
        w.sync().unwrap();

        let mut scan = SegmentScan::open(&path, 0).unwrap();
        let (o, e) = scan.next_entry().unwrap().unwrap();
        assert_eq!(o, off_a);
        assert_eq!(
            e,
            LogEntry::Put {
                id: sample_id(1),
                payload: b"payload a".to_vec()
            }
        );
        let (_, e) = scan.next_entry().unwrap().unwrap();
        assert_eq!(e, LogEntry::Delete { id: sample_id(2) });
        let (_, e) = scan.next_entry().unwrap().unwrap();
        assert_eq!(e, LogEntry::Commit);
        assert!(scan.next_entry().unwrap().is_none());
    }

    #[test]
    fn read_put_verifies_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0");
        let mut w = SegmentWriter::create(&path, 0).unwrap();
        let (off, _) = w.put(&sample_id(1), b"data").unwrap();
        w.sync().unwrap();

        assert_eq!(read_put(&path, 0, off, &sample_id(1)).unwrap(), b"data");
        assert!(matches!(
            read_put(&path, 0, off, &sample_id(9)),
            Err(CairnError::IdMismatch(_))
        ));
    }

    #[test]
    fn corruption_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0");
        let mut w = SegmentWriter::create(&path, 0).unwrap();
        let (off, _) = w.put(&sample_id(1), b"some payload bytes").unwrap();
        w.sync().unwrap();

        // Flip one payload byte.
        let mut raw = fs::read(&path).unwrap();
        let idx = (off + PUT_OVERHEAD) as usize + 3;
        raw[idx] ^= 0xFF;
        fs::write(&path, &raw).unwrap();

        let mut scan = SegmentScan::open(&path, 0).unwrap();
        assert!(matches!(
            scan.next_entry(),
            Err(CairnError::CrcMismatch { segment: 0, .. })
        ));
        assert!(read_put(&path, 0, off, &sample_id(1)).is_err());
    }

    #[test]
    fn resync_recovers_entries_after_damage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0");
        let mut w = SegmentWriter::create(&path, 0).unwrap();
        w.put(&sample_id(1), b"first entry payload").unwrap();
        let (off_b, _) = w.put(&sample_id(2), b"second entry payload").unwrap();
        w.sync().unwrap();

        // Damage the first entry's header.
        let mut raw = fs::read(&path).unwrap();
        raw[SEGMENT_HEADER_SIZE as usize + 5] ^= 0xFF;
        fs::write(&path, &raw).unwrap();

        let mut scan = SegmentScan::open(&path, 0).unwrap();
        assert!(scan.next_entry().is_err());
        let recovered = scan.resync();
        assert_eq!(recovered, off_b);
        let (o, e) = scan.next_entry().unwrap().unwrap();
        assert_eq!(o, off_b);
        assert!(matches!(e, LogEntry::Put { id, .. } if id == sample_id(2)));
    }

    #[test]
    fn bad_magic_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0");
        fs::write(&path, b"NOTASEGMENTFILE!").unwrap();
        assert!(matches!(
            SegmentScan::open(&path, 7),
            Err(CairnError::UnknownSegmentMagic { segment: 7 })
        ));
    }

    #[test]
    fn truncated_tail_is_a_framing_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0");
        let mut w = SegmentWriter::create(&path, 0).unwrap();
        w.put(&sample_id(1), b"payload").unwrap();
        w.sync().unwrap();

        let raw = fs::read(&path).unwrap();
        fs::write(&path, &raw[..raw.len() - 3]).unwrap();

        let mut scan = SegmentScan::open(&path, 0).unwrap();
        assert!(scan.next_entry().is_err());
    }
}
