//! Shared wire-format types and constants for the cairn remote-repository
//! protocol.
//!
//! When a repository is remote, a helper process runs on the far side and
//! both ends exchange length-prefixed MessagePack frames over a
//! bidirectional byte stream (typically stdin/stdout of an SSH child).
//! This crate is intentionally minimal: DTOs, framing, and protocol
//! versioning. No transport, no storage I/O, no crypto: all decryption
//! happens client-side and the server never sees keys.

use serde::{Deserialize, Serialize};

use cairn_types::chunk_id::ChunkId;

// ── Protocol version ───────────────────────────────────────────────────────

/// Current protocol version. Sent by clients in `Open`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Minimum protocol version the helper accepts.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Maximum frame body size the helper will accept (64 MiB). Bounds memory
/// for a single `Put` of the largest possible object.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Validate a client's protocol version. Returns `Err(message)` if
/// incompatible.
pub fn check_protocol_version(version: u32) -> Result<(), String> {
    if version < MIN_PROTOCOL_VERSION {
        return Err(format!(
            "protocol version {version} too old; helper requires >= {MIN_PROTOCOL_VERSION}"
        ));
    }
    if version > PROTOCOL_VERSION {
        return Err(format!(
            "protocol version {version} not supported; helper supports <= {PROTOCOL_VERSION}"
        ));
    }
    Ok(())
}

// ── Requests ───────────────────────────────────────────────────────────────

/// A single client request. Methods mirror the repository API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Open {
        protocol_version: u32,
        path: String,
        /// Create the repository if it does not exist.
        create: bool,
        /// Open read-only (shared lock instead of exclusive).
        read_only: bool,
    },
    Put {
        id: ChunkId,
        payload: Vec<u8>,
    },
    Get {
        id: ChunkId,
    },
    Delete {
        id: ChunkId,
    },
    Commit,
    List {
        /// Resume marker: list ids after this one.
        after: Option<ChunkId>,
        limit: u32,
    },
    Check {
        verify_data: bool,
    },
    /// Fetch the wrapped key material stored in the repository config
    /// (repokey mode). The helper returns it opaque; unwrapping happens
    /// client-side.
    LoadKey,
}

// ── Responses ──────────────────────────────────────────────────────────────

/// Helper response: success with an optional payload, or a named error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Data(Vec<u8>),
    Ids(Vec<ChunkId>),
    CheckReport { errors: Vec<String> },
    Error(RemoteError),
}

/// Error classes carried over the wire. Named, not stringly-typed, so the
/// client can map them back onto its own error taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemoteError {
    ObjectMissing(ChunkId),
    RepoNotFound(String),
    RepoAlreadyExists(String),
    Locked(String),
    IntegrityError(String),
    InvalidRequest(String),
    Io(String),
}

// ── Framing ────────────────────────────────────────────────────────────────

/// Encode a message as a length-prefixed MessagePack frame:
/// `[u32 BE body length][body]`.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    let body = rmp_serde::to_vec(msg)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Result of attempting to decode one frame from a buffer.
#[derive(Debug)]
pub enum Decoded<T> {
    /// A complete frame: the message and the number of bytes consumed.
    Frame(T, usize),
    /// Not enough bytes buffered yet.
    Incomplete,
    /// The length prefix exceeds `MAX_FRAME_LEN`.
    Oversized(u32),
}

/// Decode one frame from the front of `buf`, if complete.
pub fn decode_frame<T: for<'de> Deserialize<'de>>(
    buf: &[u8],
) -> Result<Decoded<T>, rmp_serde::decode::Error> {
    if buf.len() < 4 {
        return Ok(Decoded::Incomplete);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_FRAME_LEN {
        return Ok(Decoded::Oversized(len));
    }
    let total = 4 + len as usize;
    if buf.len() < total {
        return Ok(Decoded::Incomplete);
    }
    let msg = rmp_serde::from_slice(&buf[4..total])?;
    Ok(Decoded::Frame(msg, total))
}
