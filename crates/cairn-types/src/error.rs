use thiserror::Error;

use crate::chunk_id::ChunkId;

pub type Result<T> = std::result::Result<T, CairnError>;

/// Process exit codes. Warnings do not abort but raise the exit code to 1;
/// a process killed by signal N exits with 128 + N (the embedder's concern).
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_WARNING: i32 = 1;
pub const EXIT_ERROR: i32 = 2;
pub const EXIT_SIGNAL_BASE: i32 = 128;

/// Error taxonomy for the whole engine. Lower layers never print; they
/// return one of these, carrying enough context (id, segment, offset) for
/// the caller to log and for repair to distinguish missing from corrupt
/// from transient.
#[derive(Debug, Error)]
pub enum CairnError {
    // ----- integrity -----
    #[error("segment {segment} has unknown magic or unsupported version")]
    UnknownSegmentMagic { segment: u64 },

    #[error("segment {segment}, offset {offset}: CRC mismatch")]
    CrcMismatch { segment: u64, offset: u64 },

    #[error("decryption failed: wrong passphrase or corrupted data")]
    DecryptionFailed,

    #[error("object {0} failed id verification after decryption")]
    IdMismatch(ChunkId),

    #[error("manifest is unauthenticated but TAM verification is required")]
    TamRequired,

    #[error("manifest TAM verification failed")]
    TamInvalid,

    // ----- consistency -----
    #[error("object not found: {0}")]
    ObjectMissing(ChunkId),

    #[error("archive not found: '{0}'")]
    ArchiveNotFound(String),

    #[error("archive already exists: '{0}'")]
    ArchiveAlreadyExists(String),

    // ----- repository / format -----
    #[error("repository not found at '{0}'")]
    RepoNotFound(String),

    #[error("repository already exists at '{0}'")]
    RepoAlreadyExists(String),

    #[error("invalid repository format: {0}")]
    InvalidFormat(String),

    #[error("unsupported repository version: {0}")]
    UnsupportedVersion(u32),

    #[error("unknown object type tag: {0}")]
    UnknownObjectType(u8),

    // ----- lock -----
    #[error("repository is locked by {0}")]
    Locked(String),

    #[error("stale lock held by {holder}: {hint}")]
    StaleLock { holder: String, hint: String },

    // ----- user -----
    #[error("unknown compression spec: '{0}'")]
    UnknownCompressionSpec(String),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("invalid archive name: '{0}'")]
    InvalidArchiveName(String),

    #[error("invalid placeholder in '{0}'")]
    InvalidPlaceholder(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("passphrase required but no source provided one")]
    PassphraseRequired,

    #[error("key file not found: '{0}'")]
    KeyFileNotFound(String),

    // ----- security -----
    #[error("access to unknown unencrypted repository at '{0}' refused (set the acknowledgement to proceed)")]
    UnknownUnencryptedRepo(String),

    #[error("repository at '{current}' was previously located at '{previous}' (set the acknowledgement to proceed)")]
    RepositoryRelocated { previous: String, current: String },

    #[error("nonce counter regression detected; refusing to encrypt")]
    NonceRegression,

    // ----- transient / plumbing -----
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("{0}")]
    Other(String),
}

impl CairnError {
    /// All hard errors map to exit code 2. Warnings are not errors: they
    /// are reported by the caller and raise the exit code to 1 without
    /// aborting.
    pub fn exit_code(&self) -> i32 {
        EXIT_ERROR
    }

    /// Whether this error class may succeed on retry over the same
    /// transport. Only plain I/O qualifies; integrity and security
    /// failures never do.
    pub fn is_transient(&self) -> bool {
        matches!(self, CairnError::Io(_))
    }
}
