pub mod archive;
pub mod cache;
pub mod chunker;
pub mod commands;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod placeholders;
pub mod platform;
pub mod prune;
pub mod remote;
pub mod repo;
pub mod retry;
pub mod walk;

pub use cairn_types::chunk_id::{ChunkId, MANIFEST_ID};
pub use cairn_types::error::{CairnError, Result};

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
