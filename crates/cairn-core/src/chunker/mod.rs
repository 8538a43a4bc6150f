//! Content-defined chunking with a BuzHash rolling hash.
//!
//! A cut point is declared wherever the low `mask_bits` bits of the rolling
//! hash over the trailing `window_size` bytes are zero, subject to
//! `min_size`/`max_size` bounds. The hash is not cryptographic; its sole
//! purpose is boundary selection, so small local edits move few boundaries.

use crate::config::ChunkerParams;
use cairn_types::error::Result;

/// Byte-mixing table for the rolling hash, generated once from a fixed
/// seed so cut sequences are reproducible across processes and platforms.
fn build_table() -> [u32; 256] {
    // splitmix64, truncated to 32 bits per entry.
    let mut state: u64 = 0x2545_f491_4f6c_dd1d;
    let mut table = [0u32; 256];
    for slot in table.iter_mut() {
        state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        *slot = (z ^ (z >> 31)) as u32;
    }
    table
}

#[inline]
fn barrel_shift(v: u32, n: u32) -> u32 {
    v.rotate_left(n & 31)
}

/// Streaming content-defined chunker.
///
/// Feed arbitrary-sized buffers with [`push`](Chunker::push); complete
/// chunks are yielded eagerly. Call [`finish`](Chunker::finish) to obtain
/// the final short chunk. The produced cut sequence depends only on the
/// input bytes and the parameters, never on how the input was buffered.
pub struct Chunker {
    min_size: usize,
    max_size: usize,
    window: usize,
    mask: u32,
    table: [u32; 256],
    /// Bytes of the current, not yet complete chunk.
    buf: Vec<u8>,
    /// Next boundary-test position within `buf`. Zero means the rolling
    /// hash has not been seeded for this chunk yet.
    pos: usize,
    hash: u32,
}

impl Chunker {
    pub fn new(params: &ChunkerParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            min_size: params.min_size as usize,
            max_size: params.max_size as usize,
            window: params.window_size as usize,
            mask: (1u32 << params.mask_bits) - 1,
            table: build_table(),
            buf: Vec::new(),
            pos: 0,
            hash: 0,
        })
    }

    fn buzhash(&self, window: &[u8]) -> u32 {
        let n = window.len() as u32;
        let mut sum = 0u32;
        for (i, &b) in window.iter().enumerate() {
            sum ^= barrel_shift(self.table[b as usize], n - 1 - i as u32);
        }
        sum
    }

    #[inline]
    fn roll(&mut self, out: u8, inp: u8) {
        self.hash = barrel_shift(self.hash, 1)
            ^ barrel_shift(self.table[out as usize], self.window as u32)
            ^ self.table[inp as usize];
    }

    /// Feed more input, returning every chunk completed by it.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);
        let mut chunks = Vec::new();
        while let Some(cut) = self.scan() {
            let rest = self.buf.split_off(cut);
            let chunk = std::mem::replace(&mut self.buf, rest);
            self.pos = 0;
            self.hash = 0;
            chunks.push(chunk);
        }
        chunks
    }

    /// Flush the final chunk (shorter than `min_size` is allowed here and
    /// only here). Returns `None` for an empty stream.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        self.pos = 0;
        self.hash = 0;
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }

    /// Find the next cut position in `buf`, advancing the rolling state.
    /// Returns `None` when more input is needed.
    fn scan(&mut self) -> Option<usize> {
        if self.buf.len() < self.min_size {
            return None;
        }
        if self.pos == 0 {
            // Seed the hash over the window ending at min_size. Boundaries
            // are never tested below min_size.
            let start = self.min_size - self.window;
            self.hash = self.buzhash(&self.buf[start..self.min_size]);
            self.pos = self.min_size;
            if self.hash & self.mask == 0 {
                return Some(self.pos);
            }
        }
        while self.pos < self.buf.len() {
            if self.pos >= self.max_size {
                return Some(self.max_size);
            }
            let out = self.buf[self.pos - self.window];
            let inp = self.buf[self.pos];
            self.roll(out, inp);
            self.pos += 1;
            if self.hash & self.mask == 0 {
                return Some(self.pos);
            }
        }
        if self.pos >= self.max_size {
            return Some(self.max_size);
        }
        None
    }
}

/// Convenience for whole-buffer input: split `data` into chunks.
pub fn chunk_buffer(data: &[u8], params: &ChunkerParams) -> Result<Vec<Vec<u8>>> {
    let mut chunker = Chunker::new(params)?;
    let mut chunks = chunker.push(data);
    if let Some(last) = chunker.finish() {
        chunks.push(last);
    }
    Ok(chunks)
}
