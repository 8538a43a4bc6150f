//! Pluggable compression codecs identified by a one-byte tag.
//!
//! The tag is the first byte of every compressed payload and selects the
//! decoder, so codecs can be mixed freely within one repository. Two
//! wrappers exist on the compression side only: `auto` falls back to
//! storing uncompressed when compression does not pay off, and
//! `obfuscate` pads the payload to hide true object sizes.

use std::io::{Read, Write};

use rand::Rng;

use cairn_types::error::{CairnError, Result};

const TAG_NONE: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;
const TAG_ZLIB: u8 = 0x03;
const TAG_LZMA: u8 = 0x04;
const TAG_OBFUSCATED: u8 = 0x05;

/// Maximum decompressed output size (32 MiB = 4x max chunk size).
/// Prevents decompression bombs from consuming unbounded memory.
const MAX_DECOMPRESS_SIZE: u64 = 32 * 1024 * 1024;

/// Hard cap on obfuscation padding.
const MAX_PADDING: usize = 16 * 1024 * 1024;

/// Size-obfuscation parameters.
///
/// Levels 1..=6 pad relative to the payload: up to `2^level` percent of
/// its size. Levels 110..=123 pad by an absolute amount: up to
/// `2^(level-110)` KiB. Both are capped at 16 MiB. The exact draw is
/// uniform over `[0, max]`; see [`padding_len`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObfuscateSpec {
    pub level: u32,
}

impl ObfuscateSpec {
    pub fn new(level: u32) -> Result<Self> {
        if (1..=6).contains(&level) || (110..=123).contains(&level) {
            Ok(Self { level })
        } else {
            Err(CairnError::UnknownCompressionSpec(format!(
                "obfuscate level {level} (expected 1..=6 or 110..=123)"
            )))
        }
    }

    fn max_padding(&self, payload_len: usize) -> usize {
        let max = if self.level <= 6 {
            payload_len.saturating_mul(1usize << self.level) / 100
        } else {
            (1usize << (self.level - 110)) * 1024
        };
        max.min(MAX_PADDING)
    }
}

/// Draw the padding length for one payload. Exposed with the RNG as a
/// parameter so tests can pin the distribution.
pub fn padding_len(spec: &ObfuscateSpec, payload_len: usize, rng: &mut impl Rng) -> usize {
    let max = spec.max_padding(payload_len);
    if max == 0 {
        0
    } else {
        rng.gen_range(0..=max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compression {
    None,
    Lz4,
    Zstd { level: i32 },
    Zlib { level: u32 },
    Lzma { level: u32 },
    /// Compress with the inner codec, but store uncompressed when the
    /// result is not smaller than the input by a small margin.
    Auto { inner: Box<Compression> },
    /// Pad the inner codec's output to obscure object sizes.
    Obfuscate {
        spec: ObfuscateSpec,
        inner: Box<Compression>,
    },
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Auto {
            inner: Box::new(Compression::Lz4),
        }
    }
}

impl Compression {
    /// Parse a compression spec string: `none`, `lz4`, `zstd[,N]`,
    /// `zlib[,N]`, `lzma[,N]`, `auto,<inner>`, `obfuscate,<level>,<inner>`.
    pub fn from_spec(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(',').map(str::trim).collect();
        Self::from_parts(&parts).ok_or_else(|| CairnError::UnknownCompressionSpec(spec.into()))
    }

    fn from_parts(parts: &[&str]) -> Option<Self> {
        match *parts.first()? {
            "none" if parts.len() == 1 => Some(Compression::None),
            "lz4" if parts.len() == 1 => Some(Compression::Lz4),
            "zstd" => match parts.len() {
                1 => Some(Compression::Zstd { level: 3 }),
                2 => parts[1].parse().ok().filter(|l| (1..=22).contains(l)).map(|level| Compression::Zstd { level }),
                _ => None,
            },
            "zlib" => match parts.len() {
                1 => Some(Compression::Zlib { level: 6 }),
                2 => parts[1].parse().ok().filter(|l| *l <= 9).map(|level| Compression::Zlib { level }),
                _ => None,
            },
            "lzma" => match parts.len() {
                1 => Some(Compression::Lzma { level: 6 }),
                2 => parts[1].parse().ok().filter(|l| *l <= 9).map(|level| Compression::Lzma { level }),
                _ => None,
            },
            "auto" if parts.len() >= 2 => {
                let inner = Self::from_parts(&parts[1..])?;
                match inner {
                    Compression::Auto { .. } | Compression::Obfuscate { .. } => None,
                    _ => Some(Compression::Auto {
                        inner: Box::new(inner),
                    }),
                }
            }
            "obfuscate" if parts.len() >= 3 => {
                let level: u32 = parts[1].parse().ok()?;
                let spec = ObfuscateSpec::new(level).ok()?;
                let inner = Self::from_parts(&parts[2..])?;
                match inner {
                    Compression::Obfuscate { .. } => None,
                    _ => Some(Compression::Obfuscate {
                        spec,
                        inner: Box::new(inner),
                    }),
                }
            }
            _ => None,
        }
    }
}

/// Compress data and prepend the codec tag.
pub fn compress(compression: &Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => {
            let mut out = Vec::with_capacity(1 + data.len());
            out.push(TAG_NONE);
            out.extend_from_slice(data);
            Ok(out)
        }
        Compression::Lz4 => {
            let compressed = lz4_flex::compress_prepend_size(data);
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(TAG_LZ4);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
        Compression::Zstd { level } => {
            use std::cell::RefCell;
            thread_local! {
                static ZSTD_CX: RefCell<Option<(i32, zstd::bulk::Compressor<'static>)>> =
                    const { RefCell::new(None) };
            }

            ZSTD_CX.with(|cell| {
                let mut slot = cell.borrow_mut();

                // Lazily init or reinit if the compression level changed.
                if !matches!(slot.as_ref(), Some((l, _)) if *l == *level) {
                    let cx = zstd::bulk::Compressor::new(*level)
                        .map_err(|e| CairnError::Other(format!("zstd init: {e}")))?;
                    *slot = Some((*level, cx));
                }
                let (_, cx) = slot.as_mut().unwrap();

                let compressed = cx
                    .compress(data)
                    .map_err(|e| CairnError::Other(format!("zstd compress: {e}")))?;
                let mut out = Vec::with_capacity(1 + compressed.len());
                out.push(TAG_ZSTD);
                out.extend_from_slice(&compressed);
                Ok(out)
            })
        }
        Compression::Zlib { level } => {
            let mut encoder = flate2::write::ZlibEncoder::new(
                vec![TAG_ZLIB],
                flate2::Compression::new(*level),
            );
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        Compression::Lzma { level } => {
            let mut encoder = xz2::write::XzEncoder::new(vec![TAG_LZMA], *level);
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        Compression::Auto { inner } => {
            let out = compress(inner, data)?;
            // Keep the compressed form only if it saves at least ~3%.
            if out.len() + out.len() / 32 < 1 + data.len() {
                Ok(out)
            } else {
                compress(&Compression::None, data)
            }
        }
        Compression::Obfuscate { spec, inner } => {
            let body = compress(inner, data)?;
            let pad = padding_len(spec, body.len(), &mut rand::thread_rng());
            let mut out = Vec::with_capacity(1 + 4 + body.len() + pad);
            out.push(TAG_OBFUSCATED);
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
            out.extend_from_slice(&body);
            let mut padding = vec![0u8; pad];
            rand::thread_rng().fill(padding.as_mut_slice());
            out.extend_from_slice(&padding);
            Ok(out)
        }
    }
}

/// Decompress data by reading the tag prefix and dispatching.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(CairnError::Decompression("empty data".into()));
    }
    let tag = data[0];
    let payload = &data[1..];
    match tag {
        TAG_NONE => Ok(payload.to_vec()),
        TAG_LZ4 => {
            if payload.len() < 4 {
                return Err(CairnError::Decompression("lz4: payload too short".into()));
            }
            let uncompressed_size = u32::from_le_bytes(payload[..4].try_into().unwrap()) as u64;
            if uncompressed_size > MAX_DECOMPRESS_SIZE {
                return Err(CairnError::Decompression(format!(
                    "lz4: decompressed size ({uncompressed_size}) exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| CairnError::Decompression(format!("lz4: {e}")))
        }
        TAG_ZSTD => {
            let decoder = zstd::stream::Decoder::new(std::io::Cursor::new(payload))
                .map_err(|e| CairnError::Decompression(format!("zstd init: {e}")))?;
            bounded_read(decoder, "zstd")
        }
        TAG_ZLIB => bounded_read(flate2::read::ZlibDecoder::new(payload), "zlib"),
        TAG_LZMA => bounded_read(xz2::read::XzDecoder::new(payload), "lzma"),
        TAG_OBFUSCATED => {
            if payload.len() < 4 {
                return Err(CairnError::Decompression(
                    "obfuscated: payload too short".into(),
                ));
            }
            let inner_len = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
            let body = payload
                .get(4..4 + inner_len)
                .ok_or_else(|| CairnError::Decompression("obfuscated: truncated body".into()))?;
            // Trailing padding is ignored by construction.
            decompress(body)
        }
        _ => Err(CairnError::UnknownCompressionTag(tag)),
    }
}

fn bounded_read(decoder: impl Read, codec: &str) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    let mut limited = decoder.take(MAX_DECOMPRESS_SIZE + 1);
    limited
        .read_to_end(&mut output)
        .map_err(|e| CairnError::Decompression(format!("{codec}: {e}")))?;
    if output.len() as u64 > MAX_DECOMPRESS_SIZE {
        return Err(CairnError::Decompression(format!(
            "{codec}: decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
        )));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn decompress_rejects_lz4_bomb() {
        let mut bomb = (1u32 << 30).to_le_bytes().to_vec();
        bomb.extend_from_slice(&[0u8; 10]);
        let mut data = vec![TAG_LZ4];
        data.extend_from_slice(&bomb);
        assert!(decompress(&data).is_err());
    }

    #[test]
    fn all_codecs_roundtrip() {
        let original = b"hello world, hello world, hello world, compression fodder".repeat(10);
        for codec in [
            Compression::None,
            Compression::Lz4,
            Compression::Zstd { level: 3 },
            Compression::Zlib { level: 6 },
            Compression::Lzma { level: 3 },
        ] {
            let compressed = compress(&codec, &original).unwrap();
            let decompressed = decompress(&compressed).unwrap();
            assert_eq!(decompressed, original, "codec {codec:?}");
        }
    }

    #[test]
    fn auto_falls_back_to_none_for_incompressible_data() {
        // High-entropy bytes: lz4 cannot shrink them.
        let mut rng = rand::thread_rng();
        let mut data = vec![0u8; 4096];
        rng.fill(data.as_mut_slice());

        let auto = Compression::default();
        let out = compress(&auto, &data).unwrap();
        assert_eq!(out[0], TAG_NONE);
        assert_eq!(decompress(&out).unwrap(), data);
    }

    #[test]
    fn auto_keeps_compression_when_it_pays() {
        let data = vec![0u8; 4096];
        let out = compress(&Compression::default(), &data).unwrap();
        assert_eq!(out[0], TAG_LZ4);
        assert!(out.len() < data.len() / 2);
    }

    #[test]
    fn obfuscate_roundtrips_and_pads() {
        let data = b"pad me".repeat(100);
        let spec = ObfuscateSpec::new(112).unwrap();
        let codec = Compression::Obfuscate {
            spec,
            inner: Box::new(Compression::None),
        };
        let out = compress(&codec, &data).unwrap();
        assert_eq!(out[0], TAG_OBFUSCATED);
        assert_eq!(decompress(&out).unwrap(), data);
    }

    #[test]
    fn padding_distribution_respects_level_bounds() {
        let mut rng = StepRng::new(0, 0x9e3779b97f4a7c15);
        let spec = ObfuscateSpec::new(3).unwrap();
        for _ in 0..100 {
            let pad = padding_len(&spec, 10_000, &mut rng);
            assert!(pad <= 10_000 * 8 / 100);
        }
        let spec = ObfuscateSpec::new(110).unwrap();
        for _ in 0..100 {
            let pad = padding_len(&spec, 10_000, &mut rng);
            assert!(pad <= 1024);
        }
    }

    #[test]
    fn obfuscate_level_validation() {
        assert!(ObfuscateSpec::new(0).is_err());
        assert!(ObfuscateSpec::new(7).is_err());
        assert!(ObfuscateSpec::new(109).is_err());
        assert!(ObfuscateSpec::new(124).is_err());
        assert!(ObfuscateSpec::new(6).is_ok());
        assert!(ObfuscateSpec::new(123).is_ok());
    }

    #[test]
    fn spec_parsing() {
        assert_eq!(Compression::from_spec("none").unwrap(), Compression::None);
        assert_eq!(Compression::from_spec("lz4").unwrap(), Compression::Lz4);
        assert_eq!(
            Compression::from_spec("zstd,10").unwrap(),
            Compression::Zstd { level: 10 }
        );
        assert_eq!(
            Compression::from_spec("zlib").unwrap(),
            Compression::Zlib { level: 6 }
        );
        assert_eq!(
            Compression::from_spec("auto,zstd,3").unwrap(),
            Compression::Auto {
                inner: Box::new(Compression::Zstd { level: 3 })
            }
        );
        assert_eq!(
            Compression::from_spec("obfuscate,110,lz4").unwrap(),
            Compression::Obfuscate {
                spec: ObfuscateSpec { level: 110 },
                inner: Box::new(Compression::Lz4)
            }
        );
        assert!(Compression::from_spec("zstd,99").is_err());
        assert!(Compression::from_spec("obfuscate,7,lz4").is_err());
        assert!(Compression::from_spec("auto,auto,lz4").is_err());
        assert!(Compression::from_spec("brotli").is_err());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(
            decompress(&[0x7F, 1, 2, 3]),
            Err(CairnError::UnknownCompressionTag(0x7F))
        ));
    }
}
