use crate::chunker::{chunk_buffer, Chunker};
use crate::config::ChunkerParams;
use crate::testutil::patterned_bytes;

fn params() -> ChunkerParams {
    ChunkerParams {
        min_size: 128,
        max_size: 4096,
        mask_bits: 8,
        window_size: 63,
    }
}

#[test]
fn deterministic_for_same_input() {
    let data = patterned_bytes(200_000, 1);
    let a = chunk_buffer(&data, &params()).unwrap();
    let b = chunk_buffer(&data, &params()).unwrap();
    assert_eq!(a, b);
    assert!(a.len() > 10, "expected many chunks, got {}", a.len());
}

#[test]
fn independent_of_buffering() {
    let data = patterned_bytes(100_000, 2);
    let whole = chunk_buffer(&data, &params()).unwrap();

    for step in [1usize, 7, 130, 5000] {
        let mut chunker = Chunker::new(&params()).unwrap();
        let mut chunks = Vec::new();
        for piece in data.chunks(step) {
            chunks.extend(chunker.push(piece));
        }
        if let Some(last) = chunker.finish() {
            chunks.push(last);
        }
        assert_eq!(chunks, whole, "buffer step {step} changed the cut sequence");
    }
}

#[test]
fn chunks_concatenate_to_input() {
    let data = patterned_bytes(50_000, 3);
    let chunks = chunk_buffer(&data, &params()).unwrap();
    let rejoined: Vec<u8> = chunks.concat();
    assert_eq!(rejoined, data);
}

#[test]
fn respects_min_and_max_bounds() {
    let data = patterned_bytes(300_000, 4);
    let chunks = chunk_buffer(&data, &params()).unwrap();
    let p = params();
    for (i, chunk) in chunks.iter().enumerate() {
        assert!(chunk.len() <= p.max_size as usize, "chunk {i} above max");
        if i + 1 < chunks.len() {
            assert!(chunk.len() >= p.min_size as usize, "chunk {i} below min");
        }
    }
}

#[test]
fn expected_size_tracks_mask_bits() {
    // With mask_bits = 8 the expected chunk is ~256 bytes past min_size.
    let data = patterned_bytes(500_000, 5);
    let chunks = chunk_buffer(&data, &params()).unwrap();
    let avg = data.len() / chunks.len();
    assert!(
        (128..1500).contains(&avg),
        "average chunk size {avg} far from expectation"
    );
}

#[test]
fn empty_input_yields_no_chunks() {
    assert!(chunk_buffer(&[], &params()).unwrap().is_empty());
    let mut chunker = Chunker::new(&params()).unwrap();
    assert!(chunker.push(&[]).is_empty());
    assert!(chunker.finish().is_none());
}

#[test]
fn short_input_yields_single_final_chunk() {
    let data = patterned_bytes(100, 6); // below min_size
    let chunks = chunk_buffer(&data, &params()).unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0], data);
}

#[test]
fn constant_input_cuts_at_max_size() {
    // All-zero data never hits the mask; every cut is forced at max_size.
    let data = vec![0u8; 20_000];
    let chunks = chunk_buffer(&data, &params()).unwrap();
    let p = params();
    for chunk in &chunks[..chunks.len() - 1] {
        assert_eq!(chunk.len(), p.max_size as usize);
    }
}

#[test]
fn exact_boundary_lengths() {
    let p = params();
    // Exactly min_size: one chunk.
    let data = vec![0u8; p.min_size as usize];
    assert_eq!(chunk_buffer(&data, &p).unwrap().len(), 1);
    // Exactly max_size: one chunk.
    let data = vec![0u8; p.max_size as usize];
    assert_eq!(chunk_buffer(&data, &p).unwrap().len(), 1);
    // max_size + 1: a max_size chunk plus a 1-byte tail.
    let data = vec![0u8; p.max_size as usize + 1];
    let chunks = chunk_buffer(&data, &p).unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].len(), p.max_size as usize);
    assert_eq!(chunks[1].len(), 1);
}

#[test]
fn shared_suffix_produces_shared_chunks() {
    // Two inputs differing only in a prefix edit converge to identical
    // chunks once past the edit.
    let base = patterned_bytes(150_000, 7);
    let mut edited = base.clone();
    edited[10] ^= 0xFF;

    let a = chunk_buffer(&base, &params()).unwrap();
    let b = chunk_buffer(&edited, &params()).unwrap();

    let shared: usize = a.iter().filter(|c| b.contains(c)).count();
    assert!(
        shared * 2 > a.len(),
        "only {shared}/{} chunks survived a 1-byte edit",
        a.len()
    );
}

#[test]
fn appending_changes_only_the_tail() {
    let base = patterned_bytes(150_000, 8);
    let mut extended = base.clone();
    extended.push(b'x');

    let a = chunk_buffer(&base, &params()).unwrap();
    let b = chunk_buffer(&extended, &params()).unwrap();

    // Everything except the final chunk region is unchanged.
    assert!(a.len() > 2);
    assert_eq!(a[..a.len() - 1], b[..a.len() - 1]);
}
