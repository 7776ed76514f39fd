//! Slice layer (C3 — spec §4.3).
//!
//! A slice distributes one byte string across an unordered multiset of
//! blocks owned by a single key. The first block doubles as a header:
//! a fixed tag identifying the stream key (so `find` can recognize a
//! slice without knowing its location), an IV, and the start of an
//! AES-CTR-encrypted payload (`n`, the rest of the index list, the
//! size field, then the value) that continues across the remaining
//! blocks in the order they were written.

use rand::seq::SliceRandom;

use crate::block::{self, Block};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::group::GroupParams;
use crate::kd;
use crate::magic::KD_SYMM;
use crate::stream::{self, BlockCipherStream};

/// The three slice-shape parameters a slice operation needs out of a
/// safe's configuration.
#[derive(Clone, Copy, Debug)]
pub struct SliceLayout {
    pub bytes_per_block: usize,
    pub block_index_size: usize,
    pub slice_size_field: usize,
}

impl SliceLayout {
    pub fn from_config(config: &Config) -> SliceLayout {
        SliceLayout {
            bytes_per_block: config.bytes_per_block,
            block_index_size: config.block_index_size,
            slice_size_field: config.slice_size_field,
        }
    }
}

/// Maximum payload length storable across `n` blocks under `layout`.
pub fn capacity(n: usize, layout: SliceLayout) -> usize {
    n * (layout.bytes_per_block - layout.block_index_size)
        - 2 * stream::BLOCK_SIZE
        - layout.slice_size_field
}

#[derive(Clone, Debug)]
pub struct Slice {
    /// Block indices in the order the linked header chains them.
    /// `indices[0]` is the stable identity returned to callers.
    pub indices: Vec<u64>,
}

impl Slice {
    pub fn first_index(&self) -> u64 {
        self.indices[0]
    }
}

/// Derives the AES key for `base_key`'s stream — a slice's own
/// content stream when `base_key` is a slice's owner, but also reused
/// directly by the container layer to key the secrets blob's stream
/// under `full_key` (spec §4.4), since that's the same
/// base-key-to-symmetric-key derivation.
pub fn stream_key(base_key: &[u8]) -> [u8; stream::KEY_SIZE] {
    kd::derive32(&[base_key, &KD_SYMM])
}

/// Identifies a slice header without revealing the stream key itself.
fn header_tag(stream_key: &[u8; stream::KEY_SIZE]) -> [u8; stream::BLOCK_SIZE] {
    let tag = kd::derive(&[stream_key], stream::BLOCK_SIZE);
    let mut out = [0u8; stream::BLOCK_SIZE];
    out.copy_from_slice(&tag);
    out
}

fn encode_fixed(n: u64, width: usize) -> Vec<u8> {
    let full = n.to_be_bytes();
    assert!(width <= full.len(), "fixed-width field wider than u64");
    full[full.len() - width..].to_vec()
}

fn decode_fixed(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[8 - bytes.len()..].copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

/// Claims `n` blocks from the free set. Fails `SafeFull` if there are
/// fewer than `n` free.
pub fn allocate(free: &mut Vec<u64>, n: usize) -> Result<Slice> {
    if free.len() < n {
        return Err(Error::SafeFull {
            needed: n,
            available: free.len(),
        });
    }
    free.shuffle(&mut rand::thread_rng());
    let indices = free.split_off(free.len() - n);
    Ok(Slice { indices })
}

/// Writes `value` across the blocks named by `slice_indices`, claiming
/// them if `annex` and they are not already owned by `base_key`.
/// Returns the stored slice with its final (randomized) block order.
pub fn store(
    group: &GroupParams,
    blocks: &mut [Block],
    base_key: &[u8],
    slice_indices: &[u64],
    value: &[u8],
    layout: SliceLayout,
    annex: bool,
) -> Result<Slice> {
    let n = slice_indices.len();
    assert!(
        value.len() <= capacity(n, layout),
        "value exceeds slice capacity"
    );

    let mut permuted = slice_indices.to_vec();
    permuted.shuffle(&mut rand::thread_rng());

    let mut content = encode_fixed(n as u64, layout.block_index_size);
    for &idx in &permuted[1..] {
        content.extend(encode_fixed(idx, layout.block_index_size));
    }
    content.extend(encode_fixed(value.len() as u64, layout.slice_size_field));
    content.extend_from_slice(value);
    content.resize(n * layout.bytes_per_block - 2 * stream::BLOCK_SIZE, 0);

    let skey = stream_key(base_key);
    let tag = header_tag(&skey);
    let mut iv = [0u8; stream::IV_SIZE];
    getrandom::getrandom(&mut iv).expect("OS RNG must be available");

    let mut cipher = BlockCipherStream::new(&skey, &iv, 0);
    let encrypted = cipher.encrypt(&content);

    let mut plaintext = Vec::with_capacity(n * layout.bytes_per_block);
    plaintext.extend_from_slice(&tag);
    plaintext.extend_from_slice(&iv);
    plaintext.extend_from_slice(&encrypted);

    for (chunk_index, &block_idx) in permuted.iter().enumerate() {
        let start = chunk_index * layout.bytes_per_block;
        let chunk = &plaintext[start..start + layout.bytes_per_block];
        let existing = blocks[block_idx as usize].clone();
        blocks[block_idx as usize] = block::encrypt(
            group,
            base_key,
            block_idx,
            layout.bytes_per_block,
            chunk,
            &existing,
            annex,
        )?;
    }

    Ok(Slice { indices: permuted })
}

fn decrypt_chunk(
    group: &GroupParams,
    blocks: &[Block],
    base_key: &[u8],
    bytes_per_block: usize,
    cipher: &mut BlockCipherStream,
    physical_index: u64,
) -> Result<Vec<u8>> {
    let block = blocks
        .get(physical_index as usize)
        .ok_or_else(|| Error::SafeFormat("slice index out of range".into()))?;
    let plaintext = block::decrypt(group, base_key, physical_index, bytes_per_block, block)?;
    Ok(cipher.decrypt(&plaintext))
}

/// Decrypts the slice rooted at `first_index`, following its linked
/// header to discover the rest of its blocks.
pub fn load(
    group: &GroupParams,
    blocks: &[Block],
    base_key: &[u8],
    first_index: u64,
    layout: SliceLayout,
) -> Result<(Slice, Vec<u8>)> {
    let header_len = 2 * stream::BLOCK_SIZE;
    assert!(
        layout.bytes_per_block > header_len,
        "bytes_per_block too small to hold a slice header"
    );

    let block0 = blocks
        .get(first_index as usize)
        .ok_or_else(|| Error::SafeFormat("first index out of range".into()))?;
    let plaintext0 = block::decrypt(group, base_key, first_index, layout.bytes_per_block, block0)?;

    let skey = stream_key(base_key);
    if plaintext0[..stream::BLOCK_SIZE] != header_tag(&skey)[..] {
        return Err(Error::WrongKey);
    }
    let mut iv = [0u8; stream::IV_SIZE];
    iv.copy_from_slice(&plaintext0[stream::BLOCK_SIZE..header_len]);

    let mut cipher = BlockCipherStream::new(&skey, &iv, 0);
    let mut decoded = cipher.decrypt(&plaintext0[header_len..]);
    let mut indices = vec![first_index];
    let mut cursor = 0usize;
    let mut next_chunk = 1usize;

    if decoded.len() - cursor < layout.block_index_size {
        return Err(Error::SafeFormat("slice header truncated".into()));
    }
    let n = decode_fixed(&decoded[cursor..cursor + layout.block_index_size]) as usize;
    cursor += layout.block_index_size;

    while indices.len() < n {
        if decoded.len() - cursor < layout.block_index_size {
            if next_chunk >= indices.len() {
                return Err(Error::SafeFormat("slice index list is under-determined".into()));
            }
            let phys = indices[next_chunk];
            let chunk = decrypt_chunk(group, blocks, base_key, layout.bytes_per_block, &mut cipher, phys)?;
            decoded.extend(chunk);
            next_chunk += 1;
            continue;
        }
        let idx = decode_fixed(&decoded[cursor..cursor + layout.block_index_size]);
        indices.push(idx);
        cursor += layout.block_index_size;
    }

    while decoded.len() - cursor < layout.slice_size_field {
        if next_chunk >= n {
            return Err(Error::SafeFormat("slice size field truncated".into()));
        }
        let phys = indices[next_chunk];
        let chunk = decrypt_chunk(group, blocks, base_key, layout.bytes_per_block, &mut cipher, phys)?;
        decoded.extend(chunk);
        next_chunk += 1;
    }
    let size = decode_fixed(&decoded[cursor..cursor + layout.slice_size_field]) as usize;
    cursor += layout.slice_size_field;

    while decoded.len() - cursor < size {
        if next_chunk >= n {
            return Err(Error::SafeFormat("slice payload truncated".into()));
        }
        let phys = indices[next_chunk];
        let chunk = decrypt_chunk(group, blocks, base_key, layout.bytes_per_block, &mut cipher, phys)?;
        decoded.extend(chunk);
        next_chunk += 1;
    }
    let value = decoded[cursor..cursor + size].to_vec();

    Ok((Slice { indices }, value))
}

/// Scans every block for a slice opened by `base_key`. Used only when
/// a slice's location is unknown (initial password unlock).
pub fn find(
    group: &GroupParams,
    blocks: &[Block],
    base_key: &[u8],
    layout: SliceLayout,
) -> Vec<(Slice, Vec<u8>)> {
    let skey = stream_key(base_key);
    let tag = header_tag(&skey);
    let mut found = Vec::new();
    for i in 0..blocks.len() as u64 {
        let plaintext = match block::decrypt(group, base_key, i, layout.bytes_per_block, &blocks[i as usize]) {
            Ok(p) => p,
            Err(_) => continue,
        };
        if plaintext[..stream::BLOCK_SIZE] != tag[..] {
            continue;
        }
        match load(group, blocks, base_key, i, layout) {
            Ok(result) => found.push(result),
            Err(e) => log::debug!("slice candidate at block {i} failed to load: {e}"),
        }
    }
    found
}

/// Claims every remaining free block into one decoy slice of uniform
/// random plaintext under a random, never-reused key, then empties the
/// free set.
pub fn trash_freespace(
    group: &GroupParams,
    blocks: &mut [Block],
    free: &mut Vec<u64>,
    layout: SliceLayout,
) -> Result<Slice> {
    let indices = free.clone();
    if indices.is_empty() {
        return Err(Error::SafeFull {
            needed: 1,
            available: 0,
        });
    }
    let mut key = vec![0u8; kd::NATIVE_LEN];
    getrandom::getrandom(&mut key).expect("OS RNG must be available");
    let mut payload = vec![0u8; capacity(indices.len(), layout)];
    getrandom::getrandom(&mut payload).expect("OS RNG must be available");

    let slice = store(group, blocks, &key, &indices, &payload, layout, true)?;
    free.clear();
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupParams;

    // Blocks must satisfy 2^(bytes_per_block*8) < p (spec §3), and the
    // slice header alone needs 32 bytes, so these tests need a group
    // much larger than group.rs's toy p=23 fixture; generate one at
    // 336 bits, comfortably above the 320-bit plaintexts a
    // 40-byte bytes_per_block produces.
    fn test_group() -> GroupParams {
        GroupParams::generate(336)
    }

    fn test_layout() -> SliceLayout {
        SliceLayout {
            bytes_per_block: 40,
            block_index_size: 2,
            slice_size_field: 2,
        }
    }

    fn fresh_blocks(n: usize, group: &GroupParams) -> Vec<Block> {
        (0..n).map(|_| Block::random_unclaimed(group)).collect()
    }

    #[test]
    fn store_then_load_roundtrips_value() {
        let group = test_group();
        let layout = test_layout();
        let mut blocks = fresh_blocks(6, &group);
        let mut free: Vec<u64> = (0..6).collect();
        let slice = allocate(&mut free, 6).unwrap();
        assert!(free.is_empty());

        let key = b"container-base-key";
        let value = b"a reasonably sized secret payload";
        let written = store(&group, &mut blocks, key, &slice.indices, value, layout, true).unwrap();

        let (loaded, decoded) = load(&group, &blocks, key, written.first_index(), layout).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(loaded.indices.len(), 6);
    }

    #[test]
    fn load_with_wrong_key_fails() {
        let group = test_group();
        let layout = test_layout();
        let mut blocks = fresh_blocks(4, &group);
        let mut free: Vec<u64> = (0..4).collect();
        let slice = allocate(&mut free, 4).unwrap();
        let written = store(&group, &mut blocks, b"key-a", &slice.indices, b"hello", layout, true).unwrap();

        assert!(load(&group, &blocks, b"key-b", written.first_index(), layout).is_err());
    }

    #[test]
    fn find_recovers_every_slice_opened_by_key() {
        let group = test_group();
        let layout = test_layout();
        let mut blocks = fresh_blocks(12, &group);
        let mut free: Vec<u64> = (0..12).collect();

        let key = b"shared-base-key";
        let s1 = allocate(&mut free, 3).unwrap();
        store(&group, &mut blocks, key, &s1.indices, b"one", layout, true).unwrap();
        let s2 = allocate(&mut free, 3).unwrap();
        store(&group, &mut blocks, key, &s2.indices, b"two", layout, true).unwrap();

        let found = find(&group, &blocks, key, layout);
        let mut values: Vec<Vec<u8>> = found.into_iter().map(|(_, v)| v).collect();
        values.sort();
        assert_eq!(values, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn allocate_beyond_free_set_fails_safe_full() {
        let mut free: Vec<u64> = (0..3).collect();
        assert!(matches!(
            allocate(&mut free, 4),
            Err(Error::SafeFull { needed: 4, available: 3 })
        ));
    }

    #[test]
    fn trash_freespace_empties_free_set_and_is_unfindable() {
        let group = test_group();
        let layout = test_layout();
        let mut blocks = fresh_blocks(8, &group);
        let mut free: Vec<u64> = (0..8).collect();

        trash_freespace(&group, &mut blocks, &mut free, layout).unwrap();
        assert!(free.is_empty());

        let found = find(&group, &blocks, b"nobody-owns-this-key", layout);
        assert!(found.is_empty());
    }
}
