//! Symmetric block cipher stream (C1 — spec §4.1).
//!
//! AES-256-CTR. Counter mode by construction: a stream created with
//! `offset = 16*k` produces the same keystream as an offset-0 stream
//! with the first `k` blocks discarded, which is what lets the slice
//! layer decrypt blocks after the header in parallel (spec §4.3).

use aes::Aes256;
use cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use ctr::Ctr128BE;

pub const BLOCK_SIZE: usize = 16;
pub const IV_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;

type Aes256Ctr = Ctr128BE<Aes256>;

pub struct BlockCipherStream {
    cipher: Aes256Ctr,
}

impl BlockCipherStream {
    /// Creates a stream keyed by `key`, with the given `iv`, seeked to
    /// `offset` bytes (must be a multiple of [`BLOCK_SIZE`]).
    pub fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], offset: u64) -> Self {
        assert_eq!(offset % BLOCK_SIZE as u64, 0, "offset must be block-aligned");
        let mut cipher = Aes256Ctr::new(key.into(), iv.into());
        cipher.seek(offset);
        BlockCipherStream { cipher }
    }

    pub fn encrypt(&mut self, data: &[u8]) -> Vec<u8> {
        let mut buf = data.to_vec();
        self.cipher.apply_keystream(&mut buf);
        buf
    }

    /// CTR-mode encrypt and decrypt are the same XOR operation.
    pub fn decrypt(&mut self, data: &[u8]) -> Vec<u8> {
        self.encrypt(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = [7u8; KEY_SIZE];
        let iv = [9u8; IV_SIZE];
        let mut enc = BlockCipherStream::new(&key, &iv, 0);
        let mut dec = BlockCipherStream::new(&key, &iv, 0);
        let plain = b"the quick brown fox jumps over a lazy dog, repeatedly!!";
        let ct = enc.encrypt(plain);
        assert_eq!(dec.decrypt(&ct), plain);
    }

    #[test]
    fn offset_skips_whole_blocks_of_keystream() {
        let key = [3u8; KEY_SIZE];
        let iv = [5u8; IV_SIZE];
        let plain = vec![0u8; BLOCK_SIZE * 4];

        let mut from_zero = BlockCipherStream::new(&key, &iv, 0);
        let whole = from_zero.encrypt(&plain);

        let mut from_offset = BlockCipherStream::new(&key, &iv, 2 * BLOCK_SIZE as u64);
        let tail = from_offset.encrypt(&plain[2 * BLOCK_SIZE..]);

        assert_eq!(&whole[2 * BLOCK_SIZE..], &tail[..]);
    }

    #[test]
    #[should_panic(expected = "block-aligned")]
    fn rejects_unaligned_offset() {
        let key = [0u8; KEY_SIZE];
        let iv = [0u8; IV_SIZE];
        BlockCipherStream::new(&key, &iv, 5);
    }
}
