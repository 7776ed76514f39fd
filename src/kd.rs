//! Key derivation (C1 — spec §4.1).
//!
//! `derive` is deterministic and fast, and mixes every input such that
//! permuting the input list changes the output (each input is
//! length-prefixed before concatenation, so `["ab", "c"]` and `["a",
//! "bc"]` can never collide). Extends to an arbitrary output length by
//! a salted counter: `ceil(length / 32)` HKDF-Expand rounds, each
//! keyed off a distinct big-endian 2-byte counter.

use hkdf::Hkdf;
use sha2::Sha256;

/// Native output size of the underlying hash, in bytes.
pub const NATIVE_LEN: usize = 32;

/// Fixed salt mixed into every derivation. Not a secret; its only job
/// is domain separation from other uses of HKDF-SHA256 over the same
/// input bytes.
const KD_SALT: &[u8] = b"denyvault-kd-v1-salt-2f91a6";

/// Mixes `inputs` (order-sensitive) and stretches the result to
/// `length` bytes.
pub fn derive(inputs: &[&[u8]], length: usize) -> Vec<u8> {
    let mut ikm = Vec::new();
    for input in inputs {
        ikm.extend_from_slice(&(input.len() as u32).to_be_bytes());
        ikm.extend_from_slice(input);
    }
    let hk = Hkdf::<Sha256>::new(Some(KD_SALT), &ikm);

    let rounds = length.div_ceil(NATIVE_LEN);
    let mut out = vec![0u8; rounds * NATIVE_LEN];
    for (i, chunk) in out.chunks_mut(NATIVE_LEN).enumerate() {
        let counter = (i as u16).to_be_bytes();
        hk.expand(&counter, chunk)
            .expect("HKDF-Expand output length is always within RFC 5869 bounds here");
    }
    out.truncate(length);
    out
}

/// Convenience wrapper for the common 32-byte case.
pub fn derive32(inputs: &[&[u8]]) -> [u8; 32] {
    let v = derive(inputs, 32);
    let mut out = [0u8; 32];
    out.copy_from_slice(&v);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let a = derive(&[b"x", b"y"], 32);
        let b = derive(&[b"x", b"y"], 32);
        assert_eq!(a, b);
    }

    #[test]
    fn order_sensitive() {
        let a = derive(&[b"x", b"y"], 32);
        let b = derive(&[b"y", b"x"], 32);
        assert_ne!(a, b);
    }

    #[test]
    fn no_concatenation_ambiguity() {
        let a = derive(&[b"ab", b"c"], 32);
        let b = derive(&[b"a", b"bc"], 32);
        assert_ne!(a, b);
    }

    #[test]
    fn extends_to_arbitrary_length() {
        for len in [1usize, 31, 32, 33, 64, 65, 100] {
            let out = derive(&[b"k"], len);
            assert_eq!(out.len(), len);
        }
        // a length-96 derivation should start with the same 32 and 64
        // byte prefixes as the shorter derivations (counter rounds are
        // independent and ordered).
        let short = derive(&[b"k"], 32);
        let long = derive(&[b"k"], 96);
        assert_eq!(&long[..32], &short[..]);
    }
}
