//! Block layer (C2 — spec §4.2).
//!
//! Each block is owned by exactly one `(base_key, index)` pair at any
//! time the safe is saved. `privkey_i`/`pubkey_i`/`marker_i` are pure
//! functions of `(base_key, index)`, so ownership can always be
//! recomputed — nothing about who owns a block is stored anywhere
//! except the block's own `marker` field, and even that is
//! indistinguishable from random once a block is unclaimed.

use num_bigint::BigUint;

use crate::error::{Error, Result};
use crate::group::GroupParams;
use crate::kd;
use crate::magic::{KD_ELGAMAL, KD_MARKER};

pub const MARKER_LEN: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub c1: BigUint,
    pub c2: BigUint,
    pub pubkey: BigUint,
    pub marker: Vec<u8>,
}

impl Block {
    pub fn is_unclaimed(&self) -> bool {
        self.marker.is_empty()
    }

    /// A syntactically valid but meaningless ciphertext, used to fill
    /// fresh blocks at safe-creation time so that free and owned
    /// blocks are indistinguishable at rest (spec §3, §9).
    pub fn random_unclaimed(group: &GroupParams) -> Block {
        let c1 = group.mod_pow(&group.g, &group.random_exponent());
        let c2 = group.mod_pow(&group.g, &group.random_exponent());
        let pubkey = group.mod_pow(&group.g, &group.random_exponent());
        Block {
            c1,
            c2,
            pubkey,
            marker: Vec::new(),
        }
    }
}

fn idx_bytes(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

pub fn derive_privkey(base_key: &[u8], index: u64, bytes_per_block: usize) -> BigUint {
    let bytes = kd::derive(&[base_key, &KD_ELGAMAL, &idx_bytes(index)], bytes_per_block);
    BigUint::from_bytes_be(&bytes)
}

pub fn derive_pubkey(group: &GroupParams, base_key: &[u8], index: u64, bytes_per_block: usize) -> BigUint {
    let privkey = derive_privkey(base_key, index, bytes_per_block);
    group.mod_pow(&group.g, &privkey)
}

pub fn derive_marker(base_key: &[u8], index: u64) -> Vec<u8> {
    kd::derive(&[base_key, &KD_MARKER, &idx_bytes(index)], MARKER_LEN)
}

/// Fixed-width big-endian encoding used only for the ElGamal
/// plaintext/ciphertext byte strings inside a block — distinct from
/// the leading-zero-suppressed canonical encoding used on the wire
/// (spec §9), because here the width is always `bytes_per_block` and
/// is never implicit.
fn to_fixed_be(n: &BigUint, len: usize) -> Vec<u8> {
    let raw = n.to_bytes_be();
    assert!(raw.len() <= len, "value does not fit in {len} bytes");
    let mut out = vec![0u8; len - raw.len()];
    out.extend_from_slice(&raw);
    out
}

/// Recomputes `marker_i` for `(base_key, index)` and verifies it
/// against `block.marker`.
fn check_ownership(block: &Block, base_key: &[u8], index: u64) -> Result<()> {
    if block.marker != derive_marker(base_key, index) {
        return Err(Error::WrongKey);
    }
    Ok(())
}

/// Decrypts block `index`, returning exactly `bytes_per_block` bytes.
pub fn decrypt(
    group: &GroupParams,
    base_key: &[u8],
    index: u64,
    bytes_per_block: usize,
    block: &Block,
) -> Result<Vec<u8>> {
    check_ownership(block, base_key, index)?;
    let privkey = derive_privkey(base_key, index, bytes_per_block);
    let shared = group.mod_pow(&block.c1, &privkey);
    let shared_inv = group.mod_inv(&shared);
    let plaintext_int = group.mod_mul(&block.c2, &shared_inv);
    Ok(to_fixed_be(&plaintext_int, bytes_per_block))
}

/// Encrypts `plaintext` (padded with trailing zero bytes to
/// `bytes_per_block` if shorter) into block `index`, claiming the
/// block if `annex` is set and it is currently unowned.
pub fn encrypt(
    group: &GroupParams,
    base_key: &[u8],
    index: u64,
    bytes_per_block: usize,
    plaintext: &[u8],
    existing: &Block,
    annex: bool,
) -> Result<Block> {
    assert!(
        plaintext.len() <= bytes_per_block,
        "plaintext longer than bytes_per_block"
    );
    let marker = derive_marker(base_key, index);
    if existing.marker != marker {
        if !annex {
            return Err(Error::WrongKey);
        }
    }
    let privkey = derive_privkey(base_key, index, bytes_per_block);
    let pubkey = group.mod_pow(&group.g, &privkey);

    let mut padded = plaintext.to_vec();
    padded.resize(bytes_per_block, 0);
    let plaintext_int = BigUint::from_bytes_be(&padded);

    let r = group.random_exponent();
    let c1 = group.mod_pow(&group.g, &r);
    let shared = group.mod_pow(&pubkey, &r);
    let c2 = group.mod_mul(&plaintext_int, &shared);

    Ok(Block {
        c1,
        c2,
        pubkey,
        marker,
    })
}

/// Rerandomizes a block: a fresh, statistically independent
/// ciphertext of the same plaintext under the same private key. The
/// marker is untouched; this is the deniability hinge (spec §9) and
/// must be applied to every block on every write path, including
/// unclaimed ones.
pub fn rerandomize(group: &GroupParams, block: &Block) -> Block {
    let s = group.random_exponent();
    let c1 = group.mod_mul(&block.c1, &group.mod_pow(&group.g, &s));
    let c2 = group.mod_mul(&block.c2, &group.mod_pow(&block.pubkey, &s));
    Block {
        c1,
        c2,
        pubkey: block.pubkey.clone(),
        marker: block.marker.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::Zero;

    fn test_group() -> GroupParams {
        // p = 2*32771 + 1 = 65543 (safe prime; 65543 and 32771 both
        // prime). Must exceed 2^(bytes_per_block*8) = 2^16 for every
        // 2-byte fixture message below to round-trip without wrapping.
        GroupParams {
            p: BigUint::from(65543u32),
            g: BigUint::from(4u32),
        }
    }

    fn empty_block() -> Block {
        Block {
            c1: BigUint::zero(),
            c2: BigUint::zero(),
            pubkey: BigUint::zero(),
            marker: Vec::new(),
        }
    }

    #[test]
    fn encrypt_then_decrypt_recovers_padded_plaintext() {
        let group = test_group();
        let key = b"base-key";
        let msg = b"hi";
        let encrypted = encrypt(&group, key, 3, 2, msg, &empty_block(), true).unwrap();
        let decrypted = decrypt(&group, key, 3, 2, &encrypted).unwrap();
        assert_eq!(decrypted, msg);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let group = test_group();
        let encrypted = encrypt(&group, b"key-a", 1, 2, b"hi", &empty_block(), true).unwrap();
        assert!(matches!(
            decrypt(&group, b"key-b", 1, 2, &encrypted),
            Err(Error::WrongKey)
        ));
    }

    #[test]
    fn encrypt_without_annex_on_unowned_block_fails() {
        let group = test_group();
        assert!(matches!(
            encrypt(&group, b"key", 1, 2, b"hi", &empty_block(), false),
            Err(Error::WrongKey)
        ));
    }

    #[test]
    fn rerandomize_preserves_plaintext_under_same_key() {
        let group = test_group();
        let key = b"base-key";
        let block = encrypt(&group, key, 2, 2, b"yo", &empty_block(), true).unwrap();
        let rerandomized = rerandomize(&group, &block);
        assert_eq!(
            decrypt(&group, key, 2, 2, &block).unwrap(),
            decrypt(&group, key, 2, 2, &rerandomized).unwrap()
        );
        assert_eq!(block.marker, rerandomized.marker);
        assert_eq!(block.pubkey, rerandomized.pubkey);
    }

    #[test]
    fn rerandomize_changes_ciphertext() {
        let group = test_group();
        let key = b"base-key";
        let block = encrypt(&group, key, 2, 2, b"yo", &empty_block(), true).unwrap();
        let r1 = rerandomize(&group, &block);
        let r2 = rerandomize(&group, &block);
        assert_ne!((r1.c1.clone(), r1.c2.clone()), (r2.c1, r2.c2));
    }

    proptest::proptest! {
        /// decrypt ∘ encrypt is the identity on any 2-byte plaintext,
        /// for any key and index, under a group that satisfies the
        /// `2^(bytes_per_block*8) < p` invariant.
        #[test]
        fn decrypt_of_encrypt_recovers_plaintext(
            key in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..32),
            index in proptest::prelude::any::<u64>(),
            plaintext in proptest::prelude::any::<[u8; 2]>(),
        ) {
            let group = test_group();
            let encrypted = encrypt(&group, &key, index, 2, &plaintext, &empty_block(), true).unwrap();
            let decrypted = decrypt(&group, &key, index, 2, &encrypted).unwrap();
            proptest::prop_assert_eq!(decrypted, plaintext.to_vec());
        }

        /// decrypt ∘ rerandomize agrees with decrypt on the
        /// un-rerandomized block, for any key, index, and plaintext —
        /// rerandomization never touches the plaintext under its own
        /// key.
        #[test]
        fn decrypt_agrees_across_rerandomize(
            key in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..32),
            index in proptest::prelude::any::<u64>(),
            plaintext in proptest::prelude::any::<[u8; 2]>(),
        ) {
            let group = test_group();
            let block = encrypt(&group, &key, index, 2, &plaintext, &empty_block(), true).unwrap();
            let rerandomized = rerandomize(&group, &block);
            proptest::prop_assert_eq!(
                decrypt(&group, &key, index, 2, &block).unwrap(),
                decrypt(&group, &key, index, 2, &rerandomized).unwrap()
            );
        }
    }
}
