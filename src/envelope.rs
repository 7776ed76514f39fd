//! Asymmetric envelope (C1 — spec §4.1).
//!
//! Sealed-box construction: an ephemeral X25519 keypair is generated
//! per `seal`, Diffie-Hellman'd against the recipient's static public
//! key, and the shared secret (bound to both public keys) is stretched
//! via HKDF-SHA256 into an XChaCha20-Poly1305 key and nonce. Used by
//! the container layer's append path (spec §4.4): a holder of only
//! `append_key` can seal new entries for later decryption by whoever
//! holds `full_key`, without being able to read back what it just
//! wrote.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};
use crate::kd;

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const PRIVATE_KEY_SIZE: usize = 32;

pub fn generate_keypair() -> (PublicKey, StaticSecret) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (public, secret)
}

fn derive_key_and_nonce(shared: &[u8; 32], eph_pub: &[u8; 32], recipient_pub: &[u8; 32]) -> ([u8; 32], [u8; 24]) {
    let out = kd::derive(
        &[shared, eph_pub, recipient_pub, b"denyvault-envelope-v1"],
        56,
    );
    let mut key = [0u8; 32];
    let mut nonce = [0u8; 24];
    key.copy_from_slice(&out[..32]);
    nonce.copy_from_slice(&out[32..56]);
    (key, nonce)
}

/// Encrypts `msg` for `recipient_pub`. Returns `ephemeral_pubkey (32
/// bytes) || aead_ciphertext`.
pub fn seal(msg: &[u8], recipient_pub: &PublicKey) -> Result<Vec<u8>> {
    let (eph_pub, eph_secret) = generate_keypair();
    let shared = eph_secret.diffie_hellman(recipient_pub);
    let (key, nonce) = derive_key_and_nonce(shared.as_bytes(), eph_pub.as_bytes(), recipient_pub.as_bytes());

    let aead = XChaCha20Poly1305::new((&key).into());
    let ct = aead
        .encrypt(XNonce::from_slice(&nonce), msg)
        .map_err(|_| Error::EnvelopeFailed("seal failed".into()))?;

    let mut out = Vec::with_capacity(PUBLIC_KEY_SIZE + ct.len());
    out.extend_from_slice(eph_pub.as_bytes());
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Decrypts a ciphertext produced by [`seal`].
pub fn open(ct: &[u8], priv_key: &StaticSecret) -> Result<Vec<u8>> {
    if ct.len() < PUBLIC_KEY_SIZE {
        return Err(Error::EnvelopeFailed("ciphertext too short".into()));
    }
    let mut eph_pub_bytes = [0u8; 32];
    eph_pub_bytes.copy_from_slice(&ct[..PUBLIC_KEY_SIZE]);
    let eph_pub = PublicKey::from(eph_pub_bytes);

    let shared = priv_key.diffie_hellman(&eph_pub);
    let recipient_pub = PublicKey::from(priv_key);
    let (key, nonce) = derive_key_and_nonce(shared.as_bytes(), eph_pub.as_bytes(), recipient_pub.as_bytes());

    let aead = XChaCha20Poly1305::new((&key).into());
    aead.decrypt(XNonce::from_slice(&nonce), &ct[PUBLIC_KEY_SIZE..])
        .map_err(|_| Error::EnvelopeFailed("open failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let (pub_key, priv_key) = generate_keypair();
        let msg = b"a secret only the full-key holder should read";
        let ct = seal(msg, &pub_key).unwrap();
        let pt = open(&ct, &priv_key).unwrap();
        assert_eq!(pt, msg);
    }

    #[test]
    fn wrong_key_fails() {
        let (pub_key, _priv_key) = generate_keypair();
        let (_other_pub, other_priv) = generate_keypair();
        let ct = seal(b"hello", &pub_key).unwrap();
        assert!(open(&ct, &other_priv).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (pub_key, priv_key) = generate_keypair();
        let mut ct = seal(b"hello", &pub_key).unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 1;
        assert!(open(&ct, &priv_key).is_err());
    }

    #[test]
    fn independent_seals_are_unlinkable() {
        let (pub_key, _priv_key) = generate_keypair();
        let ct1 = seal(b"same message", &pub_key).unwrap();
        let ct2 = seal(b"same message", &pub_key).unwrap();
        assert_ne!(ct1, ct2);
    }
}
