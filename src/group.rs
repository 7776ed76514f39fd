//! ElGamal group arithmetic (C1 — spec §4.1, §6).
//!
//! A multiplicative group mod a safe prime `p` with generator `g`.
//! Group elements and all other arbitrary-precision integers in the
//! wire format serialize with the leading-zero-suppressed convention
//! implemented in `packing::biguint_to_canonical_bytes`; the
//! surrounding packed container always carries an explicit length, so
//! no padding needs to survive the round trip.

use num_bigint::{BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::One;
use rand::rngs::OsRng;

use crate::error::{Error, Result};
use crate::packing;

/// Probabilistic primality test used by safe-prime search.
fn probably_prime(n: &BigUint) -> bool {
    matches!(
        num_prime::nt_funcs::is_prime(n, None),
        num_prime::Primality::Yes | num_prime::Primality::Probable
    )
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupParams {
    pub p: BigUint,
    pub g: BigUint,
}

impl GroupParams {
    /// Number of bytes needed to hold any element of `[0, p)`.
    pub fn element_size(&self) -> usize {
        (self.p.bits() as usize).div_ceil(8)
    }

    pub fn validate(&self) -> Result<()> {
        if self.p < BigUint::from(5u32) {
            return Err(Error::UnsupportedVariant("group prime too small".into()));
        }
        if self.g < BigUint::from(2u32) || self.g >= self.p {
            return Err(Error::UnsupportedVariant("generator out of range".into()));
        }
        Ok(())
    }

    /// Generates a fresh safe-prime group of at least `bits` bits by
    /// sequential rejection sampling. Prefer [`GroupParams::generate_parallel`]
    /// outside of tests; this is the single-threaded fallback it's built on.
    pub fn generate(bits: u64) -> Self {
        loop {
            if let Some(params) = Self::try_candidate(bits) {
                return params;
            }
        }
    }

    /// Generates a fresh safe-prime group using `workers` threads
    /// racing independent candidates (spec §4.6): the canonical use
    /// of `parallel::parallel_try`, since safe-prime search is
    /// embarrassingly parallel and dominated by the primality test.
    pub fn generate_parallel(bits: u64, workers: usize) -> Self {
        crate::parallel::parallel_try(workers, || Self::try_candidate(bits))
    }

    fn try_candidate(bits: u64) -> Option<Self> {
        let mut rng = rand::thread_rng();
        // q is a random odd `bits-1`-bit number; p = 2q + 1 is a safe
        // prime iff both p and q are prime.
        let mut q = rng.gen_biguint(bits - 1);
        q.set_bit(0, true);
        q.set_bit(bits - 2, true);
        if !probably_prime(&q) {
            return None;
        }
        let p = &q * BigUint::from(2u32) + BigUint::one();
        if !probably_prime(&p) {
            return None;
        }
        // 4 = 2^2 always lies in the order-q quadratic-residue
        // subgroup of Z*_p when p = 2q + 1; any non-identity element
        // of a prime-order group generates it.
        let g = BigUint::from(4u32);
        Some(GroupParams { p, g })
    }

    pub fn mod_pow(&self, base: &BigUint, exp: &BigUint) -> BigUint {
        base.modpow(exp, &self.p)
    }

    pub fn mod_mul(&self, a: &BigUint, b: &BigUint) -> BigUint {
        (a * b).mod_floor(&self.p)
    }

    /// Returns `a^-1 mod p` via Fermat's little theorem (`p` is
    /// prime).
    pub fn mod_inv(&self, a: &BigUint) -> BigUint {
        let exp = &self.p - BigUint::from(2u32);
        a.modpow(&exp, &self.p)
    }

    /// Samples a uniform random integer in `[2, p)`, as required by
    /// ElGamal's per-encryption/rerandomization randomness (spec
    /// §4.2).
    pub fn random_exponent(&self) -> BigUint {
        let mut rng = OsRng;
        let upper = &self.p - BigUint::from(2u32);
        rng.gen_biguint_below(&upper) + BigUint::from(2u32)
    }

    /// Canonical big-endian encoding with leading zero bytes
    /// suppressed (spec §9); the surrounding packed container always
    /// carries an explicit length, so the value round-trips exactly.
    pub fn serialize_element(&self, elem: &BigUint) -> Vec<u8> {
        packing::biguint_to_canonical_bytes(elem)
    }

    pub fn deserialize_element(&self, bytes: &[u8]) -> BigUint {
        packing::bytes_to_biguint(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::Zero;

    fn test_group() -> GroupParams {
        // p = 2*11 + 1 = 23 is a safe prime (q = 11 is prime).
        GroupParams {
            p: BigUint::from(23u32),
            g: BigUint::from(4u32),
        }
    }

    #[test]
    fn mod_pow_and_inv_roundtrip() {
        let grp = test_group();
        let base = BigUint::from(7u32);
        let exp = BigUint::from(5u32);
        let powered = grp.mod_pow(&base, &exp);
        let inv = grp.mod_inv(&powered);
        assert_eq!(grp.mod_mul(&powered, &inv), BigUint::one());
    }

    #[test]
    fn validate_rejects_bad_generator() {
        let mut grp = test_group();
        grp.g = BigUint::zero();
        assert!(grp.validate().is_err());
    }
}
