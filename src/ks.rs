//! Key stretching (C1 — spec §4.1).
//!
//! Deterministic given fixed parameters, deliberately expensive.
//! `Argon2id` is the default; `Scrypt` is kept as a fallback variant so
//! legacy parameter dictionaries stay representable.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum KeyStretching {
    Argon2id {
        time_cost: u32,
        mem_cost_kib: u32,
        parallelism: u32,
        salt: Vec<u8>,
    },
    Scrypt {
        log_n: u8,
        salt: Vec<u8>,
    },
}

impl KeyStretching {
    /// A fresh set of Argon2id parameters meeting the default memory
    /// cost floor (≥100 MiB), with a random salt.
    pub fn default_argon2id() -> Self {
        let mut salt = vec![0u8; 16];
        getrandom::getrandom(&mut salt).expect("OS RNG must be available");
        KeyStretching::Argon2id {
            time_cost: 3,
            mem_cost_kib: 131_072, // 128 MiB
            parallelism: 1,
            salt,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            KeyStretching::Argon2id {
                time_cost,
                mem_cost_kib,
                parallelism,
                salt,
            } => {
                if *time_cost == 0 || *parallelism == 0 || salt.is_empty() {
                    return Err(Error::UnsupportedVariant(
                        "argon2id parameters must be non-zero".into(),
                    ));
                }
                if *mem_cost_kib < 8 * (*parallelism) {
                    return Err(Error::UnsupportedVariant(
                        "argon2id memory cost too small for parallelism".into(),
                    ));
                }
                Ok(())
            }
            KeyStretching::Scrypt { log_n, salt } => {
                if *log_n == 0 || *log_n >= 63 || salt.is_empty() {
                    return Err(Error::UnsupportedVariant(
                        "scrypt log_n out of range".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Stretches `password` to a 32-byte key.
    pub fn stretch(&self, password: &[u8]) -> Result<[u8; 32]> {
        self.validate()?;
        match self {
            KeyStretching::Argon2id {
                time_cost,
                mem_cost_kib,
                parallelism,
                salt,
            } => {
                let params = argon2::Params::new(*mem_cost_kib, *time_cost, *parallelism, Some(32))
                    .map_err(|e| Error::KeyStretchingFailed(e.to_string()))?;
                let argon2 = argon2::Argon2::new(
                    argon2::Algorithm::Argon2id,
                    argon2::Version::V0x13,
                    params,
                );
                let mut out = [0u8; 32];
                argon2
                    .hash_password_into(password, salt, &mut out)
                    .map_err(|e| Error::KeyStretchingFailed(e.to_string()))?;
                Ok(out)
            }
            KeyStretching::Scrypt { log_n, salt } => {
                let params = scrypt::Params::new(*log_n, 8, 1, 32)
                    .map_err(|e| Error::KeyStretchingFailed(e.to_string()))?;
                let mut out = [0u8; 32];
                scrypt::scrypt(password, salt, &params, &mut out)
                    .map_err(|e| Error::KeyStretchingFailed(e.to_string()))?;
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_argon2id() -> KeyStretching {
        KeyStretching::Argon2id {
            time_cost: 1,
            mem_cost_kib: 8,
            parallelism: 1,
            salt: vec![1u8; 16],
        }
    }

    fn tiny_scrypt() -> KeyStretching {
        KeyStretching::Scrypt {
            log_n: 4,
            salt: vec![2u8; 16],
        }
    }

    #[test]
    fn deterministic_given_fixed_params() {
        let ks = tiny_argon2id();
        assert_eq!(ks.stretch(b"hunter2").unwrap(), ks.stretch(b"hunter2").unwrap());
    }

    #[test]
    fn different_password_different_output() {
        let ks = tiny_argon2id();
        assert_ne!(ks.stretch(b"a").unwrap(), ks.stretch(b"b").unwrap());
    }

    #[test]
    fn scrypt_variant_works() {
        let ks = tiny_scrypt();
        assert_eq!(ks.stretch(b"hunter2").unwrap(), ks.stretch(b"hunter2").unwrap());
    }

    #[test]
    fn rejects_zero_time_cost() {
        let ks = KeyStretching::Argon2id {
            time_cost: 0,
            mem_cost_kib: 8,
            parallelism: 1,
            salt: vec![1u8; 16],
        };
        assert!(ks.stretch(b"x").is_err());
    }
}
