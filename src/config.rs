//! Parameter dictionaries for the safe's on-disk configuration (spec
//! §4.1, §6). Each primitive variant is a small struct that validates
//! its own fields and knows how to pack/unpack itself through
//! [`crate::packing::Value`].

use crate::error::{Error, Result};
use crate::group::GroupParams;
use crate::ks::KeyStretching;
use crate::packing::Value;

pub const DEFAULT_N_BLOCKS: usize = 1024;
pub const DEFAULT_BYTES_PER_BLOCK: usize = 128;
pub const DEFAULT_BLOCK_INDEX_SIZE: usize = 2;
pub const DEFAULT_SLICE_SIZE_FIELD: usize = 4;
pub const DEFAULT_GROUP_BITS: u64 = 1025;

#[derive(Clone, Debug)]
pub struct Config {
    pub n_blocks: usize,
    pub bytes_per_block: usize,
    pub block_index_size: usize,
    pub slice_size_field: usize,
    pub group: GroupParams,
    pub key_stretching: KeyStretching,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if ![1usize, 2, 4].contains(&self.block_index_size) {
            return Err(Error::UnsupportedVariant(
                "block-index-size must be 1, 2 or 4".into(),
            ));
        }
        if ![2usize, 4].contains(&self.slice_size_field) {
            return Err(Error::UnsupportedVariant(
                "slice-size must be 2 or 4".into(),
            ));
        }
        self.group.validate()?;
        self.key_stretching.validate()?;
        let max_index = (self.n_blocks as u128).saturating_sub(1);
        let max_representable = (1u128 << (self.block_index_size * 8)) - 1;
        if max_index > max_representable {
            return Err(Error::UnsupportedVariant(
                "block-index-size too small for n-blocks".into(),
            ));
        }
        // 2^(bytes_per_block*8) < p (spec §3 invariant).
        let plaintext_bits = (self.bytes_per_block * 8) as u64;
        if self.group.p.bits() <= plaintext_bits {
            return Err(Error::UnsupportedVariant(
                "group prime too small for bytes-per-block".into(),
            ));
        }
        Ok(())
    }

    pub fn to_value(&self) -> Value {
        Value::Map(vec![
            (b"type".to_vec(), Value::str("elgamal")),
            (b"n-blocks".to_vec(), Value::u64(self.n_blocks as u64)),
            (
                b"bytes-per-block".to_vec(),
                Value::u64(self.bytes_per_block as u64),
            ),
            (
                b"block-index-size".to_vec(),
                Value::u64(self.block_index_size as u64),
            ),
            (
                b"slice-size".to_vec(),
                Value::u64(self.slice_size_field as u64),
            ),
            (
                b"group-params".to_vec(),
                Value::List(vec![
                    Value::Int(self.group.p.clone()),
                    Value::Int(self.group.g.clone()),
                ]),
            ),
            (b"key-stretching".to_vec(), key_stretching_to_value(&self.key_stretching)),
            (b"key-derivation".to_vec(), key_derivation_to_value()),
            (b"envelope".to_vec(), envelope_to_value()),
            (b"block-cipher".to_vec(), block_cipher_to_value()),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Config> {
        let ty = value.map_get("type")?.as_bytes()?;
        if ty != b"elgamal" {
            return Err(Error::SafeFormat(format!(
                "unsupported config type {:?}",
                String::from_utf8_lossy(ty)
            )));
        }
        let n_blocks = value.map_get("n-blocks")?.as_u64()? as usize;
        let bytes_per_block = value.map_get("bytes-per-block")?.as_u64()? as usize;
        let block_index_size = value.map_get("block-index-size")?.as_u64()? as usize;
        let slice_size_field = value.map_get("slice-size")?.as_u64()? as usize;
        let group_params = value.map_get("group-params")?.as_list()?;
        if group_params.len() != 2 {
            return Err(Error::SafeFormat("group-params must have 2 elements".into()));
        }
        let group = GroupParams {
            p: group_params[0].as_int()?.clone(),
            g: group_params[1].as_int()?.clone(),
        };
        let key_stretching = key_stretching_from_value(value.map_get("key-stretching")?)?;
        key_derivation_from_value(value.map_get("key-derivation")?)?;
        envelope_from_value(value.map_get("envelope")?)?;
        block_cipher_from_value(value.map_get("block-cipher")?)?;

        let config = Config {
            n_blocks,
            bytes_per_block,
            block_index_size,
            slice_size_field,
            group,
            key_stretching,
        };
        config.validate()?;
        Ok(config)
    }
}

fn key_stretching_to_value(ks: &KeyStretching) -> Value {
    match ks {
        KeyStretching::Argon2id {
            time_cost,
            mem_cost_kib,
            parallelism,
            salt,
        } => Value::Map(vec![
            (b"type".to_vec(), Value::str("argon2id")),
            (b"time-cost".to_vec(), Value::u64(*time_cost as u64)),
            (b"mem-cost-kib".to_vec(), Value::u64(*mem_cost_kib as u64)),
            (b"parallelism".to_vec(), Value::u64(*parallelism as u64)),
            (b"salt".to_vec(), Value::bytes(salt.clone())),
        ]),
        KeyStretching::Scrypt { log_n, salt } => Value::Map(vec![
            (b"type".to_vec(), Value::str("scrypt")),
            (b"log-n".to_vec(), Value::u64(*log_n as u64)),
            (b"salt".to_vec(), Value::bytes(salt.clone())),
        ]),
    }
}

fn key_stretching_from_value(value: &Value) -> Result<KeyStretching> {
    let ty = value.map_get("type")?.as_bytes()?;
    match ty {
        b"argon2id" => Ok(KeyStretching::Argon2id {
            time_cost: value.map_get("time-cost")?.as_u64()? as u32,
            mem_cost_kib: value.map_get("mem-cost-kib")?.as_u64()? as u32,
            parallelism: value.map_get("parallelism")?.as_u64()? as u32,
            salt: value.map_get("salt")?.as_bytes()?.to_vec(),
        }),
        b"scrypt" => Ok(KeyStretching::Scrypt {
            log_n: value.map_get("log-n")?.as_u64()? as u8,
            salt: value.map_get("salt")?.as_bytes()?.to_vec(),
        }),
        other => Err(Error::UnsupportedVariant(format!(
            "key-stretching type {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

/// `kd.rs`, `envelope.rs`, and `stream.rs` each fix a single concrete
/// variant (spec §4.1) rather than offering a choice the way
/// key-stretching does, but §6's file format still carries a
/// dictionary for each so a future additional variant doesn't require
/// a format break. `from_value` rejects anything but the one variant
/// this crate implements.
fn key_derivation_to_value() -> Value {
    Value::Map(vec![(b"type".to_vec(), Value::str("hkdf-sha256"))])
}

fn key_derivation_from_value(value: &Value) -> Result<()> {
    let ty = value.map_get("type")?.as_bytes()?;
    if ty != b"hkdf-sha256" {
        return Err(Error::UnsupportedVariant(format!(
            "key-derivation type {:?}",
            String::from_utf8_lossy(ty)
        )));
    }
    Ok(())
}

fn envelope_to_value() -> Value {
    Value::Map(vec![(
        b"type".to_vec(),
        Value::str("x25519-hkdf-sha256-xchacha20poly1305"),
    )])
}

fn envelope_from_value(value: &Value) -> Result<()> {
    let ty = value.map_get("type")?.as_bytes()?;
    if ty != b"x25519-hkdf-sha256-xchacha20poly1305" {
        return Err(Error::UnsupportedVariant(format!(
            "envelope type {:?}",
            String::from_utf8_lossy(ty)
        )));
    }
    Ok(())
}

fn block_cipher_to_value() -> Value {
    Value::Map(vec![(b"type".to_vec(), Value::str("aes-256-ctr"))])
}

fn block_cipher_from_value(value: &Value) -> Result<()> {
    let ty = value.map_get("type")?.as_bytes()?;
    if ty != b"aes-256-ctr" {
        return Err(Error::UnsupportedVariant(format!(
            "block-cipher type {:?}",
            String::from_utf8_lossy(ty)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;

    fn test_config() -> Config {
        Config {
            n_blocks: 70,
            bytes_per_block: 16,
            block_index_size: 2,
            slice_size_field: 2,
            group: GroupParams {
                p: BigUint::from(2147483647u64), // a (non-safe, but fine for structural tests) prime > 2^16
                g: BigUint::from(7u32),
            },
            key_stretching: KeyStretching::Argon2id {
                time_cost: 1,
                mem_cost_kib: 8,
                parallelism: 1,
                salt: vec![0u8; 16],
            },
        }
    }

    #[test]
    fn roundtrips_through_packed_value() {
        let config = test_config();
        let value = config.to_value();
        let decoded = Config::from_value(&value).unwrap();
        assert_eq!(decoded.n_blocks, config.n_blocks);
        assert_eq!(decoded.bytes_per_block, config.bytes_per_block);
        assert_eq!(decoded.group.p, config.group.p);
        assert_eq!(decoded.group.g, config.group.g);
    }

    #[test]
    fn rejects_index_size_too_small_for_n_blocks() {
        let mut config = test_config();
        config.block_index_size = 1;
        config.n_blocks = 1 << 16; // needs 2 bytes, not 1
        assert!(config.validate().is_err());
    }

    #[test]
    fn packed_value_carries_key_derivation_envelope_and_block_cipher_dicts() {
        let value = test_config().to_value();
        assert!(value.map_get("key-derivation").is_ok());
        assert!(value.map_get("envelope").is_ok());
        assert!(value.map_get("block-cipher").is_ok());
    }

    #[test]
    fn from_value_rejects_unknown_key_derivation_type() {
        let mut entries = match test_config().to_value() {
            Value::Map(e) => e,
            _ => unreachable!(),
        };
        for entry in &mut entries {
            if entry.0 == b"key-derivation" {
                entry.1 = Value::Map(vec![(b"type".to_vec(), Value::str("unknown"))]);
            }
        }
        assert!(Config::from_value(&Value::Map(entries)).is_err());
    }
}
