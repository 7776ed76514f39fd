//! Canonical integer serialization, the packed-mapping wire format,
//! and SON payload framing (spec §6, §9).
//!
//! `Value` is the self-describing tree every on-disk structure
//! (safe header config, block array, access/main/append/secrets
//! tuples) is packed through: length-prefixed, nested, with
//! byte-string keys. It intentionally does not route through `serde`
//! — the exact byte layout required (explicit lengths everywhere,
//! empty string for "unclaimed") is easier to get right with a direct
//! encoder than to bend an off-the-shelf format to match.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use num_bigint::BigUint;
use num_traits::Zero;

use crate::error::{Error, Result};

/// Big-endian, no leading zero bytes; zero encodes as the empty
/// string (spec §9).
pub fn biguint_to_canonical_bytes(n: &BigUint) -> Vec<u8> {
    if n.is_zero() {
        Vec::new()
    } else {
        n.to_bytes_be()
    }
}

pub fn bytes_to_biguint(bytes: &[u8]) -> BigUint {
    if bytes.is_empty() {
        BigUint::zero()
    } else {
        BigUint::from_bytes_be(bytes)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Int(BigUint),
    List(Vec<Value>),
    Map(Vec<(Vec<u8>, Value)>),
}

impl Value {
    pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(b.into())
    }

    pub fn str(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    pub fn u64(n: u64) -> Value {
        Value::Int(BigUint::from(n))
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(b) => Ok(b),
            _ => Err(Error::Packing("expected byte string".into())),
        }
    }

    pub fn as_int(&self) -> Result<&BigUint> {
        match self {
            Value::Int(n) => Ok(n),
            _ => Err(Error::Packing("expected integer".into())),
        }
    }

    pub fn as_u64(&self) -> Result<u64> {
        let n = self.as_int()?;
        n.to_u64_digits()
            .first()
            .copied()
            .or(if n.is_zero() { Some(0) } else { None })
            .ok_or_else(|| Error::Packing("integer out of range for u64".into()))
    }

    pub fn as_list(&self) -> Result<&[Value]> {
        match self {
            Value::List(l) => Ok(l),
            _ => Err(Error::Packing("expected list".into())),
        }
    }

    pub fn as_map(&self) -> Result<&[(Vec<u8>, Value)]> {
        match self {
            Value::Map(m) => Ok(m),
            _ => Err(Error::Packing("expected map".into())),
        }
    }

    pub fn map_get(&self, key: &str) -> Result<&Value> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_slice() == key.as_bytes())
            .map(|(_, v)| v)
            .ok_or_else(|| Error::Packing(format!("missing key {key:?}")))
    }
}

const TAG_BYTES: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_LIST: u8 = 2;
const TAG_MAP: u8 = 3;

pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Bytes(b) => {
            out.write_u8(TAG_BYTES).unwrap();
            out.write_u32::<LittleEndian>(b.len() as u32).unwrap();
            out.extend_from_slice(b);
        }
        Value::Int(n) => {
            let bytes = biguint_to_canonical_bytes(n);
            out.write_u8(TAG_INT).unwrap();
            out.write_u32::<LittleEndian>(bytes.len() as u32).unwrap();
            out.extend_from_slice(&bytes);
        }
        Value::List(items) => {
            out.write_u8(TAG_LIST).unwrap();
            out.write_u32::<LittleEndian>(items.len() as u32).unwrap();
            for item in items {
                encode_into(item, out);
            }
        }
        Value::Map(entries) => {
            out.write_u8(TAG_MAP).unwrap();
            out.write_u32::<LittleEndian>(entries.len() as u32).unwrap();
            for (key, val) in entries {
                out.write_u32::<LittleEndian>(key.len() as u32).unwrap();
                out.extend_from_slice(key);
                encode_into(val, out);
            }
        }
    }
}

pub fn decode_all(bytes: &[u8]) -> Result<Value> {
    let mut cursor = std::io::Cursor::new(bytes);
    let value = decode_one(&mut cursor)?;
    if (cursor.position() as usize) != bytes.len() {
        return Err(Error::Packing("trailing bytes after packed value".into()));
    }
    Ok(value)
}

fn decode_one(cursor: &mut std::io::Cursor<&[u8]>) -> Result<Value> {
    let tag = cursor
        .read_u8()
        .map_err(|e| Error::Packing(e.to_string()))?;
    match tag {
        TAG_BYTES => {
            let len = read_len(cursor)?;
            Ok(Value::Bytes(read_exact(cursor, len)?))
        }
        TAG_INT => {
            let len = read_len(cursor)?;
            Ok(Value::Int(bytes_to_biguint(&read_exact(cursor, len)?)))
        }
        TAG_LIST => {
            let count = read_len(cursor)?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_one(cursor)?);
            }
            Ok(Value::List(items))
        }
        TAG_MAP => {
            let count = read_len(cursor)?;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let key_len = read_len(cursor)?;
                let key = read_exact(cursor, key_len)?;
                let val = decode_one(cursor)?;
                entries.push((key, val));
            }
            Ok(Value::Map(entries))
        }
        other => Err(Error::Packing(format!("unknown tag {other}"))),
    }
}

fn read_len(cursor: &mut std::io::Cursor<&[u8]>) -> Result<usize> {
    cursor
        .read_u32::<LittleEndian>()
        .map(|n| n as usize)
        .map_err(|e| Error::Packing(e.to_string()))
}

fn read_exact(cursor: &mut std::io::Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| Error::Packing(e.to_string()))?;
    Ok(buf)
}

/// SON payload framing (spec §6): one framing byte (`0x00` raw,
/// `0x01` deflate) followed by the packed value. Picks whichever is
/// shorter.
///
/// Access-slice plaintexts must keep a constant structural shape
/// (spec §9's compression-oracle note), so callers encoding an
/// access slice should use [`encode_framed_uncompressed`] instead.
pub fn encode_framed(value: &Value) -> Vec<u8> {
    let raw = encode(value);
    let compressed = deflate(&raw);
    if compressed.len() < raw.len() {
        let mut out = Vec::with_capacity(1 + compressed.len());
        out.push(0x01);
        out.extend(compressed);
        out
    } else {
        let mut out = Vec::with_capacity(1 + raw.len());
        out.push(0x00);
        out.extend(raw);
        out
    }
}

/// Always raw-framed: used for access slices so their compressed
/// length can never leak which role they hold (spec §9).
pub fn encode_framed_uncompressed(value: &Value) -> Vec<u8> {
    let raw = encode(value);
    let mut out = Vec::with_capacity(1 + raw.len());
    out.push(0x00);
    out.extend(raw);
    out
}

pub fn decode_framed(bytes: &[u8]) -> Result<Value> {
    let (tag, rest) = bytes
        .split_first()
        .ok_or_else(|| Error::Packing("empty framed payload".into()))?;
    match *tag {
        0x00 => decode_all(rest),
        0x01 => decode_all(&inflate(rest)?),
        other => Err(Error::Packing(format!("unknown framing byte {other}"))),
    }
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data).expect("in-memory writer never fails");
    encoder.finish().expect("in-memory writer never fails")
}

fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Packing(format!("deflate decode failed: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_int_roundtrip() {
        for n in [0u64, 1, 255, 256, 65535, 65536, u64::MAX] {
            let b = BigUint::from(n);
            let bytes = biguint_to_canonical_bytes(&b);
            assert_eq!(bytes_to_biguint(&bytes), b);
        }
        assert!(biguint_to_canonical_bytes(&BigUint::zero()).is_empty());
    }

    #[test]
    fn value_roundtrip_nested() {
        let value = Value::Map(vec![
            (b"type".to_vec(), Value::str("elgamal")),
            (b"n".to_vec(), Value::u64(1024)),
            (
                b"blocks".to_vec(),
                Value::List(vec![
                    Value::bytes(vec![1, 2, 3]),
                    Value::bytes(Vec::<u8>::new()),
                ]),
            ),
        ]);
        let encoded = encode(&value);
        let decoded = decode_all(&encoded).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn framed_roundtrip_picks_shorter_encoding() {
        let compressible = Value::Bytes(vec![0u8; 4096]);
        let framed = encode_framed(&compressible);
        assert_eq!(framed[0], 0x01, "highly compressible payload should deflate");
        assert_eq!(decode_framed(&framed).unwrap(), compressible);

        let incompressible = Value::Bytes((0u16..300).map(|i| i as u8).collect());
        let framed2 = encode_framed(&incompressible);
        assert_eq!(decode_framed(&framed2).unwrap(), incompressible);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let value = Value::u64(5);
        let mut encoded = encode(&value);
        encoded.truncate(encoded.len() - 1);
        assert!(decode_all(&encoded).is_err());
    }
}
