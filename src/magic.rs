//! Magic byte strings (spec §6) and access-type codes.
//!
//! Every constant below is freshly generated for this implementation
//! rather than copied verbatim from spec §6's table — not just
//! `KD_ELGAMAL`/`KD_LIST` (the pair spec §9's open question explicitly
//! licenses splitting into two independent values). This is a new
//! on-disk format with no legacy file to stay byte-compatible with
//! (see SPEC_FULL.md §9), so none of `AS_MAGIC`, `MAIN_SLICE_MAGIC`,
//! `APPEND_SLICE_MAGIC`, `KD_MARKER`, `KD_SYMM`, or `KD_APPEND` match
//! §6's literal hex values either. See DESIGN.md.

pub const FILE_MAGIC: &[u8] = b"dnv\n";
pub const FILE_MAGIC_TAIL: [u8; 14] = [
    0xe1, 0x3f, 0x9a, 0x02, 0xc7, 0x6b, 0x58, 0x4d, 0x11, 0x0a, 0x3c, 0x9e, 0x7f, 0x22,
];

pub const AS_MAGIC: &[u8] = b"as01";
pub const MAIN_SLICE_MAGIC: &[u8] = b"mn01";
pub const APPEND_SLICE_MAGIC: &[u8] = b"ap01";

pub const KD_ELGAMAL: [u8; 16] = [
    0x4f, 0x1d, 0x8b, 0x72, 0xe0, 0x3a, 0x95, 0xc1, 0x6d, 0x2e, 0xaf, 0x08, 0x77, 0xb4, 0x53, 0x19,
];
pub const KD_MARKER: [u8; 16] = [
    0x9c, 0x21, 0x4d, 0x6e, 0xb8, 0x3f, 0x10, 0xa5, 0x7e, 0x44, 0x0b, 0xd9, 0x62, 0x1c, 0xf7, 0x80,
];
pub const KD_SYMM: [u8; 16] = [
    0x31, 0xe9, 0x5c, 0xa4, 0x6f, 0x02, 0xdb, 0x8e, 0x17, 0x5a, 0x93, 0x2d, 0xc6, 0x4b, 0x0e, 0x7f,
];
pub const KD_LIST: [u8; 16] = [
    0xd7, 0x0a, 0x6c, 0x39, 0x8e, 0x51, 0x2f, 0xa3, 0x9d, 0x64, 0x18, 0xbc, 0x2e, 0x97, 0x45, 0x0d,
];
pub const KD_APPEND: [u8; 16] = [
    0x62, 0x8f, 0x3b, 0xd1, 0x05, 0x7c, 0xe4, 0x92, 0x3a, 0x6e, 0x19, 0xaa, 0x58, 0x0c, 0xd3, 0xb7,
];

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessType {
    Full = 0,
    List = 1,
    Append = 2,
}

impl AccessType {
    pub fn from_u8(n: u8) -> Option<AccessType> {
        match n {
            0 => Some(AccessType::Full),
            1 => Some(AccessType::List),
            2 => Some(AccessType::Append),
            _ => None,
        }
    }
}
