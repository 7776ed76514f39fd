//! Error taxonomy for the storage core (see spec §7).
//!
//! `WrongKey` and the slice-lookup failures it feeds are recovered
//! locally wherever deniability depends on it (see `slice::find` and
//! `container::open_containers`); everything else propagates to the
//! caller via `?`.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A block's marker (or a slice's stream header) didn't match the
    /// key under test. Load-bearing for deniability: callers must be
    /// able to treat this as "not mine" with no other observable
    /// difference from a block that really isn't owned by anyone.
    #[error("wrong key for this block or slice")]
    WrongKey,

    /// The caller holds a lower access level than the operation needs
    /// (e.g. an append-only container asked to decrypt secrets).
    #[error("operation requires higher access than held")]
    MissingKey,

    /// The safe's free set has fewer blocks than the slice needs.
    #[error("safe is full: need {needed} free blocks, have {available}")]
    SafeFull { needed: usize, available: usize },

    /// The file lock is held by another process.
    #[error("safe is locked by another process")]
    SafeLocked,

    /// File header magic didn't match.
    #[error("wrong magic: this is not a safe file")]
    WrongMagic,

    /// The packed structure was internally inconsistent (top-level
    /// header/config, as opposed to a nested decode failure inside an
    /// already-located slice — see `Packing`).
    #[error("safe file structure is inconsistent: {0}")]
    SafeFormat(String),

    /// A nested packed value (access tuple, main tuple, append tuple,
    /// secret tuple) failed to decode.
    #[error("malformed packed payload: {0}")]
    Packing(String),

    #[error("safe not found at given path")]
    SafeNotFound,

    #[error("safe already exists at given path")]
    SafeAlreadyExists,

    #[error("key stretching failed: {0}")]
    KeyStretchingFailed(String),

    #[error("envelope seal/open failed: {0}")]
    EnvelopeFailed(String),

    #[error("unsupported parameter variant: {0}")]
    UnsupportedVariant(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
