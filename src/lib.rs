//! A deniable, multi-container password safe storage core.
//!
//! A safe is a single file of fixed-size ElGamal blocks (§4.2). A
//! [`slice`] spreads a variable-length record over an unordered
//! multiset of those blocks (§4.3). A [`container::Container`] is
//! built from up to three slices — access, main, and an optional
//! append slice — reached through a chain of three keys derived from
//! one `full_key` (§4.4). [`safe::Safe`] is the file-level facade:
//! creating, opening, and closing a safe, where closing always
//! rerandomizes every block so that the file's apparent content gives
//! no sign of what changed or which containers exist.
//!
//! Crypto primitives — key stretching, key derivation, the symmetric
//! block-cipher stream, ElGamal group arithmetic, and the asymmetric
//! envelope used by append-only access — are abstract capabilities
//! with one concrete choice each, configured through [`config::Config`].

pub mod block;
pub mod config;
pub mod container;
pub mod envelope;
pub mod error;
pub mod group;
pub mod kd;
pub mod ks;
pub mod magic;
pub mod packing;
pub mod parallel;
pub mod safe;
pub mod slice;
pub mod stream;

pub use config::Config;
pub use container::{Container, ContainerHandle, Entry};
pub use error::{Error, Result};
pub use group::GroupParams;
pub use safe::Safe;
