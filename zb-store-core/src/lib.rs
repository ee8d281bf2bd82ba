// SPDX-License-Identifier: MIT

//! Core store semantics for zb.
//!
//! This crate provides the fundamental types and pure computation logic for
//! working with the zb store: store paths and digests, content addressing,
//! self-reference tracking, derivations, and realization signatures. It is
//! intentionally IO-free - all operations are pure functions over values -
//! so that the daemon crates can test and compose them freely.
//!
//! # Key modules
//!
//! - [`base32`] - the store's base-32 digest alphabet
//! - [`store_path`] - `StoreDir`, `StorePath`, parsing and validation
//! - [`content_address`] - CA fingerprints and output-path construction
//! - [`selfref`] - content addressing modulo self-references, rewrites
//! - [`derivation`] - the derivation model and its ATerm encoding
//! - [`references`] - streaming store-path reference scanning
//! - [`signature`] / [`realisation`] - ed25519-signed realization records

pub mod base32;
pub mod content_address;
pub mod derivation;
pub mod hash;
pub mod realisation;
pub mod references;
pub mod selfref;
pub mod signature;
pub mod store_path;

pub use content_address::{CaMethod, ContentAddress};
pub use hash::{Hash, HashAlgo};
pub use store_path::{StoreDir, StorePath};
