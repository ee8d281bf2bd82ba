// SPDX-License-Identifier: MIT

//! Canonical archive (NAR) handling for the zb store.
//!
//! The archive format is a canonical, order-stable serialization of a
//! filesystem subtree with three node types (regular file, directory,
//! symlink) and an executable bit on regular files. Directory entries are
//! emitted in ascending name order; timestamps, ownership and extended
//! attributes are not encoded. The same grammar and token encoding as the
//! classic Nix archive format is used, so existing tooling can inspect
//! store exports.
//!
//! Everything here streams: dumps never hold a whole file in memory, and
//! [`NarByteStream`] bounds in-flight chunks with back-pressure.

pub mod dump;
pub mod export;
pub mod hashing_reader;
pub mod restore;
pub mod wire;

mod byte_stream;

pub use byte_stream::NarByteStream;
pub use dump::dump;
pub use hashing_reader::HashingReader;
pub use restore::{RestoreError, restore};

use futures::StreamExt as _;
use sha2::{Digest as _, Sha256};
use std::path::Path;
use zb_store_core::Hash;

/// Hash a filesystem subtree's canonical archive serialization in one
/// pass, returning the digest and the serialization's byte length.
pub async fn nar_hash(path: &Path) -> std::io::Result<(Hash, u64)> {
    let mut hasher = Sha256::new();
    let mut size: u64 = 0;

    let mut stream = NarByteStream::new(path.to_path_buf());
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        size += chunk.len() as u64;
    }

    Ok((Hash::sha256(hasher.finalize().into()), size))
}
