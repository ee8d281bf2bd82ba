// SPDX-License-Identifier: MIT

//! The object-info database: persistent metadata for store objects,
//! realization records, builds and build logs.
//!
//! [`StoreDb`] is a synchronous connection with the full query/write
//! API; [`Db`] wraps a pool of connections for async callers, with a
//! writer lane (default size 1) serializing writes and an optional
//! reader lane for concurrent queries.

mod builds;
mod connection;
mod error;
mod pool;
mod query;
mod schema;
mod write;

pub use builds::{BuildResultRow, BuildRow, LogChunk};
pub use connection::{OpenMode, StoreDb};
pub use error::{Error, Result};
pub use pool::Db;
pub use query::{ObjectInfo, RealisationRow};
pub use write::{RealisationParams, RegisterObjectParams};
