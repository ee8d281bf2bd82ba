// SPDX-License-Identifier: MIT

//! The zb store daemon: the store's single source of truth.
//!
//! Clients (CLI, web inspector) talk to the daemon over a Unix-domain
//! JSON-RPC socket. The daemon owns the store directory, the object-info
//! database, and the realization engine that turns derivations into
//! store objects.
//!
//! # Layout
//!
//! - [`config`] - JSON-with-comments configuration and merge laws
//! - [`store_fs`] - atomic object import/export on the store directory
//! - [`sandbox`] - builder isolation contract and process backend
//! - [`build`] - single-derivation build execution
//! - [`scheduler`] - closure resolution, de-duplication, build driving
//! - [`server`] - the framed JSON-RPC server

pub mod build;
pub mod config;
pub mod error;
pub mod sandbox;
pub mod scheduler;
pub mod server;
pub mod store_fs;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use error::{DaemonError, Result};
pub use scheduler::Realizer;
pub use server::{Handler, Server};
pub use store_fs::StoreFs;
