// SPDX-License-Identifier: MIT

//! The daemon's error taxonomy and its JSON-RPC mapping.

use zb_store_core::store_path::StorePathError;

pub type Result<T> = std::result::Result<T, DaemonError>;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("builder for {drv_path} failed with exit code {exit_code}")]
    BuilderFailed { drv_path: String, exit_code: i32 },

    #[error("hash mismatch for {output}: expected {expected}, got {actual}")]
    HashMismatch {
        output: String,
        expected: String,
        actual: String,
    },

    #[error("builder for {drv_path} failed to produce output {output:?}")]
    OutputMissing { drv_path: String, output: String },

    #[error("I/O failure: {0}")]
    IoFailed(String),

    #[error("operation canceled")]
    Canceled,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl DaemonError {
    /// JSON-RPC error code (server-defined range).
    pub fn rpc_code(&self) -> i64 {
        match self {
            DaemonError::NotFound(_) => -32000,
            DaemonError::InvalidInput(_) => -32602,
            DaemonError::Conflict(_) => -32001,
            DaemonError::BuilderFailed { .. } => -32002,
            DaemonError::HashMismatch { .. } => -32003,
            DaemonError::OutputMissing { .. } => -32002,
            DaemonError::IoFailed(_) => -32004,
            DaemonError::Canceled => -32005,
            DaemonError::PermissionDenied(_) => -32006,
            DaemonError::Unsupported(_) => -32007,
        }
    }

    pub fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        DaemonError::IoFailed(format!("{context}: {err}"))
    }
}

impl From<std::io::Error> for DaemonError {
    fn from(err: std::io::Error) -> Self {
        DaemonError::IoFailed(err.to_string())
    }
}

impl From<StorePathError> for DaemonError {
    fn from(err: StorePathError) -> Self {
        DaemonError::InvalidInput(err.to_string())
    }
}

impl From<zb_store_db::Error> for DaemonError {
    fn from(err: zb_store_db::Error) -> Self {
        use zb_store_db::Error as DbError;
        match err {
            DbError::Conflict { path } => {
                DaemonError::Conflict(format!("object {path} already registered differently"))
            }
            DbError::StillReferenced { path, referrer } => {
                DaemonError::Conflict(format!("{path} is still referenced by {referrer}"))
            }
            DbError::MissingReference { referrer, referent } => DaemonError::InvalidInput(format!(
                "reference {referent} of {referrer} is not registered"
            )),
            DbError::NotFound(path) => DaemonError::NotFound(path),
            other => DaemonError::IoFailed(format!("database: {other}")),
        }
    }
}

impl From<zb_nar::RestoreError> for DaemonError {
    fn from(err: zb_nar::RestoreError) -> Self {
        match err {
            zb_nar::RestoreError::Io(e) => DaemonError::IoFailed(e.to_string()),
            other => DaemonError::InvalidInput(format!("archive: {other}")),
        }
    }
}

impl From<zb_nar::export::ExportError> for DaemonError {
    fn from(err: zb_nar::export::ExportError) -> Self {
        match err {
            zb_nar::export::ExportError::Io(e) => DaemonError::IoFailed(e.to_string()),
            other => DaemonError::InvalidInput(format!("export stream: {other}")),
        }
    }
}
