// SPDX-License-Identifier: MIT

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database not found at {0}")]
    DatabaseNotFound(PathBuf),

    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("object {path} is already registered with different metadata")]
    Conflict { path: String },

    #[error("reference {referent} of {referrer} is not registered")]
    MissingReference { referrer: String, referent: String },

    #[error("cannot delete {path}: still referenced by {referrer}")]
    StillReferenced { path: String, referrer: String },

    #[error("object {0} is not registered")]
    NotFound(String),

    #[error("database pool is closed")]
    PoolClosed,

    #[error("blocking task failed: {0}")]
    TaskJoin(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}
