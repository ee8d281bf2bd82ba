// SPDX-License-Identifier: MIT

//! Async connection pool over [`StoreDb`].
//!
//! Writes go through a writer lane of configurable size (default 1),
//! which serializes them; reads may use a separate lane of read-only
//! connections and proceed concurrently. Every database call runs on
//! the blocking pool. Read-your-writes holds because a write commits
//! before its connection returns to the lane.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use crate::connection::{OpenMode, StoreDb};
use crate::error::{Error, Result};

struct Lane {
    tx: mpsc::Sender<StoreDb>,
    rx: Mutex<mpsc::Receiver<StoreDb>>,
}

impl Lane {
    fn new(conns: Vec<StoreDb>) -> Self {
        let (tx, rx) = mpsc::channel(conns.len().max(1));
        for conn in conns {
            assert!(tx.try_send(conn).is_ok(), "fresh channel has capacity");
        }
        Lane {
            tx,
            rx: Mutex::new(rx),
        }
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreDb) -> Result<T> + Send + 'static,
    {
        let mut conn = {
            let mut rx = self.rx.lock().await;
            rx.recv().await.ok_or(Error::PoolClosed)?
        };

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut conn);
            (conn, result)
        })
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?;

        // Hand the connection back; if the pool is gone the connection
        // just closes.
        let _ = self.tx.send(conn).await;
        result
    }
}

/// A shared handle to the object-info database.
#[derive(Clone)]
pub struct Db {
    writers: Arc<Lane>,
    readers: Option<Arc<Lane>>,
}

impl Db {
    /// Open (creating if needed) the database at `path` with a writer
    /// lane of `writers` connections and `readers` read-only
    /// connections.
    pub fn open(path: &Path, writers: usize, readers: usize) -> Result<Self> {
        let writers = writers.max(1);

        let mut write_conns = Vec::with_capacity(writers);
        // The first connection creates the schema.
        write_conns.push(StoreDb::open(path, OpenMode::Create)?);
        for _ in 1..writers {
            write_conns.push(StoreDb::open(path, OpenMode::ReadWrite)?);
        }

        let reader_lane = if readers > 0 {
            let mut read_conns = Vec::with_capacity(readers);
            for _ in 0..readers {
                read_conns.push(StoreDb::open(path, OpenMode::ReadOnly)?);
            }
            Some(Arc::new(Lane::new(read_conns)))
        } else {
            None
        };

        Ok(Db {
            writers: Arc::new(Lane::new(write_conns)),
            readers: reader_lane,
        })
    }

    /// A single in-memory connection (tests). Reads share the writer
    /// lane, since in-memory databases are per-connection.
    pub fn open_memory() -> Result<Self> {
        Ok(Db {
            writers: Arc::new(Lane::new(vec![StoreDb::open_memory()?])),
            readers: None,
        })
    }

    /// Run a write (or read-modify-write) against the writer lane.
    pub async fn write<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreDb) -> Result<T> + Send + 'static,
    {
        self.writers.run(f).await
    }

    /// Run a read-only query; uses the reader lane when configured.
    pub async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreDb) -> Result<T> + Send + 'static,
    {
        match &self.readers {
            Some(lane) => lane.run(f).await,
            None => self.writers.run(f).await,
        }
    }
}
