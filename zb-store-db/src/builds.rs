// SPDX-License-Identifier: MIT

//! Build bookkeeping: builds, per-derivation results, chunked logs.
//!
//! Logs are append-only blobs chunked so that range reads need not load
//! the whole log; the stored log is the authoritative copy (live
//! subscribers may observe drops, readers of the database never do).

use rusqlite::{OptionalExtension as _, params};

use crate::connection::StoreDb;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRow {
    pub id: String,
    /// `active`, `success`, `fail`, or `error`.
    pub status: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResultRow {
    pub build_id: String,
    pub drv_path: String,
    pub status: String,
    pub log_size: u64,
}

/// One range read out of a build log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub payload: Vec<u8>,
    /// Whether the read reached the current end of the log.
    pub eof: bool,
}

impl StoreDb {
    pub fn create_build(&self, id: &str, started_at: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO Builds (id, status, startedAt) VALUES (?1, 'active', ?2)",
            params![id, started_at],
        )?;
        Ok(())
    }

    pub fn set_build_status(&self, id: &str, status: &str, finished_at: Option<i64>) -> Result<()> {
        self.conn.execute(
            "UPDATE Builds SET status = ?2, finishedAt = ?3 WHERE id = ?1",
            params![id, status, finished_at],
        )?;
        Ok(())
    }

    pub fn get_build(&self, id: &str) -> Result<Option<BuildRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, status, startedAt, finishedAt FROM Builds WHERE id = ?1",
                params![id],
                |row| {
                    Ok(BuildRow {
                        id: row.get(0)?,
                        status: row.get(1)?,
                        started_at: row.get(2)?,
                        finished_at: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn upsert_build_result(&self, build_id: &str, drv_path: &str, status: &str) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO BuildResults (buildId, drvPath, status) VALUES (?1, ?2, ?3)
            ON CONFLICT (buildId, drvPath) DO UPDATE SET status = excluded.status
            "#,
            params![build_id, drv_path, status],
        )?;
        Ok(())
    }

    pub fn get_build_result(&self, build_id: &str, drv_path: &str) -> Result<Option<BuildResultRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT buildId, drvPath, status, logSize FROM BuildResults
                 WHERE buildId = ?1 AND drvPath = ?2",
                params![build_id, drv_path],
                |row| {
                    Ok(BuildResultRow {
                        build_id: row.get(0)?,
                        drv_path: row.get(1)?,
                        status: row.get(2)?,
                        log_size: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?)
    }

    pub fn build_results(&self, build_id: &str) -> Result<Vec<BuildResultRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT buildId, drvPath, status, logSize FROM BuildResults
             WHERE buildId = ?1 ORDER BY drvPath",
        )?;
        let rows = stmt.query_map(params![build_id], |row| {
            Ok(BuildResultRow {
                build_id: row.get(0)?,
                drv_path: row.get(1)?,
                status: row.get(2)?,
                log_size: row.get::<_, i64>(3)? as u64,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Append one log chunk and bump the result row's log size.
    pub fn append_log_chunk(&mut self, build_id: &str, drv_path: &str, data: &[u8]) -> Result<()> {
        let tx = self.conn.transaction()?;

        let next_chunk: i64 = tx
            .query_row(
                "SELECT coalesce(max(chunkId) + 1, 0) FROM BuildLogs
                 WHERE buildId = ?1 AND drvPath = ?2",
                params![build_id, drv_path],
                |row| row.get(0),
            )?;

        tx.execute(
            "INSERT INTO BuildLogs (buildId, drvPath, chunkId, data) VALUES (?1, ?2, ?3, ?4)",
            params![build_id, drv_path, next_chunk, data],
        )?;
        tx.execute(
            r#"
            INSERT INTO BuildResults (buildId, drvPath, status, logSize)
            VALUES (?1, ?2, 'active', ?3)
            ON CONFLICT (buildId, drvPath)
            DO UPDATE SET logSize = logSize + excluded.logSize
            "#,
            params![build_id, drv_path, data.len() as i64],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Read `[range_start, range_end)` of a build log (end-exclusive,
    /// `None` meaning "to the current end").
    pub fn read_log(
        &self,
        build_id: &str,
        drv_path: &str,
        range_start: u64,
        range_end: Option<u64>,
    ) -> Result<LogChunk> {
        let mut stmt = self.conn.prepare(
            "SELECT data FROM BuildLogs WHERE buildId = ?1 AND drvPath = ?2 ORDER BY chunkId",
        )?;
        let chunks = stmt.query_map(params![build_id, drv_path], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;

        let mut payload = Vec::new();
        let mut offset: u64 = 0;
        let mut total: u64 = 0;

        for chunk in chunks {
            let chunk = chunk?;
            let chunk_start = offset;
            let chunk_end = offset + chunk.len() as u64;
            offset = chunk_end;
            total = chunk_end;

            let want_start = range_start.max(chunk_start);
            let want_end = range_end.unwrap_or(u64::MAX).min(chunk_end);
            if want_start < want_end {
                let lo = (want_start - chunk_start) as usize;
                let hi = (want_end - chunk_start) as usize;
                payload.extend_from_slice(&chunk[lo..hi]);
            }
        }

        let eof = match range_end {
            Some(end) => end >= total,
            None => true,
        };
        Ok(LogChunk { payload, eof })
    }

    /// The `n` most recent build ids, newest first.
    pub fn recent_build_ids(&self, n: usize) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM Builds ORDER BY startedAt DESC, id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![n as i64], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Drop log chunks of builds finished before `cutoff` (retention).
    pub fn prune_logs_before(&self, cutoff: i64) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM BuildLogs WHERE buildId IN
               (SELECT id FROM Builds WHERE finishedAt IS NOT NULL AND finishedAt < ?1)",
            params![cutoff],
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_lifecycle() {
        let db = StoreDb::open_memory().unwrap();
        db.create_build("b1", 100).unwrap();

        let row = db.get_build("b1").unwrap().unwrap();
        assert_eq!("active", row.status);
        assert_eq!(None, row.finished_at);

        db.set_build_status("b1", "success", Some(200)).unwrap();
        let row = db.get_build("b1").unwrap().unwrap();
        assert_eq!("success", row.status);
        assert_eq!(Some(200), row.finished_at);

        assert!(db.get_build("nope").unwrap().is_none());
    }

    #[test]
    fn log_chunks_and_range_reads() {
        let mut db = StoreDb::open_memory().unwrap();
        db.create_build("b1", 100).unwrap();
        db.append_log_chunk("b1", "/zb/store/x.drv", b"hello ").unwrap();
        db.append_log_chunk("b1", "/zb/store/x.drv", b"world").unwrap();

        let all = db.read_log("b1", "/zb/store/x.drv", 0, None).unwrap();
        assert_eq!(b"hello world".to_vec(), all.payload);
        assert!(all.eof);

        let mid = db.read_log("b1", "/zb/store/x.drv", 3, Some(8)).unwrap();
        assert_eq!(b"lo wo".to_vec(), mid.payload);
        assert!(!mid.eof);

        let tail = db.read_log("b1", "/zb/store/x.drv", 6, Some(100)).unwrap();
        assert_eq!(b"world".to_vec(), tail.payload);
        assert!(tail.eof);

        let result = db.get_build_result("b1", "/zb/store/x.drv").unwrap().unwrap();
        assert_eq!(11, result.log_size);
    }

    #[test]
    fn recent_builds_newest_first() {
        let db = StoreDb::open_memory().unwrap();
        db.create_build("b1", 100).unwrap();
        db.create_build("b2", 200).unwrap();
        db.create_build("b3", 300).unwrap();

        assert_eq!(
            vec!["b3".to_string(), "b2".to_string()],
            db.recent_build_ids(2).unwrap()
        );
    }

    #[test]
    fn prune_drops_only_finished_logs() {
        let mut db = StoreDb::open_memory().unwrap();
        db.create_build("old", 10).unwrap();
        db.append_log_chunk("old", "/zb/store/a.drv", b"x").unwrap();
        db.set_build_status("old", "success", Some(20)).unwrap();

        db.create_build("live", 30).unwrap();
        db.append_log_chunk("live", "/zb/store/b.drv", b"y").unwrap();

        assert_eq!(1, db.prune_logs_before(25).unwrap());
        assert!(db.read_log("old", "/zb/store/a.drv", 0, None).unwrap().payload.is_empty());
        assert_eq!(
            b"y".to_vec(),
            db.read_log("live", "/zb/store/b.drv", 0, None).unwrap().payload
        );
    }
}
