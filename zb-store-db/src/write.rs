// SPDX-License-Identifier: MIT

//! Write operations: object registration, deletion, realizations.

use std::collections::BTreeSet;
use std::time::SystemTime;

use rusqlite::{OptionalExtension as _, params};

use crate::connection::StoreDb;
use crate::error::{Error, Result};

/// Parameters for registering a store object.
#[derive(Debug, Clone)]
pub struct RegisterObjectParams {
    /// Full store path.
    pub path: String,
    /// `sha256:<base32>` over the canonical archive serialization.
    pub nar_hash: String,
    /// Byte length of that serialization.
    pub nar_size: u64,
    /// Content-address fingerprint, absent for input-addressed objects.
    pub ca: Option<String>,
    /// Full store paths this object references (may include itself).
    pub references: BTreeSet<String>,
    pub registration_time: SystemTime,
}

impl Default for RegisterObjectParams {
    fn default() -> Self {
        Self {
            path: String::new(),
            nar_hash: String::new(),
            nar_size: 0,
            ca: None,
            references: BTreeSet::new(),
            registration_time: SystemTime::now(),
        }
    }
}

/// A realization row to insert.
#[derive(Debug, Clone)]
pub struct RealisationParams {
    pub drv_path: String,
    pub output_name: String,
    pub output_path: String,
    /// Key id of the signer; `None` for unsigned records (trust-all).
    pub signer: Option<String>,
    /// `keyId:base64` signature string.
    pub signature: Option<String>,
    /// Canonical `drv!out=path` dependency lines, newline-joined.
    pub dependencies: String,
}

fn unix_time(t: SystemTime) -> i64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl StoreDb {
    /// Register a store object together with its references, atomically.
    ///
    /// Re-registering an identical object is a no-op. Registering the
    /// same path with conflicting metadata fails with [`Error::Conflict`]
    /// and keeps the existing row (first writer wins).
    pub fn register_object(&mut self, p: &RegisterObjectParams) -> Result<i64> {
        let tx = self.conn.transaction()?;

        let existing: Option<(i64, String, i64, Option<String>)> = tx
            .query_row(
                "SELECT id, narHash, narSize, ca FROM Objects WHERE path = ?1",
                params![p.path],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        if let Some((id, nar_hash, nar_size, ca)) = existing {
            let existing_refs: BTreeSet<String> = {
                let mut stmt = tx.prepare(
                    "SELECT o.path FROM Refs r JOIN Objects o ON o.id = r.reference
                     WHERE r.referrer = ?1",
                )?;
                let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            if nar_hash == p.nar_hash
                && nar_size as u64 == p.nar_size
                && ca == p.ca
                && existing_refs == p.references
            {
                return Ok(id);
            }
            return Err(Error::Conflict {
                path: p.path.clone(),
            });
        }

        tx.execute(
            r#"
            INSERT INTO Objects (path, narHash, narSize, ca, registrationTime)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                p.path,
                p.nar_hash,
                p.nar_size as i64,
                p.ca,
                unix_time(p.registration_time),
            ],
        )?;
        let id = tx.last_insert_rowid();

        for reference in &p.references {
            let ref_id: i64 = if reference == &p.path {
                id
            } else {
                tx.query_row(
                    "SELECT id FROM Objects WHERE path = ?1",
                    params![reference],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| Error::MissingReference {
                    referrer: p.path.clone(),
                    referent: reference.clone(),
                })?
            };
            tx.execute(
                "INSERT OR REPLACE INTO Refs (referrer, reference) VALUES (?1, ?2)",
                params![id, ref_id],
            )?;
        }

        tx.commit()?;
        Ok(id)
    }

    /// Delete objects from the database, returning every path actually
    /// removed (so the filesystem layer can unlink them afterwards).
    ///
    /// Without `recursive`, deletion fails if any object outside the
    /// requested set still references one of them. With `recursive`, the
    /// referrer closure is removed too.
    pub fn delete_objects(&mut self, paths: &[String], recursive: bool) -> Result<Vec<String>> {
        let tx = self.conn.transaction()?;

        let mut to_delete: BTreeSet<String> = paths.iter().cloned().collect();

        if recursive {
            // Expand with the transitive referrer closure.
            let mut frontier: Vec<String> = to_delete.iter().cloned().collect();
            while let Some(path) = frontier.pop() {
                let referrers: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT o2.path FROM Objects o1
                         JOIN Refs r ON r.reference = o1.id
                         JOIN Objects o2 ON o2.id = r.referrer
                         WHERE o1.path = ?1",
                    )?;
                    let rows = stmt.query_map(params![path], |row| row.get::<_, String>(0))?;
                    rows.collect::<rusqlite::Result<_>>()?
                };
                for referrer in referrers {
                    if to_delete.insert(referrer.clone()) {
                        frontier.push(referrer);
                    }
                }
            }
        } else {
            for path in &to_delete {
                let referrers: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT o2.path FROM Objects o1
                         JOIN Refs r ON r.reference = o1.id
                         JOIN Objects o2 ON o2.id = r.referrer
                         WHERE o1.path = ?1 AND o2.path <> o1.path",
                    )?;
                    let rows = stmt.query_map(params![path], |row| row.get::<_, String>(0))?;
                    rows.collect::<rusqlite::Result<_>>()?
                };
                if let Some(referrer) = referrers.into_iter().find(|r| !to_delete.contains(r)) {
                    return Err(Error::StillReferenced {
                        path: path.clone(),
                        referrer,
                    });
                }
            }
        }

        // Remove refs among the doomed set first so the on-delete
        // restrict constraint cannot trip.
        let mut deleted = Vec::new();
        for path in &to_delete {
            tx.execute(
                "DELETE FROM Refs WHERE referrer IN (SELECT id FROM Objects WHERE path = ?1)
                   OR reference IN (SELECT id FROM Objects WHERE path = ?1)",
                params![path],
            )?;
        }
        for path in &to_delete {
            let n = tx.execute("DELETE FROM Objects WHERE path = ?1", params![path])?;
            if n > 0 {
                deleted.push(path.clone());
            }
        }

        tx.commit()?;
        Ok(deleted)
    }

    /// Insert a realization record. Re-inserting an identical record is
    /// a no-op; a conflicting record for the same `(drv, output, signer)`
    /// fails with [`Error::Conflict`].
    pub fn register_realisation(&mut self, p: &RealisationParams) -> Result<()> {
        let tx = self.conn.transaction()?;

        let existing: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT outputPath, signature FROM Realisations
                 WHERE drvPath = ?1 AND outputName = ?2 AND coalesce(signer, '') = ?3",
                params![p.drv_path, p.output_name, p.signer.clone().unwrap_or_default()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((output_path, signature)) = existing {
            if output_path == p.output_path && signature == p.signature {
                return Ok(());
            }
            return Err(Error::Conflict {
                path: format!("{}!{}", p.drv_path, p.output_name),
            });
        }

        tx.execute(
            r#"
            INSERT INTO Realisations (drvPath, outputName, outputPath, signer, signature, dependencies)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                p.drv_path,
                p.output_name,
                p.output_path,
                p.signer,
                p.signature,
                p.dependencies,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }
}
