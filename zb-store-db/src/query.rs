// SPDX-License-Identifier: MIT

//! Read-side queries.

use std::collections::BTreeSet;

use rusqlite::{OptionalExtension as _, params};

use crate::connection::StoreDb;
use crate::error::Result;

/// The object-info record for a registered store object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub path: String,
    pub nar_hash: String,
    pub nar_size: u64,
    pub ca: Option<String>,
    pub references: BTreeSet<String>,
    pub registration_time: i64,
}

/// A stored realization record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealisationRow {
    pub drv_path: String,
    pub output_name: String,
    pub output_path: String,
    pub signer: Option<String>,
    pub signature: Option<String>,
    pub dependencies: String,
}

impl StoreDb {
    /// Whether `path` has an object-info row.
    pub fn object_exists(&self, path: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM Objects WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Full object info, or `None` if unregistered.
    pub fn query_object(&self, path: &str) -> Result<Option<ObjectInfo>> {
        let row: Option<(i64, String, i64, Option<String>, i64)> = self
            .conn
            .query_row(
                "SELECT id, narHash, narSize, ca, registrationTime
                 FROM Objects WHERE path = ?1",
                params![path],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, nar_hash, nar_size, ca, registration_time)) = row else {
            return Ok(None);
        };

        let references: BTreeSet<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT o.path FROM Refs r JOIN Objects o ON o.id = r.reference
                 WHERE r.referrer = ?1",
            )?;
            let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        Ok(Some(ObjectInfo {
            path: path.to_string(),
            nar_hash,
            nar_size: nar_size as u64,
            ca,
            references,
            registration_time,
        }))
    }

    /// Paths that reference `path` (excluding itself).
    pub fn referrers(&self, path: &str) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT o2.path FROM Objects o1
             JOIN Refs r ON r.reference = o1.id
             JOIN Objects o2 ON o2.id = r.referrer
             WHERE o1.path = ?1 AND o2.path <> o1.path",
        )?;
        let rows = stmt.query_map(params![path], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// The transitive reference closure of `paths` (including them).
    pub fn reference_closure(&self, paths: &[String]) -> Result<Vec<String>> {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut order: Vec<String> = Vec::new();
        let mut stack: Vec<String> = paths.to_vec();

        while let Some(path) = stack.pop() {
            if !seen.insert(path.clone()) {
                continue;
            }
            if let Some(info) = self.query_object(&path)? {
                for reference in &info.references {
                    if reference != &path {
                        stack.push(reference.clone());
                    }
                }
            }
            order.push(path);
        }

        Ok(order)
    }

    /// Realization records whose realized path is `path` (for export
    /// signature lookup).
    pub fn realisations_for_path(&self, path: &str) -> Result<Vec<RealisationRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT drvPath, outputName, outputPath, signer, signature, dependencies
             FROM Realisations WHERE outputPath = ?1",
        )?;
        let rows = stmt.query_map(params![path], |row| {
            Ok(RealisationRow {
                drv_path: row.get(0)?,
                output_name: row.get(1)?,
                output_path: row.get(2)?,
                signer: row.get(3)?,
                signature: row.get(4)?,
                dependencies: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// All realization records for `(drv, output)`, any signer.
    pub fn query_realisations(&self, drv_path: &str, output_name: &str) -> Result<Vec<RealisationRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT drvPath, outputName, outputPath, signer, signature, dependencies
             FROM Realisations WHERE drvPath = ?1 AND outputName = ?2",
        )?;
        let rows = stmt.query_map(params![drv_path, output_name], |row| {
            Ok(RealisationRow {
                drv_path: row.get(0)?,
                output_name: row.get(1)?,
                output_path: row.get(2)?,
                signer: row.get(3)?,
                signature: row.get(4)?,
                dependencies: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write::RegisterObjectParams;

    fn register(db: &mut StoreDb, path: &str, refs: &[&str]) {
        db.register_object(&RegisterObjectParams {
            path: path.to_string(),
            nar_hash: "sha256:0000000000000000000000000000000000000000000000000000".into(),
            nar_size: 1,
            references: refs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
        .unwrap();
    }

    #[test]
    fn closure_walks_references() {
        let mut db = StoreDb::open_memory().unwrap();
        register(&mut db, "/zb/store/aaa-a", &[]);
        register(&mut db, "/zb/store/bbb-b", &["/zb/store/aaa-a"]);
        register(&mut db, "/zb/store/ccc-c", &["/zb/store/bbb-b", "/zb/store/ccc-c"]);

        let closure = db.reference_closure(&["/zb/store/ccc-c".into()]).unwrap();
        assert_eq!(3, closure.len());
        assert!(closure.contains(&"/zb/store/aaa-a".to_string()));
    }

    #[test]
    fn referrers_excludes_self() {
        let mut db = StoreDb::open_memory().unwrap();
        register(&mut db, "/zb/store/aaa-a", &["/zb/store/aaa-a"]);
        register(&mut db, "/zb/store/bbb-b", &["/zb/store/aaa-a"]);

        let refs = db.referrers("/zb/store/aaa-a").unwrap();
        assert_eq!(
            BTreeSet::from(["/zb/store/bbb-b".to_string()]),
            refs
        );
    }
}
