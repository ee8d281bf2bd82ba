// SPDX-License-Identifier: MIT

//! The store filesystem layer: atomic import/export of objects, presence
//! checks, deletion, and read-only canonicalization.
//!
//! The database is the source of truth: an object "exists" iff its
//! object-info row exists. Disk trees without a row are orphans from a
//! crash and are swept when a delete next touches their path.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::error::{DaemonError, Result};
use zb_nar::export::{ExportReader, ExportTrailer, ExportWriter};
use zb_nar::{HashingReader, dump, restore};
use zb_store_core::{Hash, StoreDir, StorePath};
use zb_store_db::{Db, ObjectInfo, RegisterObjectParams};

/// Store objects are read-only once registered: 0444 for files (0555
/// with the executable bit), 0555 for directories.
const FILE_MODE: u32 = 0o444;
const EXEC_MODE: u32 = 0o555;
const DIR_MODE: u32 = 0o555;

/// Canonical mtime for everything under a store path.
const CANONICAL_MTIME: i64 = 1;

#[derive(Clone)]
pub struct StoreFs {
    store_dir: StoreDir,
    db: Db,
}

impl StoreFs {
    pub fn new(store_dir: StoreDir, db: Db) -> Self {
        Self { store_dir, db }
    }

    pub fn store_dir(&self) -> &StoreDir {
        &self.store_dir
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Create the store directory if missing.
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.store_dir.as_path())
            .await
            .map_err(|e| DaemonError::io("creating store directory", e))?;
        Ok(())
    }

    /// Whether `path` is present: its row exists. (The §3 invariant ties
    /// rows to on-disk trees; rows are what the engine trusts.)
    pub async fn exists(&self, path: &StorePath) -> Result<bool> {
        let abs = self.store_dir.display_path(path);
        Ok(self.db.read(move |db| db.object_exists(&abs)).await?)
    }

    pub async fn object_info(&self, path: &StorePath) -> Result<Option<ObjectInfo>> {
        let abs = self.store_dir.display_path(path);
        Ok(self.db.read(move |db| db.query_object(&abs)).await?)
    }

    /// Register object info for a tree already at its final location.
    pub async fn register_object(&self, params: RegisterObjectParams) -> Result<()> {
        self.db.write(move |db| db.register_object(&params)).await?;
        Ok(())
    }

    /// Restore an archive from `reader` into a temporary directory under
    /// the store, hashing while streaming.
    pub async fn restore_to_temp<R>(&self, reader: &mut R) -> Result<(tempfile::TempDir, Hash, u64)>
    where
        R: AsyncRead + Unpin + Send,
    {
        let tmp = tempfile::Builder::new()
            .prefix(".zb-import-")
            .tempdir_in(self.store_dir.as_path())
            .map_err(|e| DaemonError::io("creating import scratch", e))?;

        let mut hashing = HashingReader::new(reader);
        let obj = tmp.path().join("obj");
        restore(&mut hashing, &obj).await?;
        let (hash, size) = hashing.finish();

        Ok((tmp, hash, size))
    }

    /// Move a restored tree to its final store path and register it.
    ///
    /// If an identical object is already registered the tree is
    /// discarded. A leftover on-disk tree without a row (crash debris)
    /// is replaced.
    pub async fn finalize_object(
        &self,
        tmp: tempfile::TempDir,
        path: &StorePath,
        nar_hash: &Hash,
        nar_size: u64,
        ca: Option<String>,
        references: BTreeSet<String>,
    ) -> Result<()> {
        let abs = self.store_dir.display_path(path);

        if let Some(existing) = self.object_info(path).await? {
            if existing.nar_hash == format!("{nar_hash}") {
                debug!(path = %abs, "object already present, discarding import");
                return Ok(());
            }
            return Err(DaemonError::Conflict(format!(
                "{abs} already registered with a different archive hash"
            )));
        }

        let obj = tmp.path().join("obj");
        let final_path = PathBuf::from(&abs);

        {
            let obj = obj.clone();
            let final_path = final_path.clone();
            tokio::task::spawn_blocking(move || -> io::Result<()> {
                canonicalize_tree(&obj)?;
                fsync_tree(&obj)?;
                // Sweep crash debris occupying the final location.
                if final_path.symlink_metadata().is_ok() {
                    remove_tree(&final_path)?;
                }
                std::fs::rename(&obj, &final_path)?;
                // Make the rename durable.
                std::fs::File::open(final_path.parent().expect("store paths have parents"))
                    .and_then(|d| d.sync_all())
            })
            .await
            .map_err(|e| DaemonError::IoFailed(e.to_string()))?
            .map_err(|e| DaemonError::io(format!("materializing {abs}"), e))?;
        }

        let register = self
            .register_object(RegisterObjectParams {
                path: abs.clone(),
                nar_hash: format!("{nar_hash}"),
                nar_size,
                ca,
                references,
                registration_time: SystemTime::now(),
            })
            .await;

        if let Err(e) = register {
            // The row is authoritative; without it the tree must go.
            let final_path = final_path.clone();
            let _ = tokio::task::spawn_blocking(move || remove_tree(&final_path)).await;
            return Err(e);
        }

        Ok(())
    }

    /// Materialize a single regular file (a flat content-addressed
    /// output) at its final store path and register it.
    pub async fn add_flat_file(
        &self,
        source: &Path,
        executable: bool,
        path: &StorePath,
        ca: Option<String>,
        references: BTreeSet<String>,
    ) -> Result<()> {
        let tmp = tempfile::Builder::new()
            .prefix(".zb-import-")
            .tempdir_in(self.store_dir.as_path())
            .map_err(|e| DaemonError::io("creating import scratch", e))?;
        let obj = tmp.path().join("obj");

        {
            use std::os::unix::fs::PermissionsExt as _;
            let source = source.to_path_buf();
            let obj = obj.clone();
            tokio::task::spawn_blocking(move || -> io::Result<()> {
                std::fs::copy(&source, &obj)?;
                let mode = if executable { 0o555 } else { 0o444 };
                std::fs::set_permissions(&obj, std::fs::Permissions::from_mode(mode))
            })
            .await
            .map_err(|e| DaemonError::IoFailed(e.to_string()))?
            .map_err(|e| DaemonError::io("staging flat output", e))?;
        }

        let (nar_hash, nar_size) = zb_nar::nar_hash(&obj)
            .await
            .map_err(|e| DaemonError::io("hashing flat output", e))?;

        self.finalize_object(tmp, path, &nar_hash, nar_size, ca, references)
            .await
    }

    /// Import a framed export stream, registering every object it
    /// carries. Returns the imported paths in stream order.
    pub async fn import<R>(&self, reader: R) -> Result<Vec<String>>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut export = ExportReader::new(reader);
        let mut imported = Vec::new();

        while export.next_entry().await? {
            let (tmp, hash, size) = self.restore_to_temp(export.inner()).await?;
            let trailer = export.read_trailer().await?;

            let path = self
                .store_dir
                .parse_path(&trailer.path)
                .map_err(|e| DaemonError::InvalidInput(format!("import path: {e}")))?;
            for reference in &trailer.references {
                self.store_dir
                    .parse_path(reference)
                    .map_err(|e| DaemonError::InvalidInput(format!("import reference: {e}")))?;
            }

            self.finalize_object(
                tmp,
                &path,
                &hash,
                size,
                None,
                trailer.references.iter().cloned().collect(),
            )
            .await?;
            imported.push(trailer.path);
        }

        Ok(imported)
    }

    /// Export the given objects (optionally with their transitive
    /// reference closure), references before referrers.
    pub async fn export<W>(
        &self,
        paths: &[StorePath],
        include_references: bool,
        writer: W,
    ) -> Result<W>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let roots: Vec<String> = paths.iter().map(|p| self.store_dir.display_path(p)).collect();

        // Collect object info for everything we will send.
        let infos: BTreeMap<String, ObjectInfo> = {
            let roots = roots.clone();
            self.db
                .read(move |db| {
                    let mut infos = BTreeMap::new();
                    let all = if include_references {
                        db.reference_closure(&roots)?
                    } else {
                        roots.clone()
                    };
                    for path in all {
                        match db.query_object(&path)? {
                            Some(info) => {
                                infos.insert(path, info);
                            }
                            None => return Err(zb_store_db::Error::NotFound(path)),
                        }
                    }
                    Ok(infos)
                })
                .await
                .map_err(|e| match e {
                    zb_store_db::Error::NotFound(p) => DaemonError::NotFound(p),
                    other => other.into(),
                })?
        };

        // Order references first (post-order over the reference graph).
        let order = {
            let mut order: Vec<String> = Vec::new();
            let mut visited: BTreeSet<String> = BTreeSet::new();
            fn visit(
                path: &str,
                infos: &BTreeMap<String, ObjectInfo>,
                visited: &mut BTreeSet<String>,
                order: &mut Vec<String>,
            ) {
                if !visited.insert(path.to_string()) {
                    return;
                }
                if let Some(info) = infos.get(path) {
                    for reference in &info.references {
                        if reference != path {
                            visit(reference, infos, visited, order);
                        }
                    }
                    order.push(path.to_string());
                }
            }
            for root in &roots {
                visit(root, &infos, &mut visited, &mut order);
            }
            order
        };

        let mut export = ExportWriter::new(writer);
        for path in order {
            let info = &infos[&path];
            let signatures: Vec<String> = {
                let path = path.clone();
                self.db
                    .read(move |db| db.realisations_for_path(&path))
                    .await?
                    .into_iter()
                    .filter_map(|row| row.signature)
                    .collect()
            };

            export.begin_entry().await?;
            dump(Path::new(&path), export.inner())
                .await
                .map_err(|e| DaemonError::io(format!("exporting {path}"), e))?;
            export
                .finish_entry(&ExportTrailer {
                    path: path.clone(),
                    references: info.references.iter().cloned().collect(),
                    signatures,
                })
                .await?;
        }

        Ok(export.finish().await?)
    }

    /// Delete objects: database rows first, disk trees second. A crash
    /// in between leaves orphan trees which a later delete of the same
    /// path sweeps.
    pub async fn delete(&self, paths: &[StorePath], recursive: bool) -> Result<Vec<String>> {
        let abs: Vec<String> = paths.iter().map(|p| self.store_dir.display_path(p)).collect();

        let deleted = self
            .db
            .write(move |db| db.delete_objects(&abs, recursive))
            .await?;

        for path in &deleted {
            let path = PathBuf::from(path);
            let removed =
                tokio::task::spawn_blocking(move || remove_tree(&path)).await;
            match removed {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {}
                Ok(Err(e)) => warn!(error = %e, "failed to unlink deleted object"),
                Err(e) => warn!(error = %e, "unlink task failed"),
            }
        }

        Ok(deleted)
    }
}

/// Clear write bits, apply store modes, and reset timestamps over a
/// whole tree. Symlinks carry no independent metadata and are skipped.
pub fn canonicalize_tree(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_symlink() {
        return Ok(());
    }

    if meta.is_dir() {
        for entry in std::fs::read_dir(path)? {
            canonicalize_tree(&entry?.path())?;
        }
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(DIR_MODE))?;
    } else {
        let executable = meta.permissions().mode() & 0o111 != 0;
        let mode = if executable { EXEC_MODE } else { FILE_MODE };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }

    set_mtime(path, CANONICAL_MTIME)
}

/// Set atime/mtime without following symlinks, matching `utimensat`
/// with `AT_SYMLINK_NOFOLLOW`.
#[allow(unsafe_code)]
fn set_mtime(path: &Path, seconds: i64) -> io::Result<()> {
    use std::os::unix::ffi::OsStrExt as _;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let times = [
        libc::timespec {
            tv_sec: seconds,
            tv_nsec: 0,
        },
        libc::timespec {
            tv_sec: seconds,
            tv_nsec: 0,
        },
    ];
    // SAFETY: c_path is a valid NUL-terminated string and times is a
    // valid two-element array; AT_FDCWD resolves absolute paths as-is.
    let ret = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// fsync a file, or every file under a directory plus the directory.
fn fsync_tree(path: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_symlink() {
        return Ok(());
    }
    if meta.is_dir() {
        for entry in std::fs::read_dir(path)? {
            fsync_tree(&entry?.path())?;
        }
    }
    std::fs::File::open(path)?.sync_all()
}

/// Remove a read-only store tree: restore owner write bits on
/// directories first so unlinking can proceed.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if meta.is_dir() {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                remove_tree(&entry.path())?;
            } else {
                std::fs::remove_file(entry.path())?;
            }
        }
        std::fs::remove_dir(path)
    } else {
        std::fs::remove_file(path)
    }
}
