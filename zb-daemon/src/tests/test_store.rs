// SPDX-License-Identifier: MIT

//! Test helper providing a self-contained store backed by an in-memory
//! database and a temporary directory on disk. Builders run as plain
//! processes via `/bin/sh`; no external tooling is required.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::scheduler::Realizer;
use crate::store_fs::{StoreFs, canonicalize_tree};
use zb_store_core::content_address::text_path;
use zb_store_core::derivation::{Derivation, OutputSpec};
use zb_store_core::store_path::StoreDir;
use zb_store_core::StorePath;
use zb_store_db::{BuildRow, Db, RegisterObjectParams};

pub struct TestStore {
    pub fs: StoreFs,
    pub realizer: Realizer,
    pub store_dir: StoreDir,
    temp_dir: tempfile::TempDir,
}

impl TestStore {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        // Canonicalize so paths match after macOS /tmp symlinking.
        let temp_dir = tempfile::TempDir::new().expect("temp dir");
        let root = temp_dir.path().canonicalize().expect("canonical temp dir");

        let store_path = root.join("store");
        std::fs::create_dir_all(&store_path).expect("store dir");

        let store_dir =
            StoreDir::new(store_path.to_string_lossy().into_owned()).expect("store dir path");

        let mut config = Config::default();
        config.store_directory = store_dir.clone();
        config.var_directory = root.join("var");
        config.max_build_jobs = 4;
        tweak(&mut config);

        let db = Db::open_memory().expect("in-memory db");
        let fs = StoreFs::new(store_dir.clone(), db);
        let realizer = Realizer::new(fs.clone(), &config).expect("realizer");

        Self {
            fs,
            realizer,
            store_dir,
            temp_dir,
        }
    }

    /// A scratch path outside the store, for builder side effects.
    pub fn scratch_file(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Register a literal file as a source object.
    pub async fn add_source(&self, name: &str, contents: &[u8]) -> StorePath {
        let path = text_path(&self.store_dir, name, contents, []).expect("source path");
        let abs = PathBuf::from(self.store_dir.display_path(&path));
        std::fs::write(&abs, contents).expect("write source");
        canonicalize_tree(&abs).expect("canonicalize source");

        let (nar_hash, nar_size) = zb_nar::nar_hash(&abs).await.expect("hash source");
        self.fs
            .register_object(RegisterObjectParams {
                path: self.store_dir.display_path(&path),
                nar_hash: nar_hash.to_string(),
                nar_size,
                ca: None,
                references: Default::default(),
                registration_time: std::time::SystemTime::now(),
            })
            .await
            .expect("register source");
        path
    }

    /// Store a derivation at its computed path and register it.
    pub async fn add_derivation(&self, drv: &Derivation) -> StorePath {
        let drv_path = drv.derivation_path(&self.store_dir).expect("drv path");
        self.add_derivation_at(drv, &drv_path).await;
        drv_path
    }

    /// Store a derivation at an arbitrary path (for crafting graphs the
    /// frontend would never produce, like cycles).
    pub async fn add_derivation_at(&self, drv: &Derivation, drv_path: &StorePath) {
        let bytes = drv.marshal(&self.store_dir);
        let abs = PathBuf::from(self.store_dir.display_path(drv_path));
        std::fs::write(&abs, &bytes).expect("write drv");
        canonicalize_tree(&abs).expect("canonicalize drv");

        let (nar_hash, nar_size) = zb_nar::nar_hash(&abs).await.expect("hash drv");
        self.fs
            .register_object(RegisterObjectParams {
                path: self.store_dir.display_path(drv_path),
                nar_hash: nar_hash.to_string(),
                nar_size,
                ca: None,
                references: Default::default(),
                registration_time: std::time::SystemTime::now(),
            })
            .await
            .expect("register drv");
    }

    /// Poll until the build reaches a terminal state.
    pub async fn wait_build(&self, build_id: &str) -> BuildRow {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
        loop {
            let row = {
                let id = build_id.to_string();
                self.fs
                    .db()
                    .read(move |db| db.get_build(&id))
                    .await
                    .expect("get build")
                    .expect("build row exists")
            };
            if row.status != "active" {
                return row;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "build {build_id} did not finish in time"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn read_full_log(&self, build_id: &str, drv_path: &StorePath) -> String {
        let id = build_id.to_string();
        let drv = self.store_dir.display_path(drv_path);
        let chunk = self
            .fs
            .db()
            .read(move |db| db.read_log(&id, &drv, 0, None))
            .await
            .expect("read log");
        String::from_utf8_lossy(&chunk.payload).into_owned()
    }
}

/// A derivation running `/bin/sh -c <script>` with one input-addressed
/// `out` output.
pub fn sh_derivation(name: &str, script: &str) -> Derivation {
    let mut drv = Derivation {
        name: name.into(),
        system: "x86_64-linux".into(),
        builder: "/bin/sh".into(),
        args: vec!["-c".into(), script.into()],
        ..Default::default()
    };
    drv.outputs.insert("out".into(), OutputSpec::InputAddressed);
    drv
}
