// SPDX-License-Identifier: MIT

//! The realization scheduler.
//!
//! Given a set of derivation paths, produce a terminal build record per
//! derivation: each either ends with all declared outputs realized and
//! registered, or is reported failed with a captured log.
//!
//! The closure is loaded and cycle-checked up front, then driven in
//! reverse-topological waves. A process-wide in-flight table keyed by
//! derivation path coalesces duplicate work: concurrent requests for
//! the same derivation attach to the first runner and observe its
//! outcome, so at most one builder runs per derivation path.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use tokio::sync::{Mutex, Semaphore, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::build::{self, BuildContext, BuildSettings};
use crate::config::Config;
use crate::error::{DaemonError, Result};
use crate::sandbox::ProcessSandbox;
use crate::store_fs::StoreFs;
use zb_store_core::derivation::Derivation;
use zb_store_core::realisation::{DrvOutput, Realisation};
use zb_store_core::signature::{KeyedSignature, SigningKey, VerifyingKey};
use zb_store_core::{StoreDir, StorePath};

/// Capacity of each build's log fan-out channel; slow subscribers drop
/// slices and see a discontinuity (the stored log stays authoritative).
const LOG_CHANNEL_CAPACITY: usize = 256;

/// Terminal and non-terminal build states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Active,
    Success,
    Fail,
    Error,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Active => "active",
            BuildStatus::Success => "success",
            BuildStatus::Fail => "fail",
            BuildStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Active)
    }
}

/// Terminal result of one derivation within a build.
#[derive(Debug, Clone)]
pub struct DrvResult {
    pub status: BuildStatus,
    pub outputs: BTreeMap<String, StorePath>,
    pub message: String,
}

impl DrvResult {
    fn success(outputs: BTreeMap<String, StorePath>) -> Self {
        DrvResult {
            status: BuildStatus::Success,
            outputs,
            message: String::new(),
        }
    }
}

/// Incremental builder output fanned out to subscribers.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub drv_path: String,
    pub payload: Bytes,
}

/// Writes builder output to the database log and the live channel.
#[derive(Clone)]
pub struct LogSink {
    db: zb_store_db::Db,
    build_id: String,
    drv_path: String,
    tx: broadcast::Sender<LogEvent>,
}

impl LogSink {
    pub async fn append(&self, bytes: &[u8]) {
        let chunk = bytes.to_vec();
        let build_id = self.build_id.clone();
        let drv_path = self.drv_path.clone();
        if let Err(e) = self
            .db
            .write(move |db| db.append_log_chunk(&build_id, &drv_path, &chunk))
            .await
        {
            warn!(error = %e, "failed to persist build log chunk");
        }

        let _ = self.tx.send(LogEvent {
            drv_path: self.drv_path.clone(),
            payload: Bytes::copy_from_slice(bytes),
        });
    }
}

struct BuildHandle {
    cancel: CancellationToken,
    log_tx: broadcast::Sender<LogEvent>,
}

struct Inner {
    fs: StoreFs,
    sandbox: ProcessSandbox,
    default_settings: BuildSettings,
    signing_key: Option<SigningKey>,
    trusted_keys: Vec<VerifyingKey>,
    trust_all: bool,
    jobs: Arc<Semaphore>,
    /// De-dup table: derivation path → outcome channel of the build
    /// currently realizing it.
    in_flight: Mutex<HashMap<StorePath, watch::Receiver<Option<DrvResult>>>>,
    builds: Mutex<HashMap<String, Arc<BuildHandle>>>,
    next_build_id: AtomicU64,
}

/// The shared realization service.
#[derive(Clone)]
pub struct Realizer {
    inner: Arc<Inner>,
}

impl Realizer {
    pub fn new(fs: StoreFs, config: &Config) -> Result<Self> {
        let default_settings = BuildSettings {
            keep_failed: config.keep_failed,
            timeout: config.build_timeout_secs.map(std::time::Duration::from_secs),
            max_silent: config.max_silent_secs.map(std::time::Duration::from_secs),
            build_root: config.build_root(),
            allow_environment: config.allow_environment.clone(),
        };

        Ok(Realizer {
            inner: Arc::new(Inner {
                fs,
                sandbox: ProcessSandbox::new(),
                default_settings,
                signing_key: config.load_signing_key()?,
                trusted_keys: config.trusted_keys()?,
                trust_all: config.is_trust_all(),
                jobs: Arc::new(Semaphore::new(config.max_build_jobs)),
                in_flight: Mutex::new(HashMap::new()),
                builds: Mutex::new(HashMap::new()),
                next_build_id: AtomicU64::new(0),
            }),
        })
    }

    /// Start realizing the given derivations. Returns immediately with
    /// the build id; clients poll `getBuild` for the terminal state.
    #[instrument(skip(self))]
    pub async fn realize(&self, drv_paths: Vec<StorePath>, keep_failed: bool) -> Result<String> {
        if drv_paths.is_empty() {
            return Err(DaemonError::InvalidInput("no derivations requested".into()));
        }
        for p in &drv_paths {
            if !p.is_derivation() {
                return Err(DaemonError::InvalidInput(format!(
                    "{p} is not a derivation path"
                )));
            }
        }

        let (build_id, handle) = self.new_build().await?;
        let inner = self.inner.clone();
        let id = build_id.clone();
        tokio::spawn(async move {
            drive_build(inner, id, handle, drv_paths, keep_failed).await;
        });

        Ok(build_id)
    }

    /// Prepare a derivation's environment and scratch directory without
    /// running the builder; the rendered environment becomes the
    /// build's log.
    #[instrument(skip(self))]
    pub async fn expand(&self, drv_path: StorePath, temp_dir: PathBuf) -> Result<String> {
        let (build_id, handle) = self.new_build().await?;
        let inner = self.inner.clone();
        let id = build_id.clone();
        tokio::spawn(async move {
            let status = match expand_one(&inner, &id, &handle, &drv_path, &temp_dir).await {
                Ok(()) => BuildStatus::Success,
                Err(e) => {
                    warn!(error = %e, "expand failed");
                    let sink = LogSink {
                        db: inner.fs.db().clone(),
                        build_id: id.clone(),
                        drv_path: inner.fs.store_dir().display_path(&drv_path),
                        tx: handle.log_tx.clone(),
                    };
                    sink.append(format!("error: {e}\n").as_bytes()).await;
                    BuildStatus::Error
                }
            };
            finish_build(&inner, &id, status).await;
        });

        Ok(build_id)
    }

    /// Cancel one build's in-flight work. Waiters observe an `error`
    /// terminal state with reason "interrupted".
    pub async fn cancel_build(&self, build_id: &str) -> bool {
        let builds = self.inner.builds.lock().await;
        match builds.get(build_id) {
            Some(handle) => {
                info!(build_id, "canceling build");
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Subscribe to a build's live log events, if it is still running.
    pub async fn subscribe(&self, build_id: &str) -> Option<broadcast::Receiver<LogEvent>> {
        let builds = self.inner.builds.lock().await;
        builds.get(build_id).map(|h| h.log_tx.subscribe())
    }

    /// Per-output status of a derivation, for build result reporting:
    /// `(output name, realized path if known, valid)`.
    pub async fn output_status(
        &self,
        drv_path: &StorePath,
    ) -> Result<Vec<(String, Option<StorePath>, bool)>> {
        let store_dir = self.inner.fs.store_dir().clone();
        let drv = load_derivation(&self.inner, drv_path).await?;

        let mut out = Vec::with_capacity(drv.outputs.len());
        for output_name in drv.outputs.keys() {
            let path = match drv
                .output_path(&store_dir, output_name)
                .map_err(|e| DaemonError::InvalidInput(e.to_string()))?
            {
                Some(path) => Some(path),
                None => lookup_realisation(&self.inner, drv_path, output_name).await?,
            };
            let valid = match &path {
                Some(path) => self.inner.fs.exists(path).await?,
                None => false,
            };
            out.push((output_name.clone(), path, valid));
        }
        Ok(out)
    }

    /// Cancel everything in flight (daemon shutdown).
    pub async fn shutdown(&self) {
        let builds = self.inner.builds.lock().await;
        for handle in builds.values() {
            handle.cancel.cancel();
        }
    }

    async fn new_build(&self) -> Result<(String, Arc<BuildHandle>)> {
        let n = self.inner.next_build_id.fetch_add(1, Ordering::Relaxed) + 1;
        let build_id = format!("b{n}");

        let started_at = now_secs();
        {
            let id = build_id.clone();
            self.inner
                .fs
                .db()
                .write(move |db| db.create_build(&id, started_at))
                .await?;
        }

        let (log_tx, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        let handle = Arc::new(BuildHandle {
            cancel: CancellationToken::new(),
            log_tx,
        });
        self.inner
            .builds
            .lock()
            .await
            .insert(build_id.clone(), handle.clone());

        Ok((build_id, handle))
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

async fn finish_build(inner: &Arc<Inner>, build_id: &str, status: BuildStatus) {
    let finished_at = now_secs();
    let id = build_id.to_string();
    let status_str = status.as_str();
    if let Err(e) = inner
        .fs
        .db()
        .write(move |db| db.set_build_status(&id, status_str, Some(finished_at)))
        .await
    {
        error!(error = %e, build_id, "failed to record terminal build status");
    }
    inner.builds.lock().await.remove(build_id);
}

async fn record_drv_result(inner: &Arc<Inner>, build_id: &str, drv_abs: &str, status: BuildStatus) {
    let id = build_id.to_string();
    let drv = drv_abs.to_string();
    let status_str = status.as_str();
    if let Err(e) = inner
        .fs
        .db()
        .write(move |db| db.upsert_build_result(&id, &drv, status_str))
        .await
    {
        error!(error = %e, build_id, drv = drv_abs, "failed to record derivation result");
    }
}

/// Top-level driver for one realize request.
async fn drive_build(
    inner: Arc<Inner>,
    build_id: String,
    handle: Arc<BuildHandle>,
    roots: Vec<StorePath>,
    keep_failed: bool,
) {
    let store_dir = inner.fs.store_dir().clone();

    let closure = match load_closure(&inner, &roots).await {
        Ok(closure) => closure,
        Err(e) => {
            warn!(error = %e, build_id, "failed to load derivation closure");
            for root in &roots {
                record_drv_result(
                    &inner,
                    &build_id,
                    &store_dir.display_path(root),
                    BuildStatus::Error,
                )
                .await;
            }
            finish_build(&inner, &build_id, BuildStatus::Error).await;
            return;
        }
    };

    debug!(build_id, derivations = closure.len(), "realizing closure");

    let mut results: HashMap<StorePath, DrvResult> = HashMap::new();
    let mut remaining: BTreeSet<StorePath> = closure.keys().cloned().collect();

    while !remaining.is_empty() {
        if handle.cancel.is_cancelled() {
            for drv_path in &remaining {
                let result = DrvResult {
                    status: BuildStatus::Error,
                    outputs: BTreeMap::new(),
                    message: "interrupted".into(),
                };
                record_drv_result(
                    &inner,
                    &build_id,
                    &store_dir.display_path(drv_path),
                    result.status,
                )
                .await;
                results.insert(drv_path.clone(), result);
            }
            break;
        }

        // A derivation is ready when every input derivation inside the
        // closure is terminal.
        let ready: Vec<StorePath> = remaining
            .iter()
            .filter(|drv_path| {
                closure[*drv_path]
                    .input_derivations
                    .keys()
                    .all(|dep| !remaining.contains(dep))
            })
            .cloned()
            .collect();

        if ready.is_empty() {
            // The cycle check makes this unreachable; fail safe anyway.
            for drv_path in &remaining {
                results.insert(
                    drv_path.clone(),
                    DrvResult {
                        status: BuildStatus::Error,
                        outputs: BTreeMap::new(),
                        message: "unresolvable dependency order".into(),
                    },
                );
            }
            break;
        }

        let mut wave = Vec::new();
        for drv_path in ready {
            remaining.remove(&drv_path);
            let drv = closure[&drv_path].clone();

            // Failure isolation: a failed input fails its dependents
            // without running them; independent branches continue.
            let failed_dep = drv
                .input_derivations
                .keys()
                .find(|dep| results.get(*dep).is_none_or(|r| r.status != BuildStatus::Success));
            if let Some(dep) = failed_dep {
                let dep_status = results
                    .get(dep)
                    .map(|r| r.status)
                    .unwrap_or(BuildStatus::Error);
                let status = match dep_status {
                    BuildStatus::Error => BuildStatus::Error,
                    _ => BuildStatus::Fail,
                };
                let result = DrvResult {
                    status,
                    outputs: BTreeMap::new(),
                    message: format!("dependency {} failed", store_dir.display_path(dep)),
                };
                record_drv_result(&inner, &build_id, &store_dir.display_path(&drv_path), status)
                    .await;
                results.insert(drv_path, result);
                continue;
            }

            let resolved = match resolve_inputs(&store_dir, &drv, &results) {
                Ok(resolved) => resolved,
                Err(e) => {
                    let result = DrvResult {
                        status: BuildStatus::Error,
                        outputs: BTreeMap::new(),
                        message: e.to_string(),
                    };
                    record_drv_result(
                        &inner,
                        &build_id,
                        &store_dir.display_path(&drv_path),
                        result.status,
                    )
                    .await;
                    results.insert(drv_path, result);
                    continue;
                }
            };

            let inner = inner.clone();
            let build_id = build_id.clone();
            let handle = handle.clone();
            wave.push(tokio::spawn(async move {
                let result =
                    realize_one(&inner, &build_id, &handle, &drv_path, &drv, resolved, keep_failed)
                        .await;
                (drv_path, result)
            }));
        }

        for task in wave {
            match task.await {
                Ok((drv_path, result)) => {
                    record_drv_result(
                        &inner,
                        &build_id,
                        &store_dir.display_path(&drv_path),
                        result.status,
                    )
                    .await;
                    results.insert(drv_path, result);
                }
                Err(e) => {
                    error!(error = %e, "realize task panicked");
                }
            }
        }
    }

    let overall = if results.values().any(|r| r.status == BuildStatus::Error) {
        BuildStatus::Error
    } else if results.values().any(|r| r.status == BuildStatus::Fail) {
        BuildStatus::Fail
    } else {
        BuildStatus::Success
    };

    info!(build_id, status = overall.as_str(), "build finished");
    finish_build(&inner, &build_id, overall).await;
}

/// Load every derivation reachable from `roots` through input
/// derivations, rejecting cycles before anything builds.
async fn load_closure(
    inner: &Arc<Inner>,
    roots: &[StorePath],
) -> Result<BTreeMap<StorePath, Derivation>> {
    #[derive(PartialEq)]
    enum Color {
        Visiting,
        Done,
    }

    let mut closure = BTreeMap::new();
    let mut colors: HashMap<StorePath, Color> = HashMap::new();

    // Iterative DFS with an explicit enter/exit stack so the grey set
    // catches cycles.
    enum Frame {
        Enter(StorePath),
        Exit(StorePath),
    }
    let mut stack: Vec<Frame> = roots.iter().cloned().map(Frame::Enter).collect();

    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Enter(drv_path) => {
                match colors.get(&drv_path) {
                    Some(Color::Done) => continue,
                    Some(Color::Visiting) => {
                        return Err(DaemonError::InvalidInput(format!(
                            "derivation dependency cycle through {}",
                            inner.fs.store_dir().display_path(&drv_path)
                        )));
                    }
                    None => {}
                }
                colors.insert(drv_path.clone(), Color::Visiting);

                let drv = load_derivation(inner, &drv_path).await?;
                stack.push(Frame::Exit(drv_path.clone()));
                for dep in drv.input_derivations.keys() {
                    stack.push(Frame::Enter(dep.clone()));
                }
                closure.insert(drv_path, drv);
            }
            Frame::Exit(drv_path) => {
                colors.insert(drv_path, Color::Done);
            }
        }
    }

    Ok(closure)
}

async fn load_derivation(inner: &Arc<Inner>, drv_path: &StorePath) -> Result<Derivation> {
    let store_dir = inner.fs.store_dir();
    let abs = store_dir.display_path(drv_path);

    if !inner.fs.exists(drv_path).await? {
        return Err(DaemonError::NotFound(abs));
    }

    let bytes = tokio::fs::read(&abs)
        .await
        .map_err(|e| DaemonError::io(format!("reading {abs}"), e))?;

    let name = drv_path
        .name()
        .strip_suffix(".drv")
        .ok_or_else(|| DaemonError::InvalidInput(format!("{abs} is not a derivation")))?;

    let drv = Derivation::parse(store_dir, &bytes, name)
        .map_err(|e| DaemonError::InvalidInput(format!("parsing {abs}: {e}")))?;
    drv.validate()
        .map_err(|e| DaemonError::InvalidInput(format!("validating {abs}: {e}")))?;
    Ok(drv)
}

/// Map every consumed input-derivation output to its realized path.
fn resolve_inputs(
    store_dir: &StoreDir,
    drv: &Derivation,
    results: &HashMap<StorePath, DrvResult>,
) -> Result<BTreeMap<DrvOutput, StorePath>> {
    let mut resolved = BTreeMap::new();
    for (input_drv, outputs) in &drv.input_derivations {
        let result = results.get(input_drv).ok_or_else(|| {
            DaemonError::InvalidInput(format!(
                "input derivation {} has no result",
                store_dir.display_path(input_drv)
            ))
        })?;
        for output_name in outputs {
            let path = result.outputs.get(output_name).ok_or_else(|| {
                DaemonError::InvalidInput(format!(
                    "input derivation {} has no output {output_name:?}",
                    store_dir.display_path(input_drv)
                ))
            })?;
            resolved.insert(
                DrvOutput {
                    drv_path: input_drv.clone(),
                    output_name: output_name.clone(),
                },
                path.clone(),
            );
        }
    }
    Ok(resolved)
}

/// Realize one derivation: attach to in-flight work, or win the race
/// and run the cache check + build.
async fn realize_one(
    inner: &Arc<Inner>,
    build_id: &str,
    handle: &Arc<BuildHandle>,
    drv_path: &StorePath,
    drv: &Derivation,
    resolved: BTreeMap<DrvOutput, StorePath>,
    keep_failed: bool,
) -> DrvResult {
    // De-duplication: attach to an existing runner if there is one.
    let tx = {
        let mut in_flight = inner.in_flight.lock().await;
        if let Some(rx) = in_flight.get(drv_path) {
            let mut rx = rx.clone();
            drop(in_flight);
            debug!(drv = %drv_path, "attaching to in-flight build");
            return match rx.wait_for(|v| v.is_some()).await {
                Ok(value) => value.clone().expect("checked some"),
                Err(_) => DrvResult {
                    status: BuildStatus::Error,
                    outputs: BTreeMap::new(),
                    message: "in-flight build vanished".into(),
                },
            };
        }
        let (tx, rx) = watch::channel(None);
        in_flight.insert(drv_path.clone(), rx);
        tx
    };

    let result = realize_uncontended(inner, build_id, handle, drv_path, drv, resolved, keep_failed)
        .await;

    {
        let mut in_flight = inner.in_flight.lock().await;
        in_flight.remove(drv_path);
    }
    let _ = tx.send(Some(result.clone()));

    result
}

async fn realize_uncontended(
    inner: &Arc<Inner>,
    build_id: &str,
    handle: &Arc<BuildHandle>,
    drv_path: &StorePath,
    drv: &Derivation,
    resolved: BTreeMap<DrvOutput, StorePath>,
    keep_failed: bool,
) -> DrvResult {
    let store_dir = inner.fs.store_dir().clone();
    let drv_abs = store_dir.display_path(drv_path);

    // Cache lookup before taking a build slot.
    match check_cached(inner, drv_path, drv).await {
        Ok(Some(outputs)) => {
            debug!(drv = %drv_abs, "all outputs cached, skipping build");
            return DrvResult::success(outputs);
        }
        Ok(None) => {}
        Err(e) => {
            return DrvResult {
                status: BuildStatus::Error,
                outputs: BTreeMap::new(),
                message: e.to_string(),
            };
        }
    }

    let _permit = match inner.jobs.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return DrvResult {
                status: BuildStatus::Error,
                outputs: BTreeMap::new(),
                message: "scheduler shut down".into(),
            };
        }
    };

    let log = LogSink {
        db: inner.fs.db().clone(),
        build_id: build_id.to_string(),
        drv_path: drv_abs.clone(),
        tx: handle.log_tx.clone(),
    };

    let mut settings = inner.default_settings.clone();
    settings.keep_failed = keep_failed || settings.keep_failed;

    let ctx = BuildContext {
        fs: &inner.fs,
        sandbox: &inner.sandbox,
        settings: &settings,
        signing_key: inner.signing_key.as_ref(),
    };

    match build::build_derivation(&ctx, drv_path, drv, &resolved, &log, &handle.cancel).await {
        Ok(outputs) => DrvResult::success(outputs),
        Err(err) => {
            log.append(format!("error: {err}\n").as_bytes()).await;
            let status = match &err {
                DaemonError::BuilderFailed { .. }
                | DaemonError::HashMismatch { .. }
                | DaemonError::OutputMissing { .. } => BuildStatus::Fail,
                _ => BuildStatus::Error,
            };
            DrvResult {
                status,
                outputs: BTreeMap::new(),
                message: err.to_string(),
            }
        }
    }
}

/// Return all outputs from cache, or `None` if anything must build.
async fn check_cached(
    inner: &Arc<Inner>,
    drv_path: &StorePath,
    drv: &Derivation,
) -> Result<Option<BTreeMap<String, StorePath>>> {
    let store_dir = inner.fs.store_dir();
    let mut outputs = BTreeMap::new();

    for output_name in drv.outputs.keys() {
        match drv
            .output_path(store_dir, output_name)
            .map_err(|e| DaemonError::InvalidInput(e.to_string()))?
        {
            Some(path) => {
                // Input-addressed or fixed: the expected path either has
                // valid object info or the build runs.
                if !inner.fs.exists(&path).await? {
                    return Ok(None);
                }
                outputs.insert(output_name.clone(), path);
            }
            None => {
                // Floating: consult trusted realization records.
                match lookup_realisation(inner, drv_path, output_name).await? {
                    Some(path) => {
                        outputs.insert(output_name.clone(), path);
                    }
                    None => return Ok(None),
                }
            }
        }
    }

    Ok(Some(outputs))
}

/// Find a usable realization for `(drv, output)`: the realized path is
/// present, every dependency realization is present, and either a
/// trusted signer's signature verifies or the engine runs trust-all.
async fn lookup_realisation(
    inner: &Arc<Inner>,
    drv_path: &StorePath,
    output_name: &str,
) -> Result<Option<StorePath>> {
    let store_dir = inner.fs.store_dir();
    let drv_abs = store_dir.display_path(drv_path);

    let rows = {
        let drv_abs = drv_abs.clone();
        let output_name = output_name.to_string();
        inner
            .fs
            .db()
            .read(move |db| db.query_realisations(&drv_abs, &output_name))
            .await?
    };

    'rows: for row in rows {
        let Ok(output_path) = store_dir.parse_path(&row.output_path) else {
            continue;
        };
        if !inner.fs.exists(&output_path).await? {
            continue;
        }

        let dependencies = match parse_dependencies(store_dir, &row.dependencies) {
            Ok(deps) => deps,
            Err(_) => continue,
        };
        for dep_path in dependencies.values() {
            if !inner.fs.exists(dep_path).await? {
                continue 'rows;
            }
        }

        let trusted = match &row.signature {
            Some(signature) => {
                let Ok(sig) = KeyedSignature::parse(signature) else {
                    continue;
                };
                let realisation = Realisation {
                    id: DrvOutput {
                        drv_path: drv_path.clone(),
                        output_name: output_name.to_string(),
                    },
                    output_path: output_path.clone(),
                    dependencies,
                };
                realisation.verify(store_dir, &sig, &inner.trusted_keys)
            }
            None => inner.trust_all,
        };

        if trusted {
            return Ok(Some(output_path));
        }
    }

    Ok(None)
}

/// Parse the stored `drv!out=path` dependency lines.
fn parse_dependencies(
    store_dir: &StoreDir,
    raw: &str,
) -> Result<BTreeMap<DrvOutput, StorePath>> {
    let mut out = BTreeMap::new();
    for line in raw.lines().filter(|l| !l.is_empty()) {
        let (slot, path) = line
            .split_once('=')
            .ok_or_else(|| DaemonError::InvalidInput("malformed dependency line".into()))?;
        let (drv, output_name) = slot
            .split_once('!')
            .ok_or_else(|| DaemonError::InvalidInput("malformed dependency slot".into()))?;
        out.insert(
            DrvOutput {
                drv_path: store_dir.parse_path(drv)?,
                output_name: output_name.to_string(),
            },
            store_dir.parse_path(path)?,
        );
    }
    Ok(out)
}

/// The expand operation: everything up to (but not including) spawning
/// the builder; the rendered environment is the build's log.
async fn expand_one(
    inner: &Arc<Inner>,
    build_id: &str,
    handle: &Arc<BuildHandle>,
    drv_path: &StorePath,
    temp_dir: &std::path::Path,
) -> Result<()> {
    let store_dir = inner.fs.store_dir().clone();
    let drv = load_derivation(inner, drv_path).await?;

    // Inputs must already be realized; expand never builds.
    let mut resolved = BTreeMap::new();
    for (input_drv, output_names) in &drv.input_derivations {
        let input = load_derivation(inner, input_drv).await?;
        for output_name in output_names {
            let path = match input
                .output_path(&store_dir, output_name)
                .map_err(|e| DaemonError::InvalidInput(e.to_string()))?
            {
                Some(path) if inner.fs.exists(&path).await? => path,
                Some(path) => {
                    return Err(DaemonError::NotFound(store_dir.display_path(&path)));
                }
                None => lookup_realisation(inner, input_drv, output_name)
                    .await?
                    .ok_or_else(|| {
                        DaemonError::NotFound(format!(
                            "no realization for {}!{output_name}",
                            store_dir.display_path(input_drv)
                        ))
                    })?,
            };
            resolved.insert(
                DrvOutput {
                    drv_path: input_drv.clone(),
                    output_name: output_name.clone(),
                },
                path,
            );
        }
    }

    tokio::fs::create_dir_all(temp_dir)
        .await
        .map_err(|e| DaemonError::io("creating expansion directory", e))?;

    let (substitutions, targets) =
        build::expansion_inputs(&store_dir, drv_path, &drv, &resolved)?;
    let env = build::render_environment(
        &store_dir,
        &drv,
        &substitutions,
        temp_dir,
        &targets,
        &inner.default_settings.allow_environment,
    );

    let sink = LogSink {
        db: inner.fs.db().clone(),
        build_id: build_id.to_string(),
        drv_path: store_dir.display_path(drv_path),
        tx: handle.log_tx.clone(),
    };
    let mut rendered = String::new();
    for (key, value) in &env {
        rendered.push_str(key);
        rendered.push('=');
        rendered.push_str(value);
        rendered.push('\n');
    }
    sink.append(rendered.as_bytes()).await;

    record_drv_result(
        inner,
        build_id,
        &store_dir.display_path(drv_path),
        BuildStatus::Success,
    )
    .await;

    Ok(())
}
