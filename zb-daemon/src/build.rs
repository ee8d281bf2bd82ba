// SPDX-License-Identifier: MIT

//! Single-derivation build executor.
//!
//! Given a derivation whose inputs are all realized, this module
//! substitutes placeholders, prepares the scratch directory and
//! environment, drives the sandboxed builder, and turns whatever it
//! produced into registered store objects: input-addressed outputs are
//! hashed and scanned in one pass, fixed CA outputs are verified against
//! their pin, floating CA outputs are content-addressed modulo
//! self-references and rewritten to their final digest before import.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read as _, Seek as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt as _;
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncBufReadExt as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AllowEnvironment;
use crate::error::{DaemonError, Result};
use crate::sandbox::{ProcessSandbox, Sandbox as _, SandboxChild, SandboxSpec};
use crate::scheduler::LogSink;
use crate::store_fs::{StoreFs, canonicalize_tree, remove_tree};
use zb_store_core::content_address::{
    CaMethod, ContentAddress, PathRefs, compress_hash, fixed_ca_output_path, output_path_name,
};
use zb_store_core::derivation::{Derivation, OutputSpec};
use zb_store_core::hash::{Hash, HashAlgo};
use zb_store_core::realisation::{DrvOutput, Realisation};
use zb_store_core::references::RefScanSink;
use zb_store_core::selfref::{self, SourceHashOpts};
use zb_store_core::signature::SigningKey;
use zb_store_core::{StoreDir, StorePath};
use zb_store_db::{RealisationParams, RegisterObjectParams};

/// Grace period between SIGTERM and SIGKILL on cancellation.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Bounded retries with linear backoff for I/O while importing and
/// registering outputs. Builder failures are never retried.
const IO_RETRIES: u32 = 3;
const IO_RETRY_STEP: Duration = Duration::from_millis(250);

/// Environment variable a derivation sets to opt into network access.
const NETWORK_MARKER: &str = "__network";

/// Per-request knobs the scheduler hands down.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub keep_failed: bool,
    pub timeout: Option<Duration>,
    pub max_silent: Option<Duration>,
    /// Parent directory for per-build scratch directories.
    pub build_root: PathBuf,
    pub allow_environment: AllowEnvironment,
}

/// Everything `build_derivation` needs besides the derivation itself.
pub struct BuildContext<'a> {
    pub fs: &'a StoreFs,
    pub sandbox: &'a ProcessSandbox,
    pub settings: &'a BuildSettings,
    pub signing_key: Option<&'a SigningKey>,
}

/// One declared output and where the builder will materialize it.
struct OutputTarget {
    spec: OutputSpec,
    /// Final path for input-addressed and fixed outputs; a unique
    /// sentinel for floating CA outputs.
    target: StorePath,
}

/// Run the builder for `drv` and register its outputs.
///
/// `resolved_inputs` maps each consumed input-derivation output to its
/// realized path; the scheduler guarantees completeness. On success the
/// returned map resolves each declared output to its final store path.
pub async fn build_derivation(
    ctx: &BuildContext<'_>,
    drv_path: &StorePath,
    drv: &Derivation,
    resolved_inputs: &BTreeMap<DrvOutput, StorePath>,
    log: &LogSink,
    cancel: &CancellationToken,
) -> Result<BTreeMap<String, StorePath>> {
    let store_dir = ctx.fs.store_dir().clone();
    let drv_path_abs = store_dir.display_path(drv_path);

    // Every declared input source must be present before we launch.
    for source in &drv.input_sources {
        if !ctx.fs.exists(source).await? {
            return Err(DaemonError::InvalidInput(format!(
                "missing input source {}",
                store_dir.display_path(source)
            )));
        }
    }

    let targets = output_targets(&store_dir, drv_path, drv)?;
    let substitutions = placeholder_substitutions(&store_dir, drv, resolved_inputs, &targets)?;

    let builder = apply_substitutions(&drv.builder, &substitutions);
    let args: Vec<String> = drv
        .args
        .iter()
        .map(|a| apply_substitutions(a, &substitutions))
        .collect();

    tokio::fs::create_dir_all(&ctx.settings.build_root)
        .await
        .map_err(|e| DaemonError::io("creating build root", e))?;
    let scratch = tempfile::Builder::new()
        .prefix("zb-build-")
        .tempdir_in(&ctx.settings.build_root)
        .map_err(|e| DaemonError::io("creating build scratch", e))?;

    let target_paths: BTreeMap<String, StorePath> = targets
        .iter()
        .map(|(name, t)| (name.clone(), t.target.clone()))
        .collect();
    let env = render_environment(
        &store_dir,
        drv,
        &substitutions,
        scratch.path(),
        &target_paths,
        &ctx.settings.allow_environment,
    );

    let spec = sandbox_spec(
        ctx.fs,
        drv,
        builder,
        args,
        env,
        scratch.path(),
        &targets,
        resolved_inputs,
    )
    .await?;

    info!(drv = %drv_path_abs, builder = %spec.builder, "starting builder");
    let child = ctx
        .sandbox
        .spawn(&spec)
        .await
        .map_err(|e| DaemonError::IoFailed(e.to_string()))?;

    let monitored = monitor_child(child, ctx.settings, log, cancel).await;

    if let Err(err) = monitored {
        cleanup_failed_outputs(&store_dir, &targets).await;
        if ctx.settings.keep_failed {
            let kept = scratch.keep();
            log.append(format!("note: keeping build directory {}\n", kept.display()).as_bytes())
                .await;
        }
        return Err(match err {
            MonitorOutcome::Exit(code) => DaemonError::BuilderFailed {
                drv_path: drv_path_abs.clone(),
                exit_code: code,
            },
            MonitorOutcome::Timeout => DaemonError::BuilderFailed {
                drv_path: drv_path_abs.clone(),
                exit_code: -1,
            },
            MonitorOutcome::Canceled => DaemonError::Canceled,
            MonitorOutcome::Io(msg) => DaemonError::IoFailed(msg),
        });
    }

    // Builder exited zero: turn each declared output into a registered
    // store object.
    let mut outputs = BTreeMap::new();
    for (output_name, target) in &targets {
        let result = process_output(
            ctx,
            &store_dir,
            drv_path,
            drv,
            output_name,
            target,
            resolved_inputs,
            scratch.path(),
        )
        .await;

        match result {
            Ok(final_path) => {
                outputs.insert(output_name.clone(), final_path);
            }
            Err(err) => {
                cleanup_failed_outputs(&store_dir, &targets).await;
                return Err(err);
            }
        }
    }

    Ok(outputs)
}

/// Render the builder environment without running anything; used by the
/// expand operation and by the build path itself.
pub fn render_environment(
    store_dir: &StoreDir,
    drv: &Derivation,
    substitutions: &BTreeMap<String, String>,
    scratch: &Path,
    targets: &BTreeMap<String, StorePath>,
    allow_environment: &AllowEnvironment,
) -> BTreeMap<String, String> {
    let scratch_str = scratch.to_string_lossy().into_owned();
    let mut env: BTreeMap<String, String> = BTreeMap::new();

    // Defaults the derivation may override.
    env.insert("PATH".into(), "/path-not-set".into());
    env.insert("HOME".into(), "/homeless-shelter".into());
    env.insert("ZB_STORE".into(), store_dir.to_string());

    // Allow-listed host environment, also overridable.
    for (key, value) in std::env::vars() {
        if allow_environment.allows(&key) {
            env.insert(key, value);
        }
    }

    // Derivation environment, placeholders substituted.
    for (key, value) in &drv.env {
        if key == NETWORK_MARKER {
            continue;
        }
        env.insert(key.clone(), apply_substitutions(value, substitutions));
    }

    // Fixed by the engine, never overridable.
    env.insert("ZB_BUILD_TOP".into(), scratch_str.clone());
    env.insert("TMPDIR".into(), scratch_str.clone());
    env.insert("TEMPDIR".into(), scratch_str.clone());
    env.insert("TMP".into(), scratch_str.clone());
    env.insert("TEMP".into(), scratch_str.clone());
    env.insert("PWD".into(), scratch_str);
    env.insert("SOURCE_DATE_EPOCH".into(), "0".into());
    env.insert("KBUILD_BUILD_TIMESTAMP".into(), "@0".into());
    env.insert("TERM".into(), "xterm-256color".into());

    // Output path variables and the `outputs` list.
    let mut output_names = Vec::new();
    for (name, target) in targets {
        env.insert(name.clone(), store_dir.display_path(target));
        output_names.push(name.clone());
    }
    env.insert("outputs".into(), output_names.join(" "));

    env
}

/// Compute where each output will be materialized, and the placeholder
/// substitution map for the derivation's own outputs plus its
/// content-addressed inputs. Used by the expand operation, which
/// prepares everything without spawning the builder.
pub fn expansion_inputs(
    store_dir: &StoreDir,
    drv_path: &StorePath,
    drv: &Derivation,
    resolved_inputs: &BTreeMap<DrvOutput, StorePath>,
) -> Result<(BTreeMap<String, String>, BTreeMap<String, StorePath>)> {
    let targets = output_targets(store_dir, drv_path, drv)?;
    let substitutions = placeholder_substitutions(store_dir, drv, resolved_inputs, &targets)?;
    let paths = targets
        .into_iter()
        .map(|(name, t)| (name, t.target))
        .collect();
    Ok((substitutions, paths))
}

fn output_targets(
    store_dir: &StoreDir,
    drv_path: &StorePath,
    drv: &Derivation,
) -> Result<BTreeMap<String, OutputTarget>> {
    let mut targets = BTreeMap::new();
    for (output_name, spec) in &drv.outputs {
        let target = match drv
            .output_path(store_dir, output_name)
            .map_err(|e| DaemonError::InvalidInput(e.to_string()))?
        {
            Some(path) => path,
            None => sentinel_path(drv_path, &drv.name, output_name)?,
        };
        targets.insert(
            output_name.clone(),
            OutputTarget {
                spec: spec.clone(),
                target,
            },
        );
    }
    Ok(targets)
}

/// A unique, path-shaped sentinel a floating CA output is built at
/// before its real digest is known.
fn sentinel_path(drv_path: &StorePath, drv_name: &str, output_name: &str) -> Result<StorePath> {
    let digest = compress_hash::<20>(&Sha256::digest(format!(
        "zb-sentinel:{}:{output_name}",
        drv_path.digest_string()
    )));
    StorePath::new(digest, output_path_name(drv_name, output_name))
        .map_err(|e| DaemonError::InvalidInput(e.to_string()))
}

fn placeholder_substitutions(
    store_dir: &StoreDir,
    drv: &Derivation,
    resolved_inputs: &BTreeMap<DrvOutput, StorePath>,
    targets: &BTreeMap<String, OutputTarget>,
) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();

    for (output_name, target) in targets {
        map.insert(
            drv.hash_placeholder(output_name),
            store_dir.display_path(&target.target),
        );
    }

    for (input_drv, output_name, placeholder) in drv.input_derivation_outputs() {
        let key = DrvOutput {
            drv_path: input_drv.clone(),
            output_name: output_name.to_string(),
        };
        let resolved = resolved_inputs.get(&key).ok_or_else(|| {
            DaemonError::InvalidInput(format!("unresolved input derivation output {key}"))
        })?;
        map.insert(placeholder, store_dir.display_path(resolved));
    }

    Ok(map)
}

fn apply_substitutions(input: &str, substitutions: &BTreeMap<String, String>) -> String {
    let mut out = input.to_string();
    for (placeholder, replacement) in substitutions {
        if out.contains(placeholder.as_str()) {
            out = out.replace(placeholder.as_str(), replacement);
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
async fn sandbox_spec(
    fs: &StoreFs,
    drv: &Derivation,
    builder: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    scratch: &Path,
    targets: &BTreeMap<String, OutputTarget>,
    resolved_inputs: &BTreeMap<DrvOutput, StorePath>,
) -> Result<SandboxSpec> {
    let store_dir = fs.store_dir();

    let mut writable_roots: Vec<PathBuf> = targets
        .values()
        .map(|t| PathBuf::from(store_dir.display_path(&t.target)))
        .collect();
    writable_roots.push(scratch.to_path_buf());

    // Identity mapping of the declared input sources and the resolved
    // input-derivation outputs.
    let mut readable_paths = BTreeMap::new();
    for source in drv.input_sources.iter().chain(resolved_inputs.values()) {
        let p = PathBuf::from(store_dir.display_path(source));
        readable_paths.insert(p.clone(), p);
    }

    Ok(SandboxSpec {
        builder,
        args,
        env,
        writable_roots,
        readable_paths,
        network: drv.env.get(NETWORK_MARKER).is_some_and(|v| v == "1"),
        temp_dir: scratch.to_path_buf(),
    })
}

enum MonitorOutcome {
    Exit(i32),
    Timeout,
    Canceled,
    Io(String),
}

/// Drain the builder's stdout/stderr into the log, enforce timeouts,
/// honor cancellation, and return its exit disposition.
async fn monitor_child(
    mut child: SandboxChild,
    settings: &BuildSettings,
    log: &LogSink,
    cancel: &CancellationToken,
) -> std::result::Result<(), MonitorOutcome> {
    let last_output = std::sync::Arc::new(std::sync::Mutex::new(tokio::time::Instant::now()));

    let stdout_task = drain_stream(child.take_stdout(), log.clone(), last_output.clone());
    let stderr_task = drain_stream(child.take_stderr(), log.clone(), last_output.clone());

    let wall_deadline = settings.timeout.map(|d| tokio::time::Instant::now() + d);

    let status = loop {
        let tick = Duration::from_millis(50);
        tokio::select! {
            result = child.wait() => match result {
                Ok(status) => break status,
                Err(e) => return Err(MonitorOutcome::Io(e.to_string())),
            },
            _ = cancel.cancelled() => {
                child.cancel(CANCEL_GRACE).await;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                return Err(MonitorOutcome::Canceled);
            }
            _ = tokio::time::sleep(tick) => {
                if let Some(deadline) = wall_deadline
                    && tokio::time::Instant::now() >= deadline
                {
                    child.kill().await;
                    let _ = stdout_task.await;
                    let _ = stderr_task.await;
                    return Err(MonitorOutcome::Timeout);
                }
                if let Some(max_silent) = settings.max_silent {
                    let silent = last_output.lock().expect("not poisoned").elapsed();
                    if silent >= max_silent {
                        child.kill().await;
                        let _ = stdout_task.await;
                        let _ = stderr_task.await;
                        return Err(MonitorOutcome::Timeout);
                    }
                }
            }
        }
    };

    // Flush remaining log lines before reporting the exit.
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    if status.success() {
        Ok(())
    } else {
        Err(MonitorOutcome::Exit(status.code().unwrap_or(-1)))
    }
}

fn drain_stream<R>(
    stream: Option<R>,
    log: LogSink,
    last_output: std::sync::Arc<std::sync::Mutex<tokio::time::Instant>>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(stream) = stream else { return };
        let mut lines = tokio::io::BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            *last_output.lock().expect("not poisoned") = tokio::time::Instant::now();
            log.append(format!("{line}\n").as_bytes()).await;
        }
    })
}

/// Remove whatever a failed build left at its output locations.
async fn cleanup_failed_outputs(store_dir: &StoreDir, targets: &BTreeMap<String, OutputTarget>) {
    for target in targets.values() {
        let path = PathBuf::from(store_dir.display_path(&target.target));
        let result = tokio::task::spawn_blocking(move || remove_tree(&path)).await;
        if let Ok(Err(e)) = result {
            warn!(error = %e, "failed to clean up build output");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_output(
    ctx: &BuildContext<'_>,
    store_dir: &StoreDir,
    drv_path: &StorePath,
    drv: &Derivation,
    output_name: &str,
    target: &OutputTarget,
    resolved_inputs: &BTreeMap<DrvOutput, StorePath>,
    scratch: &Path,
) -> Result<StorePath> {
    let abs = PathBuf::from(store_dir.display_path(&target.target));
    if tokio::fs::symlink_metadata(&abs).await.is_err() {
        return Err(DaemonError::OutputMissing {
            drv_path: store_dir.display_path(drv_path),
            output: output_name.to_string(),
        });
    }

    let candidates = reference_candidates(drv, resolved_inputs);

    match &target.spec {
        OutputSpec::InputAddressed => {
            let final_path = target.target.clone();
            register_in_place(ctx, store_dir, &abs, &final_path, None, &candidates).await?;
            Ok(final_path)
        }
        OutputSpec::CaFixed(ca) => {
            let final_path = target.target.clone();
            verify_fixed_output(store_dir, &abs, &final_path, ca).await?;
            register_in_place(
                ctx,
                store_dir,
                &abs,
                &final_path,
                Some(ca.to_string()),
                &candidates,
            )
            .await?;
            record_realisation(ctx, store_dir, drv_path, output_name, &final_path, resolved_inputs)
                .await?;
            Ok(final_path)
        }
        OutputSpec::CaFloating { method, algo } => {
            if *algo != HashAlgo::Sha256 {
                return Err(DaemonError::Unsupported(
                    "floating content-addressed outputs must use sha256".into(),
                ));
            }
            let final_path = realize_floating_output(
                ctx,
                store_dir,
                drv,
                output_name,
                &target.target,
                *method,
                &candidates,
                scratch,
            )
            .await?;
            record_realisation(ctx, store_dir, drv_path, output_name, &final_path, resolved_inputs)
                .await?;
            Ok(final_path)
        }
    }
}

/// Inputs whose digests may appear inside outputs.
fn reference_candidates(
    drv: &Derivation,
    resolved_inputs: &BTreeMap<DrvOutput, StorePath>,
) -> BTreeSet<StorePath> {
    drv.input_sources
        .iter()
        .cloned()
        .chain(resolved_inputs.values().cloned())
        .collect()
}

/// Canonicalize, hash and scan an output built directly at its final
/// path, then register it. I/O errors retry with linear backoff.
async fn register_in_place(
    ctx: &BuildContext<'_>,
    store_dir: &StoreDir,
    abs: &Path,
    final_path: &StorePath,
    ca: Option<String>,
    candidates: &BTreeSet<StorePath>,
) -> Result<()> {
    {
        let abs = abs.to_path_buf();
        tokio::task::spawn_blocking(move || canonicalize_tree(&abs))
            .await
            .map_err(|e| DaemonError::IoFailed(e.to_string()))?
            .map_err(|e| DaemonError::io("canonicalizing output", e))?;
    }

    let (nar_hash, nar_size, references) =
        hash_and_scan(abs, candidates, Some(final_path)).await?;

    let params = RegisterObjectParams {
        path: store_dir.display_path(final_path),
        nar_hash: nar_hash.to_string(),
        nar_size,
        ca,
        references: references
            .iter()
            .map(|p| store_dir.display_path(p))
            .collect(),
        registration_time: std::time::SystemTime::now(),
    };

    with_io_retry(|| {
        let params = params.clone();
        async { ctx.fs.register_object(params).await }
    })
    .await
}

/// Single-pass archive hash + reference scan, one disk read feeding two
/// consumers.
pub async fn hash_and_scan(
    path: &Path,
    candidates: &BTreeSet<StorePath>,
    self_path: Option<&StorePath>,
) -> Result<(Hash, u64, BTreeSet<StorePath>)> {
    let mut hasher = Sha256::new();
    let mut size: u64 = 0;
    let mut sink = RefScanSink::new(candidates, self_path);

    let mut stream = zb_nar::NarByteStream::new(path.to_path_buf());
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| DaemonError::io("hashing output", e))?;
        hasher.update(&chunk);
        sink.feed(&chunk);
        size += chunk.len() as u64;
    }

    Ok((Hash::sha256(hasher.finalize().into()), size, sink.found_paths()))
}

/// Check a fixed CA output against its pinned hash.
async fn verify_fixed_output(
    store_dir: &StoreDir,
    abs: &Path,
    final_path: &StorePath,
    ca: &ContentAddress,
) -> Result<()> {
    {
        let abs = abs.to_path_buf();
        tokio::task::spawn_blocking(move || canonicalize_tree(&abs))
            .await
            .map_err(|e| DaemonError::IoFailed(e.to_string()))?
            .map_err(|e| DaemonError::io("canonicalizing output", e))?;
    }

    let actual = match ca {
        ContentAddress::Flat(pinned) => {
            let contents = tokio::fs::read(abs)
                .await
                .map_err(|e| DaemonError::io("reading fixed output", e))?;
            pinned.algo.digest(&contents)
        }
        ContentAddress::Recursive(pinned) => match pinned.algo {
            HashAlgo::Sha256 => zb_nar::nar_hash(abs).await?.0,
            other => {
                // Rare non-sha256 pins hash the same archive stream.
                let mut stream = zb_nar::NarByteStream::new(abs.to_path_buf());
                let mut hasher_bytes = Vec::new();
                while let Some(chunk) = stream.next().await {
                    hasher_bytes.extend_from_slice(&chunk?);
                }
                other.digest(&hasher_bytes)
            }
        },
        ContentAddress::Text(_) => {
            return Err(DaemonError::Unsupported(
                "text content addresses are not valid build outputs".into(),
            ));
        }
    };

    if &actual != ca.hash() {
        return Err(DaemonError::HashMismatch {
            output: store_dir.display_path(final_path),
            expected: ca.hash().to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Content-address a floating output built at its sentinel path,
/// rewrite self-references to the final digest, and import it.
#[allow(clippy::too_many_arguments)]
async fn realize_floating_output(
    ctx: &BuildContext<'_>,
    store_dir: &StoreDir,
    drv: &Derivation,
    output_name: &str,
    sentinel: &StorePath,
    method: CaMethod,
    candidates: &BTreeSet<StorePath>,
    scratch: &Path,
) -> Result<StorePath> {
    let sentinel_abs = PathBuf::from(store_dir.display_path(sentinel));
    let sentinel_digest = sentinel.digest_string();

    {
        let p = sentinel_abs.clone();
        tokio::task::spawn_blocking(move || canonicalize_tree(&p))
            .await
            .map_err(|e| DaemonError::IoFailed(e.to_string()))?
            .map_err(|e| DaemonError::io("canonicalizing output", e))?;
    }

    // Serialize the tree (or, in flat mode, copy the single file) into
    // the scratch directory where it can be rewritten.
    let work_file = scratch.join(format!("output-{output_name}.bytes"));
    let flat_executable = match method {
        CaMethod::Recursive => {
            let mut f = tokio::fs::File::create(&work_file)
                .await
                .map_err(|e| DaemonError::io("creating output archive", e))?;
            zb_nar::dump(&sentinel_abs, &mut f)
                .await
                .map_err(|e| DaemonError::io("serializing output", e))?;
            false
        }
        CaMethod::Flat => {
            let meta = tokio::fs::symlink_metadata(&sentinel_abs)
                .await
                .map_err(|e| DaemonError::io("inspecting output", e))?;
            if !meta.is_file() {
                return Err(DaemonError::InvalidInput(format!(
                    "flat content-addressed output {output_name:?} is not a regular file"
                )));
            }
            tokio::fs::copy(&sentinel_abs, &work_file)
                .await
                .map_err(|e| DaemonError::io("copying output", e))?;
            // The copy inherits the canonical read-only mode; the work
            // copy must stay rewritable.
            {
                use std::os::unix::fs::PermissionsExt as _;
                tokio::fs::set_permissions(&work_file, std::fs::Permissions::from_mode(0o644))
                    .await
                    .map_err(|e| DaemonError::io("unlocking output copy", e))?;
                meta.permissions().mode() & 0o111 != 0
            }
        }
        CaMethod::Text => {
            return Err(DaemonError::Unsupported(
                "text content addresses are not valid build outputs".into(),
            ));
        }
    };

    // One blocking pass: masked content address + reference scan.
    let (ca, analysis, scanned_refs) = {
        let work_file = work_file.clone();
        let sentinel_digest = sentinel_digest.clone();
        let candidates = candidates.clone();
        tokio::task::spawn_blocking(move || -> Result<_> {
            let mut file = std::fs::File::open(&work_file)
                .map_err(|e| DaemonError::io("opening output bytes", e))?;
            let opts = SourceHashOpts {
                original_digest: sentinel_digest,
                method,
            };
            let (ca, analysis) = selfref::source_sha256_content_address(&mut file, &opts)
                .map_err(|e| DaemonError::InvalidInput(e.to_string()))?;

            // Second consumer over the same bytes for references.
            file.rewind().map_err(|e| DaemonError::io("rewinding output bytes", e))?;
            let mut sink = RefScanSink::new(&candidates, None);
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = file
                    .read(&mut buf)
                    .map_err(|e| DaemonError::io("scanning output bytes", e))?;
                if n == 0 {
                    break;
                }
                sink.feed(&buf[..n]);
            }

            Ok((ca, analysis, sink.found_paths()))
        })
        .await
        .map_err(|e| DaemonError::IoFailed(e.to_string()))??
    };

    let refs = PathRefs {
        others: scanned_refs.clone(),
        self_ref: analysis.has_self_refs(),
    };
    let final_path = fixed_ca_output_path(
        store_dir,
        &output_path_name(&drv.name, output_name),
        &ca,
        &refs,
    )
    .map_err(|e| DaemonError::InvalidInput(e.to_string()))?;

    debug!(
        sentinel = %sentinel,
        final_path = %final_path,
        self_refs = analysis.offsets.len(),
        "content-addressed floating output"
    );

    // Rewrite the sentinel digest to the final digest in place.
    if analysis.has_self_refs() {
        let work_file = work_file.clone();
        let new_digest = final_path.digest_string();
        let analysis = analysis.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .open(&work_file)
                .map_err(|e| DaemonError::io("opening output for rewrite", e))?;
            selfref::rewrite(&mut file, 0, &new_digest, &analysis)
                .map_err(|e| DaemonError::InvalidInput(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| DaemonError::IoFailed(e.to_string()))??;
    }

    // References as registered: scanned paths, plus ourselves for
    // self-referential outputs.
    let mut reference_strings: BTreeSet<String> = scanned_refs
        .iter()
        .map(|p| store_dir.display_path(p))
        .collect();
    if analysis.has_self_refs() {
        reference_strings.insert(store_dir.display_path(&final_path));
    }

    // Import the rewritten bytes at the final path.
    let fs = ctx.fs;
    let ca_string = ca.to_string();
    with_io_retry(|| {
        let work_file = work_file.clone();
        let final_path = final_path.clone();
        let ca_string = ca_string.clone();
        let reference_strings = reference_strings.clone();
        async move {
            match method {
                CaMethod::Recursive => {
                    let mut f = tokio::fs::File::open(&work_file)
                        .await
                        .map_err(|e| DaemonError::io("opening output archive", e))?;
                    let (tmp, nar_hash, nar_size) = fs.restore_to_temp(&mut f).await?;
                    fs.finalize_object(
                        tmp,
                        &final_path,
                        &nar_hash,
                        nar_size,
                        Some(ca_string),
                        reference_strings,
                    )
                    .await
                }
                CaMethod::Flat => {
                    fs.add_flat_file(
                        &work_file,
                        flat_executable,
                        &final_path,
                        Some(ca_string),
                        reference_strings,
                    )
                    .await
                }
                CaMethod::Text => unreachable!("rejected above"),
            }
        }
    })
    .await?;

    // The sentinel tree has served its purpose.
    {
        let p = sentinel_abs.clone();
        let _ = tokio::task::spawn_blocking(move || remove_tree(&p)).await;
    }

    Ok(final_path)
}

/// Record (and sign, when configured) the realization of a CA output.
async fn record_realisation(
    ctx: &BuildContext<'_>,
    store_dir: &StoreDir,
    drv_path: &StorePath,
    output_name: &str,
    output_path: &StorePath,
    resolved_inputs: &BTreeMap<DrvOutput, StorePath>,
) -> Result<()> {
    let realisation = Realisation {
        id: DrvOutput {
            drv_path: drv_path.clone(),
            output_name: output_name.to_string(),
        },
        output_path: output_path.clone(),
        dependencies: resolved_inputs.clone(),
    };

    let (signer, signature) = match ctx.signing_key {
        Some(key) => {
            let sig = realisation.sign(store_dir, key);
            (Some(key.key_id()), Some(sig.to_string()))
        }
        None => (None, None),
    };

    let dependencies = resolved_inputs
        .iter()
        .map(|(dep, path)| {
            format!(
                "{}!{}={}",
                store_dir.display_path(&dep.drv_path),
                dep.output_name,
                store_dir.display_path(path)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let params = RealisationParams {
        drv_path: store_dir.display_path(drv_path),
        output_name: output_name.to_string(),
        output_path: store_dir.display_path(output_path),
        signer,
        signature,
        dependencies,
    };

    with_io_retry(|| {
        let params = params.clone();
        async {
            ctx.fs
                .db()
                .write(move |db| db.register_realisation(&params))
                .await
                .map_err(DaemonError::from)
        }
    })
    .await
}

/// Retry transient I/O failures with linear backoff; everything else
/// passes through on the first attempt.
async fn with_io_retry<T, F, Fut>(mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Err(DaemonError::IoFailed(msg)) if attempt + 1 < IO_RETRIES => {
                attempt += 1;
                warn!(attempt, error = %msg, "transient I/O failure, retrying");
                tokio::time::sleep(IO_RETRY_STEP * attempt).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitution_replaces_all_occurrences() {
        let mut map = BTreeMap::new();
        map.insert("/placeholder".to_string(), "/zb/store/x".to_string());
        assert_eq!(
            "a /zb/store/x b /zb/store/x",
            apply_substitutions("a /placeholder b /placeholder", &map)
        );
        assert_eq!("untouched", apply_substitutions("untouched", &map));
    }

    #[test]
    fn sentinel_is_unique_per_output() {
        let drv: StorePath = "00000000000000000000000000000000-foo.drv".parse().unwrap();
        let a = sentinel_path(&drv, "foo", "out").unwrap();
        let b = sentinel_path(&drv, "foo", "dev").unwrap();
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a, sentinel_path(&drv, "foo", "out").unwrap());
        assert_eq!("foo", a.name());
    }
}
