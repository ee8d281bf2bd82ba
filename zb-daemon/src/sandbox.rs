// SPDX-License-Identifier: MIT

//! Sandbox abstraction for builder isolation.
//!
//! The scheduler relies on a capability contract, not a mechanism: the
//! builder can read only what was declared, write only under its
//! writable roots and temp directory, observes no host environment
//! beyond the variables handed to it, and exits with a status code.
//! Platform backends (namespaces, chroot, …) slot in behind the
//! [`Sandbox`] trait; [`ProcessSandbox`] is the portable backend that
//! enforces the environment and working-directory parts of the contract
//! via plain process spawning.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

/// What a builder is allowed to see and touch.
#[derive(Debug, Clone, Default)]
pub struct SandboxSpec {
    /// Path to the executable, typically a store path.
    pub builder: String,
    pub args: Vec<String>,
    /// Fully substituted environment; nothing else leaks in.
    pub env: BTreeMap<String, String>,
    /// Paths the builder may write under (its declared outputs).
    pub writable_roots: Vec<PathBuf>,
    /// Mapping from outside path to inside path (identity by default).
    pub readable_paths: BTreeMap<PathBuf, PathBuf>,
    /// Network access; off unless the derivation opted in.
    pub network: bool,
    /// Per-build scratch directory, also the working directory.
    pub temp_dir: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox spawn failed: {0}")]
    Spawn(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether the host platform can isolate builders at all.
pub fn supports_sandbox() -> bool {
    cfg!(target_os = "linux")
}

/// Whether this process is currently permitted to set up isolation.
pub fn can_sandbox() -> bool {
    supports_sandbox() && nix::unistd::geteuid().is_root()
}

pub trait Sandbox: Send + Sync {
    /// Spawn the builder inside the sandbox.
    fn spawn(
        &self,
        spec: &SandboxSpec,
    ) -> impl std::future::Future<Output = Result<SandboxChild, SandboxError>> + Send;
}

/// A running builder process.
#[derive(Debug)]
pub struct SandboxChild {
    inner: tokio::process::Child,
}

impl SandboxChild {
    pub fn from_child(child: tokio::process::Child) -> Self {
        Self { inner: child }
    }

    pub async fn wait(&mut self) -> Result<std::process::ExitStatus, SandboxError> {
        Ok(self.inner.wait().await?)
    }

    /// Cooperative interrupt: SIGTERM to the process group, then
    /// SIGKILL after `grace`.
    pub async fn cancel(&mut self, grace: Duration) {
        signal_group(self.pid(), nix::sys::signal::Signal::SIGTERM);
        let killed = tokio::time::timeout(grace, self.inner.wait()).await;
        if killed.is_err() {
            signal_group(self.pid(), nix::sys::signal::Signal::SIGKILL);
            let _ = self.inner.kill().await;
        }
    }

    /// Force-kill the whole process group.
    pub async fn kill(&mut self) {
        signal_group(self.pid(), nix::sys::signal::Signal::SIGKILL);
        let _ = self.inner.kill().await;
    }

    pub fn take_stdout(&mut self) -> Option<tokio::process::ChildStdout> {
        self.inner.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<tokio::process::ChildStderr> {
        self.inner.stderr.take()
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.id()
    }
}

/// Signal the process group rooted at `pid`. The child was spawned with
/// `process_group(0)`, so its pgid equals its pid.
fn signal_group(pid: Option<u32>, signal: nix::sys::signal::Signal) {
    if let Some(pid) = pid {
        let pgid = nix::unistd::Pid::from_raw(pid as i32);
        let _ = nix::sys::signal::killpg(pgid, signal);
    }
}

/// Portable backend: cleared environment, own process group, scratch
/// working directory, piped stdio. Filesystem and network isolation
/// need a kernel backend and are reported through [`supports_sandbox`] /
/// [`can_sandbox`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSandbox;

impl ProcessSandbox {
    pub fn new() -> Self {
        ProcessSandbox
    }
}

impl Sandbox for ProcessSandbox {
    async fn spawn(&self, spec: &SandboxSpec) -> Result<SandboxChild, SandboxError> {
        let mut cmd = Command::new(&spec.builder);
        cmd.args(&spec.args)
            .current_dir(&spec.temp_dir)
            .env_clear()
            .envs(spec.env.iter())
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("failed to spawn {:?}: {e}", spec.builder)))?;

        Ok(SandboxChild::from_child(child))
    }
}
