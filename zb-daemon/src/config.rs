// SPDX-License-Identifier: MIT

//! Daemon configuration: JSON-with-comments files merged in order of
//! increasing precedence.
//!
//! Merge laws: scalar fields are last-write-wins; `allowEnvironment`
//! and `trustedPublicKeys` do NOT merge; a later file's value replaces
//! the prior entirely, and `allowEnvironment: true` marks the allow-list
//! "all" while clearing the explicit set. `ZB_STORE_SOCKET` overrides
//! the socket path.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{DaemonError, Result};
use zb_store_core::signature::{PublicKeyEntry, SigningKey, VerifyingKey};
use zb_store_core::store_path::StoreDir;

/// Default system-wide configuration file, lowest precedence.
pub const SYSTEM_CONFIG_FILE: &str = "/etc/zb/config.json";

/// Which host environment variables builders may observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowEnvironment {
    All,
    List(BTreeSet<String>),
}

impl AllowEnvironment {
    pub fn allows(&self, var: &str) -> bool {
        match self {
            AllowEnvironment::All => true,
            AllowEnvironment::List(set) => set.contains(var),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, AllowEnvironment::List(set) if set.is_empty())
    }
}

impl Default for AllowEnvironment {
    fn default() -> Self {
        AllowEnvironment::List(BTreeSet::new())
    }
}

/// One parsed configuration file; every field optional so merging can
/// tell "unset" from "set to default".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
    pub debug: Option<bool>,
    pub store_directory: Option<PathBuf>,
    pub store_socket: Option<PathBuf>,
    pub var_directory: Option<PathBuf>,
    /// Evaluator cache path; the daemon only passes it through.
    pub cache_db: Option<PathBuf>,
    pub allow_environment: Option<AllowEnvironmentRaw>,
    pub trusted_public_keys: Option<Vec<PublicKeyEntry>>,
    pub signing_key_file: Option<PathBuf>,
    pub trust_all: Option<bool>,
    pub max_build_jobs: Option<usize>,
    pub build_timeout_secs: Option<u64>,
    pub max_silent_secs: Option<u64>,
    pub keep_failed: Option<bool>,
    pub db_writers: Option<usize>,
    pub db_readers: Option<usize>,
}

/// `allowEnvironment` accepts either a list of variable names or the
/// boolean `true` meaning "all".
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AllowEnvironmentRaw {
    All(bool),
    List(Vec<String>),
}

/// Fully merged and defaulted configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub debug: bool,
    pub store_directory: StoreDir,
    pub store_socket: PathBuf,
    pub var_directory: PathBuf,
    pub cache_db: Option<PathBuf>,
    pub allow_environment: AllowEnvironment,
    pub trusted_public_keys: Vec<PublicKeyEntry>,
    pub signing_key_file: Option<PathBuf>,
    trust_all: Option<bool>,
    pub max_build_jobs: usize,
    pub build_timeout_secs: Option<u64>,
    pub max_silent_secs: Option<u64>,
    pub keep_failed: bool,
    pub db_writers: usize,
    pub db_readers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            debug: false,
            store_directory: StoreDir::default(),
            store_socket: PathBuf::from("/zb/var/zb/server.sock"),
            var_directory: PathBuf::from("/zb/var/zb"),
            cache_db: None,
            allow_environment: AllowEnvironment::default(),
            trusted_public_keys: Vec::new(),
            signing_key_file: None,
            trust_all: None,
            max_build_jobs: 4,
            build_timeout_secs: None,
            max_silent_secs: None,
            keep_failed: false,
            db_writers: 1,
            db_readers: 4,
        }
    }
}

impl Config {
    /// Merge one more file's values over this configuration.
    pub fn merge(&mut self, raw: RawConfig) {
        if let Some(v) = raw.debug {
            self.debug = v;
        }
        if let Some(v) = raw.store_directory {
            // An invalid store directory is a configuration error the
            // caller surfaces; keep the old value on failure.
            if let Ok(dir) = StoreDir::new(v.to_string_lossy().into_owned()) {
                self.store_directory = dir;
            }
        }
        if let Some(v) = raw.store_socket {
            self.store_socket = v;
        }
        if let Some(v) = raw.var_directory {
            self.var_directory = v;
        }
        if let Some(v) = raw.cache_db {
            self.cache_db = Some(v);
        }
        if let Some(v) = raw.allow_environment {
            // Lists replace; `true` means "all" and empties the set.
            self.allow_environment = match v {
                AllowEnvironmentRaw::All(true) => AllowEnvironment::All,
                AllowEnvironmentRaw::All(false) => AllowEnvironment::List(BTreeSet::new()),
                AllowEnvironmentRaw::List(list) => {
                    AllowEnvironment::List(list.into_iter().collect())
                }
            };
        }
        if let Some(v) = raw.trusted_public_keys {
            self.trusted_public_keys = v;
        }
        if let Some(v) = raw.signing_key_file {
            self.signing_key_file = Some(v);
        }
        if let Some(v) = raw.trust_all {
            self.trust_all = Some(v);
        }
        if let Some(v) = raw.max_build_jobs {
            self.max_build_jobs = v.max(1);
        }
        if let Some(v) = raw.build_timeout_secs {
            self.build_timeout_secs = Some(v);
        }
        if let Some(v) = raw.max_silent_secs {
            self.max_silent_secs = Some(v);
        }
        if let Some(v) = raw.keep_failed {
            self.keep_failed = v;
        }
        if let Some(v) = raw.db_writers {
            self.db_writers = v.max(1);
        }
        if let Some(v) = raw.db_readers {
            self.db_readers = v;
        }
    }

    /// Load configuration: the system file (if present), then each
    /// `--config` file in order, then environment overrides.
    pub fn load(extra_files: &[PathBuf]) -> Result<Config> {
        let mut config = Config::default();

        let system = Path::new(SYSTEM_CONFIG_FILE);
        if system.exists() {
            config.merge(parse_file(system)?);
        }
        for file in extra_files {
            config.merge(parse_file(file)?);
        }

        if let Ok(socket) = std::env::var("ZB_STORE_SOCKET") {
            config.store_socket = PathBuf::from(socket);
        }

        Ok(config)
    }

    /// Whether unsigned realizations are accepted. Explicit `trustAll`
    /// wins; otherwise a daemon with no trusted keys configured runs in
    /// single-user trust-all mode.
    pub fn is_trust_all(&self) -> bool {
        self.trust_all.unwrap_or(self.trusted_public_keys.is_empty())
    }

    pub fn trusted_keys(&self) -> Result<Vec<VerifyingKey>> {
        self.trusted_public_keys
            .iter()
            .map(|entry| {
                VerifyingKey::from_entry(entry)
                    .map_err(|e| DaemonError::InvalidInput(format!("trusted key: {e}")))
            })
            .collect()
    }

    pub fn load_signing_key(&self) -> Result<Option<SigningKey>> {
        let Some(path) = &self.signing_key_file else {
            return Ok(None);
        };
        let contents = std::fs::read(path)
            .map_err(|e| DaemonError::io(format!("reading {}", path.display()), e))?;
        let key = SigningKey::from_key_file(&contents)
            .map_err(|e| DaemonError::InvalidInput(format!("signing key: {e}")))?;
        Ok(Some(key))
    }

    pub fn db_path(&self) -> PathBuf {
        self.var_directory.join("db.sqlite")
    }

    pub fn build_root(&self) -> PathBuf {
        self.var_directory.join("build")
    }
}

fn parse_file(path: &Path) -> Result<RawConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| DaemonError::io(format!("reading {}", path.display()), e))?;
    parse_str(&contents)
        .map_err(|e| DaemonError::InvalidInput(format!("config {}: {e}", path.display())))
}

/// Parse one JSON-with-comments document.
pub fn parse_str(contents: &str) -> std::result::Result<RawConfig, serde_json::Error> {
    serde_json::from_str(&strip_comments(contents))
}

/// Blank out `//` line comments and `/* */` block comments outside
/// strings, preserving byte positions for error messages.
fn strip_comments(input: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Code,
        Str,
        StrEscape,
        LineComment,
        BlockComment,
    }

    let mut out = String::with_capacity(input.len());
    let mut state = State::Code;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '"' => {
                    state = State::Str;
                    out.push(c);
                }
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = State::LineComment;
                    out.push_str("  ");
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::BlockComment;
                    out.push_str("  ");
                }
                c => out.push(c),
            },
            State::Str => {
                out.push(c);
                match c {
                    '\\' => state = State::StrEscape,
                    '"' => state = State::Code,
                    _ => {}
                }
            }
            State::StrEscape => {
                out.push(c);
                state = State::Str;
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Code;
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Code;
                    out.push_str("  ");
                } else if c == '\n' {
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_are_stripped() {
        let raw = parse_str(
            r#"{
                // line comment
                "debug": true, /* block
                                  comment */
                "storeDirectory": "/foo" // trailing
            }"#,
        )
        .unwrap();
        assert_eq!(Some(true), raw.debug);
        assert_eq!(Some(PathBuf::from("/foo")), raw.store_directory);
    }

    #[test]
    fn comment_markers_inside_strings_survive() {
        let raw = parse_str(r#"{ "storeSocket": "/tmp//not-a-comment/*x*/.sock" }"#).unwrap();
        assert_eq!(
            Some(PathBuf::from("/tmp//not-a-comment/*x*/.sock")),
            raw.store_socket
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(parse_str(r#"{ "storeDirektory": "/foo" }"#).is_err());
    }

    /// Scalar fields: last write wins.
    #[test]
    fn scalar_merge_last_wins() {
        let mut config = Config::default();
        config.merge(parse_str(r#"{ "debug": true, "storeDirectory": "/foo" }"#).unwrap());
        config.merge(parse_str(r#"{ "storeDirectory": "/bar" }"#).unwrap());

        assert!(config.debug);
        assert_eq!("/bar", config.store_directory.as_str());
    }

    /// `allowEnvironment: true` means "all" and empties the set, even
    /// if later files never mention the key again.
    #[test]
    fn allow_environment_true_means_all() {
        let mut config = Config::default();
        config.merge(parse_str(r#"{ "allowEnvironment": ["FOO"] }"#).unwrap());
        config.merge(parse_str(r#"{ "allowEnvironment": true }"#).unwrap());

        assert_eq!(AllowEnvironment::All, config.allow_environment);
        assert!(config.allow_environment.allows("ANYTHING"));
    }

    /// List-valued keys replace, never merge.
    #[test]
    fn list_keys_replace() {
        let mut config = Config::default();
        config.merge(parse_str(r#"{ "allowEnvironment": ["FOO", "BAR"] }"#).unwrap());
        config.merge(parse_str(r#"{ "allowEnvironment": ["BAZ"] }"#).unwrap());

        assert!(config.allow_environment.allows("BAZ"));
        assert!(!config.allow_environment.allows("FOO"));

        config.merge(
            parse_str(
                r#"{ "trustedPublicKeys": [
                    { "format": "ed25519", "publicKey": "AAAA" }
                ] }"#,
            )
            .unwrap(),
        );
        config.merge(parse_str(r#"{ "trustedPublicKeys": [] }"#).unwrap());
        assert!(config.trusted_public_keys.is_empty());
    }

    #[test]
    fn trust_all_defaults_follow_trusted_keys() {
        let mut config = Config::default();
        assert!(config.is_trust_all(), "no keys configured means single-user");

        config.merge(
            parse_str(
                r#"{ "trustedPublicKeys": [
                    { "format": "ed25519", "publicKey": "AAAA" }
                ] }"#,
            )
            .unwrap(),
        );
        assert!(!config.is_trust_all());

        config.merge(parse_str(r#"{ "trustAll": true }"#).unwrap());
        assert!(config.is_trust_all());
    }
}
