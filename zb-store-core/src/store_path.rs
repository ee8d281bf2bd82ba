// SPDX-License-Identifier: MIT

//! Store directories and store paths.
//!
//! A store path is a direct child of the store directory, named
//! `<digest>-<name>` where the digest is 20 bytes rendered in the
//! [base-32 alphabet](crate::base32) (32 characters) and the name is a
//! human label. The store directory itself participates in every digest,
//! so paths are not portable across stores rooted elsewhere.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::base32::{self, Base32DecodeError};

/// Raw length of a store path digest.
pub const DIGEST_SIZE: usize = 20;
/// Rendered length of a store path digest (`base32::encode_len(20)`).
pub const ENCODED_DIGEST_SIZE: usize = 32;

/// Maximum length of a store object name.
const NAME_MAX: usize = 211;

/// The canonical store directory.
pub const DEFAULT_STORE_DIR: &str = "/zb/store";

#[derive(Debug, PartialEq, Eq, Clone, Error)]
pub enum StorePathError {
    #[error("dash is missing between digest and name")]
    MissingDash,
    #[error("invalid digest encoding: {0}")]
    InvalidDigest(Base32DecodeError),
    #[error("invalid length")]
    InvalidLength,
    #[error("invalid name {0:?}, character at position {1} is not allowed")]
    InvalidName(String, usize),
    #[error("path is not inside the store directory")]
    MissingStoreDir,
    #[error("store directory must be an absolute path")]
    RelativeStoreDir,
}

/// The absolute directory every store object lives under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreDir(String);

impl StoreDir {
    /// Construct a store directory from an absolute path without a
    /// trailing slash.
    pub fn new(dir: impl Into<String>) -> Result<Self, StorePathError> {
        let mut dir = dir.into();
        if !dir.starts_with('/') {
            return Err(StorePathError::RelativeStoreDir);
        }
        while dir.len() > 1 && dir.ends_with('/') {
            dir.pop();
        }
        Ok(StoreDir(dir))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// Absolute filesystem location of a store path.
    pub fn object_path(&self, path: &StorePath) -> PathBuf {
        Path::new(&self.0).join(path.to_string())
    }

    /// Absolute string form `<dir>/<digest>-<name>`.
    pub fn display_path(&self, path: &StorePath) -> String {
        format!("{}/{}", self.0, path)
    }

    /// Parse an absolute path that must live directly under this store
    /// directory.
    pub fn parse_path(&self, s: &str) -> Result<StorePath, StorePathError> {
        let rest = s
            .strip_prefix(&self.0)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or(StorePathError::MissingStoreDir)?;
        if rest.contains('/') {
            return Err(StorePathError::InvalidName(rest.to_string(), 0));
        }
        rest.parse()
    }
}

impl Default for StoreDir {
    fn default() -> Self {
        StoreDir(DEFAULT_STORE_DIR.to_string())
    }
}

impl fmt::Display for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A store path: 20-byte digest plus name, without the store directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorePath {
    digest: [u8; DIGEST_SIZE],
    name: String,
}

impl StorePath {
    pub fn new(digest: [u8; DIGEST_SIZE], name: impl Into<String>) -> Result<Self, StorePathError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(StorePath { digest, name })
    }

    pub fn digest(&self) -> &[u8; DIGEST_SIZE] {
        &self.digest
    }

    /// The digest in its rendered 32-character form.
    pub fn digest_string(&self) -> String {
        base32::encode(&self.digest)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this path names a serialized derivation.
    pub fn is_derivation(&self) -> bool {
        self.name.ends_with(".drv")
    }
}

impl FromStr for StorePath {
    type Err = StorePathError;

    /// Parse the `<digest>-<name>` base form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        // 32 digest characters, one dash, at least one name character
        if bytes.len() < ENCODED_DIGEST_SIZE + 2 {
            return Err(StorePathError::InvalidLength);
        }

        let digest = base32::decode(&bytes[..ENCODED_DIGEST_SIZE])
            .map_err(StorePathError::InvalidDigest)?;

        if bytes[ENCODED_DIGEST_SIZE] != b'-' {
            return Err(StorePathError::MissingDash);
        }

        let name = &s[ENCODED_DIGEST_SIZE + 1..];
        validate_name(name)?;

        Ok(StorePath {
            digest: digest.try_into().expect("digest length checked"),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", base32::encode(&self.digest), self.name)
    }
}

impl PartialOrd for StorePath {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StorePath {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.digest, &self.name).cmp(&(&other.digest, &other.name))
    }
}

impl Serialize for StorePath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StorePath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Check the restrictions on store object names: ASCII alphanumerics and
/// `+-._?=`, no leading dot, 1..=211 characters.
pub fn validate_name(s: &str) -> Result<(), StorePathError> {
    if s.is_empty() || s.len() > NAME_MAX {
        return Err(StorePathError::InvalidLength);
    }

    for (i, c) in s.bytes().enumerate() {
        if c.is_ascii_alphanumeric()
            || (c == b'.' && i != 0)
            || c == b'-'
            || c == b'_'
            || c == b'+'
            || c == b'?'
            || c == b'='
        {
            continue;
        }
        return Err(StorePathError::InvalidName(s.to_string(), i));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const EXAMPLE: &str = "00bgd045z0d4icpbc2yyz4gx48ak44la-net-tools-1.60_p20170221182432";

    #[test]
    fn happy_path() {
        let p: StorePath = EXAMPLE.parse().expect("must parse");
        assert_eq!("net-tools-1.60_p20170221182432", p.name());
        assert_eq!(
            p.digest(),
            &[
                0x8a, 0x12, 0x32, 0x15, 0x22, 0xfd, 0x91, 0xef, 0xbd, 0x60, 0xeb, 0xb2, 0x48,
                0x1a, 0xf8, 0x85, 0x80, 0xf6, 0x16, 0x00
            ]
        );
        assert_eq!(EXAMPLE, p.to_string());
    }

    #[rstest]
    // a name may not start with a dot
    #[case::starts_with_dot("fli4bwscgna7lpm7v5xgnjxrxh0yc7ra-.gitignore")]
    #[case::digest_too_short("00bgd045z0d4icpbc2yy-net-tools-1.60")]
    #[case::bad_digest_encoding("00bgd045z0d4icpbc2yyz4gx48aku4la-net-tools-1.60")]
    #[case::no_dash("00bgd045z0d4icpbc2yyz4gx48ak44lanet-tools-1.60")]
    #[case::subpath("00bgd045z0d4icpbc2yyz4gx48ak44la-net-tools/bin/arp")]
    #[case::empty_name("00bgd045z0d4icpbc2yyz4gx48ak44la-")]
    fn parse_fails(#[case] s: &str) {
        s.parse::<StorePath>().expect_err("must fail");
    }

    #[test]
    fn store_dir_parse() {
        let dir = StoreDir::new("/zb/store").unwrap();
        let p = dir.parse_path(&format!("/zb/store/{EXAMPLE}")).unwrap();
        assert_eq!(EXAMPLE, p.to_string());
        assert_eq!(format!("/zb/store/{EXAMPLE}"), dir.display_path(&p));

        assert_eq!(
            StorePathError::MissingStoreDir,
            dir.parse_path(&format!("/nix/store/{EXAMPLE}")).unwrap_err()
        );
        dir.parse_path(&format!("/zb/store/{EXAMPLE}/bin/arp"))
            .expect_err("subpaths are not store paths");
    }

    #[test]
    fn store_dir_normalizes_trailing_slash() {
        assert_eq!("/zb/store", StoreDir::new("/zb/store/").unwrap().as_str());
        StoreDir::new("zb/store").expect_err("relative dirs rejected");
    }

    #[test]
    fn ordering_is_digest_first() {
        let a: StorePath = "00000000000000000000000000000000-b".parse().unwrap();
        let b: StorePath = "10000000000000000000000000000000-a".parse().unwrap();
        assert!(a < b);
    }
}
