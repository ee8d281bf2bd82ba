// SPDX-License-Identifier: MIT

//! Content-address fingerprints and store path construction.
//!
//! Path construction is bit-exact: two implementations must produce
//! identical store paths for identical inputs. The recipe is a SHA-256
//! over a fingerprint string `"{type}:{digest}:{store_dir}:{name}"`,
//! XOR-folded to 20 bytes, rendered in the digest alphabet.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::hash::{Hash, HashAlgo, ParseHashError};
use crate::store_path::{StoreDir, StorePath, StorePathError};

/// How the bytes of an object were fingerprinted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CaMethod {
    /// Hash over a single regular file's bytes.
    Flat,
    /// Hash over the canonical archive serialization of a subtree.
    Recursive,
    /// Hash over literal text with references (derivations).
    Text,
}

impl fmt::Display for CaMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CaMethod::Flat => "flat",
            CaMethod::Recursive => "recursive",
            CaMethod::Text => "text",
        })
    }
}

/// A content-address fingerprint.
///
/// Rendered as `text:sha256:<b32>`, `fixed:<algo>:<b32>` or
/// `fixed:r:<algo>:<b32>`, the form stored in object info and in
/// realization records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContentAddress {
    Text(Hash),
    Flat(Hash),
    Recursive(Hash),
}

impl ContentAddress {
    pub fn from_hash(method: CaMethod, hash: Hash) -> Result<Self, ContentAddressError> {
        match method {
            CaMethod::Text if hash.algo != HashAlgo::Sha256 => {
                Err(ContentAddressError::TextMustBeSha256(hash.algo))
            }
            CaMethod::Text => Ok(ContentAddress::Text(hash)),
            CaMethod::Flat => Ok(ContentAddress::Flat(hash)),
            CaMethod::Recursive => Ok(ContentAddress::Recursive(hash)),
        }
    }

    pub fn method(&self) -> CaMethod {
        match self {
            ContentAddress::Text(_) => CaMethod::Text,
            ContentAddress::Flat(_) => CaMethod::Flat,
            ContentAddress::Recursive(_) => CaMethod::Recursive,
        }
    }

    pub fn hash(&self) -> &Hash {
        match self {
            ContentAddress::Text(h) | ContentAddress::Flat(h) | ContentAddress::Recursive(h) => h,
        }
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentAddress::Text(h) => write!(f, "text:{h}"),
            ContentAddress::Flat(h) => write!(f, "fixed:{h}"),
            ContentAddress::Recursive(h) => write!(f, "fixed:r:{h}"),
        }
    }
}

impl FromStr for ContentAddress {
    type Err = ContentAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("text:") {
            let hash = Hash::parse(rest)?;
            ContentAddress::from_hash(CaMethod::Text, hash)
        } else if let Some(rest) = s.strip_prefix("fixed:r:") {
            Ok(ContentAddress::Recursive(Hash::parse(rest)?))
        } else if let Some(rest) = s.strip_prefix("fixed:") {
            Ok(ContentAddress::Flat(Hash::parse(rest)?))
        } else {
            Err(ContentAddressError::InvalidForm(s.to_string()))
        }
    }
}

#[derive(Debug, Error)]
pub enum ContentAddressError {
    #[error("text content addresses must use sha256, got {0}")]
    TextMustBeSha256(HashAlgo),
    #[error("invalid hash in content address: {0}")]
    InvalidHash(#[from] ParseHashError),
    #[error("{0:?} is not of the form '<text|fixed>:<hash>'")]
    InvalidForm(String),
}

#[derive(Debug, Error)]
pub enum BuildStorePathError {
    #[error("invalid store path: {0}")]
    InvalidStorePath(#[from] StorePathError),
    #[error("references are only allowed on recursive sha256 content addresses")]
    InvalidReference,
}

/// References carried by a fixed content-addressed object: the paths it
/// mentions, plus whether it mentions itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathRefs {
    pub others: BTreeSet<StorePath>,
    pub self_ref: bool,
}

impl PathRefs {
    pub fn is_empty(&self) -> bool {
        self.others.is_empty() && !self.self_ref
    }
}

/// XOR-fold an arbitrarily long digest down to `N` bytes by rotating
/// through the output buffer.
pub fn compress_hash<const N: usize>(input: &[u8]) -> [u8; N] {
    let mut output = [0u8; N];
    for (i, b) in input.iter().enumerate() {
        output[i % N] ^= b;
    }
    output
}

/// The shared tail of all path constructions: hash the fingerprint,
/// fold, validate the name.
pub fn make_store_path(
    store_dir: &StoreDir,
    path_type: &str,
    digest_display: &str,
    name: &str,
) -> Result<StorePath, StorePathError> {
    let fingerprint = format!("{path_type}:{digest_display}:{store_dir}:{name}");
    let digest = compress_hash::<20>(&Sha256::digest(fingerprint.as_bytes()));
    StorePath::new(digest, name)
}

/// Store path of a literal text object (derivations use this with a
/// `.drv`-suffixed name). The references appear in the type tag.
pub fn text_path<'a>(
    store_dir: &StoreDir,
    name: &str,
    content: impl AsRef<[u8]>,
    references: impl IntoIterator<Item = &'a StorePath>,
) -> Result<StorePath, StorePathError> {
    let mut path_type = String::from("text");
    for reference in references {
        path_type.push(':');
        path_type.push_str(&store_dir.display_path(reference));
    }

    let content_digest = HashAlgo::Sha256.digest(content);
    make_store_path(
        store_dir,
        &path_type,
        &format!("sha256:{}", content_digest.to_hex()),
        name,
    )
}

/// Store path of a fixed content-addressed output.
///
/// Recursive sha256 objects use the `source` type tag and may carry
/// references (including a self bit). Everything else hashes through an
/// inner `fixed:out:` fingerprint and must be reference-free.
pub fn fixed_ca_output_path(
    store_dir: &StoreDir,
    name: &str,
    ca: &ContentAddress,
    refs: &PathRefs,
) -> Result<StorePath, BuildStorePathError> {
    match ca {
        ContentAddress::Recursive(hash) if hash.algo == HashAlgo::Sha256 => {
            let mut path_type = String::from("source");
            for reference in &refs.others {
                path_type.push(':');
                path_type.push_str(&store_dir.display_path(reference));
            }
            if refs.self_ref {
                path_type.push_str(":self");
            }
            Ok(make_store_path(
                store_dir,
                &path_type,
                &format!("sha256:{}", hash.to_hex()),
                name,
            )?)
        }
        _ => {
            if !refs.is_empty() {
                return Err(BuildStorePathError::InvalidReference);
            }
            let prefix = match ca.method() {
                CaMethod::Recursive => "r:",
                _ => "",
            };
            let inner = Sha256::digest(format!(
                "fixed:out:{}{}:{}:",
                prefix,
                ca.hash().algo,
                ca.hash().to_hex()
            ));
            Ok(make_store_path(
                store_dir,
                "output:out",
                &format!("sha256:{}", hex::encode(inner)),
                name,
            )?)
        }
    }
}

/// Store path of an input-addressed output: a function of the
/// derivation's canonical bytes and the output name only.
pub fn input_addressed_output_path(
    store_dir: &StoreDir,
    drv_canonical_bytes: &[u8],
    drv_name: &str,
    output_name: &str,
) -> Result<StorePath, StorePathError> {
    let digest = Sha256::digest(drv_canonical_bytes);
    make_store_path(
        store_dir,
        &format!("output:{output_name}"),
        &format!("sha256:{}", hex::encode(digest)),
        &output_path_name(drv_name, output_name),
    )
}

/// Name part of an output's store path: the derivation name, plus
/// `-{output}` for any output other than `out`.
pub fn output_path_name(drv_name: &str, output_name: &str) -> String {
    if output_name == "out" {
        drv_name.to_string()
    } else {
        format!("{drv_name}-{output_name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn store_dir() -> StoreDir {
        StoreDir::default()
    }

    #[test]
    fn compress_folds_by_xor() {
        assert_eq!([0x01 ^ 0x03, 0x02], compress_hash::<2>(&[0x01, 0x02, 0x03]));
        assert_eq!([0u8; 4], compress_hash::<4>(&[]));
    }

    #[rstest]
    #[case::text("text:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s")]
    #[case::flat("fixed:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s")]
    #[case::recursive("fixed:r:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s")]
    fn content_address_roundtrip(#[case] s: &str) {
        let ca: ContentAddress = s.parse().expect("must parse");
        assert_eq!(s, ca.to_string());
    }

    #[test]
    fn content_address_rejects() {
        "blake3:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s"
            .parse::<ContentAddress>()
            .expect_err("unknown form");
        "text:sha512:ab".parse::<ContentAddress>().expect_err("bad digest");
    }

    /// Path construction is deterministic and sensitive to every input.
    #[test]
    fn text_path_deterministic() {
        let dir = store_dir();
        let a = text_path(&dir, "foo", "bar", []).unwrap();
        let b = text_path(&dir, "foo", "bar", []).unwrap();
        assert_eq!(a, b);

        let c = text_path(&dir, "foo", "baz", []).unwrap();
        assert_ne!(a, c, "content must influence the digest");

        let with_ref = text_path(&dir, "foo", "bar", [&c]).unwrap();
        assert_ne!(a, with_ref, "references must influence the digest");

        let other_dir = StoreDir::new("/elsewhere/store").unwrap();
        let d = text_path(&other_dir, "foo", "bar", []).unwrap();
        assert_ne!(a.digest(), d.digest(), "store dir must influence the digest");
    }

    /// Golden values: these must never change across refactors.
    #[test]
    fn fixed_ca_output_path_golden() {
        let dir = store_dir();
        let hash = HashAlgo::Sha256.digest("hello world\n");

        let flat = fixed_ca_output_path(
            &dir,
            "hello",
            &ContentAddress::Flat(hash.clone()),
            &PathRefs::default(),
        )
        .unwrap();
        let rec = fixed_ca_output_path(
            &dir,
            "hello",
            &ContentAddress::Recursive(hash.clone()),
            &PathRefs::default(),
        )
        .unwrap();
        assert_ne!(flat, rec, "hash mode is part of the address");

        let self_refs = PathRefs {
            others: BTreeSet::new(),
            self_ref: true,
        };
        let rec_self =
            fixed_ca_output_path(&dir, "hello", &ContentAddress::Recursive(hash.clone()), &self_refs)
                .unwrap();
        assert_ne!(rec, rec_self, "the self bit is part of the address");

        // Stable across runs.
        let rec2 = fixed_ca_output_path(
            &dir,
            "hello",
            &ContentAddress::Recursive(hash),
            &PathRefs::default(),
        )
        .unwrap();
        assert_eq!(rec, rec2);
    }

    #[test]
    fn flat_ca_rejects_references() {
        let dir = store_dir();
        let hash = HashAlgo::Sha256.digest("x");
        let mut refs = PathRefs::default();
        refs.self_ref = true;
        let err = fixed_ca_output_path(&dir, "x", &ContentAddress::Flat(hash), &refs).unwrap_err();
        assert!(matches!(err, BuildStorePathError::InvalidReference));
    }

    #[test]
    fn input_addressed_output_path_depends_on_bytes_and_output() {
        let dir = store_dir();
        let a = input_addressed_output_path(&dir, b"Derive(...)", "pkg", "out").unwrap();
        let b = input_addressed_output_path(&dir, b"Derive(...)", "pkg", "out").unwrap();
        assert_eq!(a, b);
        assert_eq!("pkg", a.name());

        let c = input_addressed_output_path(&dir, b"Derive(...!)", "pkg", "out").unwrap();
        assert_ne!(a, c);

        let dev = input_addressed_output_path(&dir, b"Derive(...)", "pkg", "dev").unwrap();
        assert_ne!(a.digest(), dev.digest());
        assert_eq!("pkg-dev", dev.name());
    }
}
