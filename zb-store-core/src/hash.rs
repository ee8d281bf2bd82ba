// SPDX-License-Identifier: MIT

//! Hash algorithms and digest formatting.
//!
//! Everything the store itself produces is SHA-256; SHA-512 is accepted
//! for fixed content-address pins. Digests parse from and render to
//! `algo:<digest>` where the digest may be base-16, the store base-32
//! alphabet, or base-64 (distinguished by length, as in Nix).

use std::fmt;
use std::str::FromStr;

use data_encoding::BASE64;
use sha2::{Digest as _, Sha256, Sha512};
use thiserror::Error;

use crate::base32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashAlgo {
    Sha256,
    Sha512,
}

impl HashAlgo {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgo::Sha256 => "sha256",
            HashAlgo::Sha512 => "sha512",
        }
    }

    pub fn digest_size(&self) -> usize {
        match self {
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha512 => 64,
        }
    }

    pub fn base16_len(&self) -> usize {
        self.digest_size() * 2
    }

    pub fn base32_len(&self) -> usize {
        base32::encode_len(self.digest_size())
    }

    pub fn base64_len(&self) -> usize {
        BASE64.encode_len(self.digest_size())
    }

    /// Digest `data` with this algorithm.
    pub fn digest(&self, data: impl AsRef<[u8]>) -> Hash {
        let digest = match self {
            HashAlgo::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgo::Sha512 => Sha512::digest(data).to_vec(),
        };
        Hash { algo: *self, digest }
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgo {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(HashAlgo::Sha256),
            "sha512" => Ok(HashAlgo::Sha512),
            _ => Err(ParseHashError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// A digest tagged with its algorithm.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash {
    pub algo: HashAlgo,
    digest: Vec<u8>,
}

impl Hash {
    pub fn new(algo: HashAlgo, digest: Vec<u8>) -> Result<Self, ParseHashError> {
        if digest.len() != algo.digest_size() {
            return Err(ParseHashError::InvalidDigestSize {
                algo: algo.name(),
                expected: algo.digest_size(),
                actual: digest.len(),
            });
        }
        Ok(Hash { algo, digest })
    }

    pub fn sha256(digest: [u8; 32]) -> Self {
        Hash {
            algo: HashAlgo::Sha256,
            digest: digest.to_vec(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.digest
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }

    pub fn to_base32(&self) -> String {
        base32::encode(&self.digest)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.digest)
    }

    /// Parse `algo:<digest>`, accepting base-16, base-32 or base-64
    /// digests (the encoding is determined by length).
    pub fn parse(s: &str) -> Result<Self, ParseHashError> {
        let (algo_s, digest_s) = s
            .split_once(':')
            .ok_or_else(|| ParseHashError::InvalidFormat(s.to_string()))?;
        let algo: HashAlgo = algo_s.parse()?;
        Self::parse_digest(algo, digest_s)
    }

    /// Parse a bare digest for a known algorithm.
    pub fn parse_digest(algo: HashAlgo, digest_s: &str) -> Result<Self, ParseHashError> {
        let digest = if digest_s.len() == algo.base16_len() {
            hex::decode(digest_s).map_err(|e| ParseHashError::Base16(e.to_string()))?
        } else if digest_s.len() == algo.base32_len() {
            base32::decode(digest_s.as_bytes()).map_err(|e| ParseHashError::Base32(e.to_string()))?
        } else if digest_s.len() == algo.base64_len() {
            BASE64
                .decode(digest_s.as_bytes())
                .map_err(|e| ParseHashError::Base64(e.to_string()))?
        } else {
            return Err(ParseHashError::InvalidDigestLength {
                algo: algo.name(),
                actual: digest_s.len(),
            });
        };
        Self::new(algo, digest)
    }
}

impl fmt::Display for Hash {
    /// `algo:<base32>`, the store's preferred rendering.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo, self.to_base32())
    }
}

impl FromStr for Hash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Error)]
pub enum ParseHashError {
    #[error("unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("invalid hash format: {0}")]
    InvalidFormat(String),

    #[error("invalid digest size for {algo}: expected {expected}, got {actual}")]
    InvalidDigestSize {
        algo: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("digest length {actual} matches no known encoding of {algo}")]
    InvalidDigestLength { algo: &'static str, actual: usize },

    #[error("base16 decode error: {0}")]
    Base16(String),

    #[error("base32 decode error: {0}")]
    Base32(String),

    #[error("base64 decode error: {0}")]
    Base64(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn known_encodings() {
        // sha256 of "hello world"
        let digest = hex!("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
        let hash = Hash::new(HashAlgo::Sha256, digest.to_vec()).unwrap();

        assert_eq!(
            hash.to_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            hash.to_base32(),
            "1sfdxziarxw8j3p80lvswgpq9i7smdyxmmsj5sjhhgjdjfwjfkdr"
        );
        assert_eq!(hash.to_base64(), "uU0nuZNNPgilLlLX2n2r+sSE7+N6U4DukIj3rOLvzek=");
    }

    #[test]
    fn parse_all_encodings() {
        let hex_s = "ab00922634303a8b47680f96752c3ff1017a21cf84e6b0b4f28fc3f2346da666";
        let h = Hash::parse(&format!("sha256:{hex_s}")).unwrap();
        let b32 = h.to_base32();
        let b64 = h.to_base64();

        assert_eq!(b32, "0rm6dlsg5hwgyasb1rl4rwhpl0gi7wn7b5hgd13qnfih6hk9405b");
        assert_eq!(h, Hash::parse(&format!("sha256:{b32}")).unwrap());
        assert_eq!(h, Hash::parse(&format!("sha256:{b64}")).unwrap());
    }

    #[test]
    fn parse_rejects() {
        assert!(Hash::parse("sha256-nocolon").is_err());
        assert!(Hash::parse("md5:0123").is_err());
        assert!(Hash::parse("sha256:abcd").is_err());
    }

    #[test]
    fn digest_helper() {
        let h = HashAlgo::Sha256.digest("abc");
        assert_eq!(
            h.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
