// SPDX-License-Identifier: MIT

//! Signing keys, verifying keys and detached signatures.
//!
//! Key formats are identified by a string tag; `ed25519` is the only
//! format this daemon emits, and the one every implementation must
//! accept. A key file stores `{ "format": ..., "key": <base64> }` where
//! the key is a 32-byte seed or a 64-byte keypair. Trusted public keys
//! arrive from configuration as `{ "format": ..., "publicKey": <base64> }`.
//!
//! Keys have no user-facing names; the key id carried in signatures is
//! the base-64 public key itself.

use std::fmt;
use std::str::FromStr;

use data_encoding::BASE64;
use ed25519_dalek::{Signer as _, Verifier as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    Ed25519,
}

impl fmt::Display for KeyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyFormat::Ed25519 => "ed25519",
        })
    }
}

impl FromStr for KeyFormat {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ed25519" => Ok(KeyFormat::Ed25519),
            other => Err(SignatureError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("unknown key format {0:?}")]
    UnknownFormat(String),
    #[error("missing ':' separator in signature")]
    MissingSeparator,
    #[error("invalid base64: {0}")]
    Base64(String),
    #[error("invalid key length: expected 32 or 64 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("invalid signature length: expected 64 bytes, got {0}")]
    InvalidSignatureLength(usize),
    #[error("invalid ed25519 key: {0}")]
    InvalidKey(ed25519_dalek::SignatureError),
    #[error("invalid key file: {0}")]
    InvalidKeyFile(String),
}

/// A detached signature together with the id of the key that made it.
///
/// Rendered `keyId:base64(signature)`, the form stored in object info
/// and realization rows.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct KeyedSignature {
    pub format: KeyFormat,
    pub key_id: String,
    bytes: [u8; 64],
}

impl KeyedSignature {
    pub fn bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    pub fn parse(s: &str) -> Result<Self, SignatureError> {
        let (key_id, sig_b64) = s.split_once(':').ok_or(SignatureError::MissingSeparator)?;
        let decoded = BASE64
            .decode(sig_b64.as_bytes())
            .map_err(|e| SignatureError::Base64(e.to_string()))?;
        let bytes: [u8; 64] = decoded
            .try_into()
            .map_err(|v: Vec<u8>| SignatureError::InvalidSignatureLength(v.len()))?;
        Ok(KeyedSignature {
            format: KeyFormat::Ed25519,
            key_id: key_id.to_string(),
            bytes,
        })
    }
}

impl fmt::Display for KeyedSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key_id, BASE64.encode(&self.bytes))
    }
}

/// Serialized key file contents.
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyFile {
    pub format: String,
    /// Base-64 secret key (32-byte seed or 64-byte keypair).
    pub key: String,
}

/// A private signing key.
#[derive(Clone)]
pub struct SigningKey {
    key: ed25519_dalek::SigningKey,
}

impl SigningKey {
    /// Parse the JSON key file format.
    pub fn from_key_file(contents: &[u8]) -> Result<Self, SignatureError> {
        let file: KeyFile = serde_json::from_slice(contents)
            .map_err(|e| SignatureError::InvalidKeyFile(e.to_string()))?;
        let _format: KeyFormat = file.format.parse()?;

        let raw = BASE64
            .decode(file.key.trim().as_bytes())
            .map_err(|e| SignatureError::Base64(e.to_string()))?;
        let key = match raw.len() {
            32 => {
                let seed: [u8; 32] = raw.try_into().expect("length checked");
                ed25519_dalek::SigningKey::from_bytes(&seed)
            }
            64 => {
                let pair: [u8; 64] = raw.try_into().expect("length checked");
                ed25519_dalek::SigningKey::from_keypair_bytes(&pair)
                    .map_err(SignatureError::InvalidKey)?
            }
            n => return Err(SignatureError::InvalidKeyLength(n)),
        };

        Ok(SigningKey { key })
    }

    /// The id signatures made by this key carry: the base-64 public key.
    pub fn key_id(&self) -> String {
        BASE64.encode(self.key.verifying_key().as_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            format: KeyFormat::Ed25519,
            key: self.key.verifying_key(),
        }
    }

    pub fn sign(&self, msg: &[u8]) -> KeyedSignature {
        KeyedSignature {
            format: KeyFormat::Ed25519,
            key_id: self.key_id(),
            bytes: self.key.sign(msg).to_bytes(),
        }
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey").field("key_id", &self.key_id()).finish()
    }
}

/// Configuration entry for a trusted public key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyEntry {
    pub format: String,
    pub public_key: String,
}

/// A public key trusted for realization records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyingKey {
    pub format: KeyFormat,
    key: ed25519_dalek::VerifyingKey,
}

impl VerifyingKey {
    pub fn from_entry(entry: &PublicKeyEntry) -> Result<Self, SignatureError> {
        let format: KeyFormat = entry.format.parse()?;
        let raw = BASE64
            .decode(entry.public_key.trim().as_bytes())
            .map_err(|e| SignatureError::Base64(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|v: Vec<u8>| SignatureError::InvalidKeyLength(v.len()))?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&bytes)
            .map_err(SignatureError::InvalidKey)?;
        Ok(VerifyingKey { format, key })
    }

    pub fn key_id(&self) -> String {
        BASE64.encode(self.key.as_bytes())
    }

    /// Whether `sig` is a valid signature by this key over `msg`.
    pub fn verify(&self, msg: &[u8], sig: &KeyedSignature) -> bool {
        let signature = ed25519_dalek::Signature::from_bytes(sig.bytes());
        self.key.verify(msg, &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SigningKey {
        // 32 zero bytes is a valid ed25519 seed; fine for tests.
        let file = format!(
            r#"{{ "format": "ed25519", "key": "{}" }}"#,
            BASE64.encode(&[0u8; 32])
        );
        SigningKey::from_key_file(file.as_bytes()).unwrap()
    }

    #[test]
    fn sign_verify_roundtrip() {
        let sk = test_key();
        let sig = sk.sign(b"fingerprint");
        assert!(sk.verifying_key().verify(b"fingerprint", &sig));
        assert!(!sk.verifying_key().verify(b"other message", &sig));
    }

    #[test]
    fn signature_text_roundtrip() {
        let sk = test_key();
        let sig = sk.sign(b"msg");
        let text = sig.to_string();
        let parsed = KeyedSignature::parse(&text).unwrap();
        assert_eq!(sig, parsed);
        assert_eq!(sig.key_id, sk.key_id());
    }

    #[test]
    fn wrong_key_rejects() {
        let sk = test_key();
        let other_file = format!(
            r#"{{ "format": "ed25519", "key": "{}" }}"#,
            BASE64.encode(&[7u8; 32])
        );
        let other = SigningKey::from_key_file(other_file.as_bytes()).unwrap();

        let sig = sk.sign(b"msg");
        assert!(!other.verifying_key().verify(b"msg", &sig));
    }

    #[test]
    fn key_file_rejects() {
        assert!(matches!(
            SigningKey::from_key_file(br#"{ "format": "rsa", "key": "AAAA" }"#),
            Err(SignatureError::UnknownFormat(_))
        ));
        assert!(SigningKey::from_key_file(b"not json").is_err());
        let short = format!(r#"{{ "format": "ed25519", "key": "{}" }}"#, BASE64.encode(&[0u8; 5]));
        assert!(matches!(
            SigningKey::from_key_file(short.as_bytes()),
            Err(SignatureError::InvalidKeyLength(5))
        ));
    }

    #[test]
    fn public_key_entry_roundtrip() {
        let sk = test_key();
        let entry = PublicKeyEntry {
            format: "ed25519".into(),
            public_key: sk.key_id(),
        };
        let vk = VerifyingKey::from_entry(&entry).unwrap();
        assert_eq!(vk, sk.verifying_key());

        let bad = PublicKeyEntry {
            format: "pgp".into(),
            public_key: sk.key_id(),
        };
        assert!(VerifyingKey::from_entry(&bad).is_err());
    }
}
