// SPDX-License-Identifier: MIT

//! Realization records for content-addressed outputs.
//!
//! A realization links `(derivation path, output name)` to the store path
//! the build produced, together with the realizations of the
//! content-addressed dependencies it was built against. The record is
//! signed over a canonical fingerprint; distinct signers may register
//! distinct records for the same output, and the engine substitutes a
//! record only when a trusted signer's signature verifies.

use std::collections::BTreeMap;
use std::fmt;

use crate::signature::{KeyedSignature, SigningKey, VerifyingKey};
use crate::store_path::{StoreDir, StorePath};

/// One output slot of a derivation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DrvOutput {
    pub drv_path: StorePath,
    pub output_name: String,
}

impl fmt::Display for DrvOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.drv_path, self.output_name)
    }
}

/// A realized content-addressed output plus its dependency realizations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Realisation {
    pub id: DrvOutput,
    pub output_path: StorePath,
    /// Dependency output slots and the paths they resolved to when this
    /// record was produced.
    pub dependencies: BTreeMap<DrvOutput, StorePath>,
}

impl Realisation {
    /// Canonical serialization covered by signatures.
    ///
    /// `1;{drv};{output};{path};{dep₁,dep₂,…}` with absolute paths and
    /// deps rendered `{drv}!{out}={path}` in their natural sort order.
    pub fn fingerprint(&self, store_dir: &StoreDir) -> Vec<u8> {
        let mut s = String::from("1;");
        s.push_str(&store_dir.display_path(&self.id.drv_path));
        s.push(';');
        s.push_str(&self.id.output_name);
        s.push(';');
        s.push_str(&store_dir.display_path(&self.output_path));
        s.push(';');
        for (i, (dep, path)) in self.dependencies.iter().enumerate() {
            if i > 0 {
                s.push(',');
            }
            s.push_str(&store_dir.display_path(&dep.drv_path));
            s.push('!');
            s.push_str(&dep.output_name);
            s.push('=');
            s.push_str(&store_dir.display_path(path));
        }
        s.into_bytes()
    }

    pub fn sign(&self, store_dir: &StoreDir, key: &SigningKey) -> KeyedSignature {
        key.sign(&self.fingerprint(store_dir))
    }

    /// Whether `sig` is a valid signature over this record by any of the
    /// given keys.
    pub fn verify(
        &self,
        store_dir: &StoreDir,
        sig: &KeyedSignature,
        keys: &[VerifyingKey],
    ) -> bool {
        let fingerprint = self.fingerprint(store_dir);
        keys.iter().any(|k| k.verify(&fingerprint, sig))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::SigningKey;
    use data_encoding::BASE64;

    fn key(seed: u8) -> SigningKey {
        let file = format!(
            r#"{{ "format": "ed25519", "key": "{}" }}"#,
            BASE64.encode(&[seed; 32])
        );
        SigningKey::from_key_file(file.as_bytes()).unwrap()
    }

    fn example() -> Realisation {
        let dep = DrvOutput {
            drv_path: "11111111111111111111111111111111-dep.drv".parse().unwrap(),
            output_name: "out".into(),
        };
        Realisation {
            id: DrvOutput {
                drv_path: "00000000000000000000000000000000-foo.drv".parse().unwrap(),
                output_name: "out".into(),
            },
            output_path: "22222222222222222222222222222222-foo".parse().unwrap(),
            dependencies: BTreeMap::from([(
                dep,
                "33333333333333333333333333333333-dep".parse().unwrap(),
            )]),
        }
    }

    #[test]
    fn fingerprint_is_canonical() {
        let dir = StoreDir::default();
        let fp = String::from_utf8(example().fingerprint(&dir)).unwrap();
        assert_eq!(
            "1;/zb/store/00000000000000000000000000000000-foo.drv;out;\
             /zb/store/22222222222222222222222222222222-foo;\
             /zb/store/11111111111111111111111111111111-dep.drv!out=\
             /zb/store/33333333333333333333333333333333-dep",
            fp
        );
    }

    #[test]
    fn sign_and_verify() {
        let dir = StoreDir::default();
        let trusted = key(1);
        let untrusted = key(2);

        let record = example();
        let sig = record.sign(&dir, &trusted);

        assert!(record.verify(&dir, &sig, &[trusted.verifying_key()]));
        assert!(!record.verify(&dir, &sig, &[untrusted.verifying_key()]));
        assert!(record.verify(
            &dir,
            &sig,
            &[untrusted.verifying_key(), trusted.verifying_key()]
        ));

        // A different realized path invalidates the signature.
        let mut tampered = record.clone();
        tampered.output_path = "44444444444444444444444444444444-foo".parse().unwrap();
        assert!(!tampered.verify(&dir, &sig, &[trusted.verifying_key()]));
    }
}
