// SPDX-License-Identifier: MIT

//! Placeholder strings for not-yet-known output paths.
//!
//! Two flavors exist:
//!
//! - per-output placeholders of the *current* derivation, substituted by
//!   the builder driver with the concrete output path (or a sentinel for
//!   floating CA outputs) just before launch;
//! - unknown-CA placeholders for outputs of content-addressed *input*
//!   derivations, whose paths are only known after those inputs are
//!   realized. The scheduler substitutes these once the dependency's
//!   realization is recorded.
//!
//! A placeholder is a `/`-prefixed base-32 sha256 of a domain-separated
//! clear text, so it can never collide with a real store path (real
//! paths carry the store directory prefix) while still looking path-like
//! to builders.

use sha2::{Digest as _, Sha256};

use crate::base32;
use crate::content_address::output_path_name;
use crate::store_path::StorePath;

/// Placeholder for an output of the derivation being built.
pub fn hash_placeholder(output_name: &str) -> String {
    let digest = Sha256::digest(format!("zb-output:{output_name}"));
    format!("/{}", base32::encode(&digest))
}

/// Placeholder for an output of a content-addressed input derivation.
pub fn unknown_ca_placeholder(drv_path: &StorePath, output_name: &str) -> String {
    let drv_name = drv_path.name().strip_suffix(".drv").unwrap_or(drv_path.name());
    let clear_text = format!(
        "zb-upstream-output:{}:{}",
        drv_path.digest_string(),
        output_path_name(drv_name, output_name),
    );
    let digest = Sha256::digest(clear_text);
    format!("/{}", base32::encode(&digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_stable_and_distinct() {
        let out = hash_placeholder("out");
        assert_eq!(out, hash_placeholder("out"));
        assert_ne!(out, hash_placeholder("dev"));
        assert!(out.starts_with('/'));
        assert_eq!(1 + 52, out.len());
    }

    #[test]
    fn unknown_ca_placeholder_depends_on_drv_and_output() {
        let drv: StorePath = "00000000000000000000000000000000-foo.drv".parse().unwrap();
        let other: StorePath = "11111111111111111111111111111111-foo.drv".parse().unwrap();

        let a = unknown_ca_placeholder(&drv, "out");
        assert_eq!(a, unknown_ca_placeholder(&drv, "out"));
        assert_ne!(a, unknown_ca_placeholder(&drv, "dev"));
        assert_ne!(a, unknown_ca_placeholder(&other, "out"));
    }

    #[test]
    fn flavors_never_collide() {
        let drv: StorePath = "00000000000000000000000000000000-out.drv".parse().unwrap();
        assert_ne!(hash_placeholder("out"), unknown_ca_placeholder(&drv, "out"));
    }
}
