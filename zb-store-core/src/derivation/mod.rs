// SPDX-License-Identifier: MIT

//! The derivation model: a pure build recipe.
//!
//! Derivations are serialized to a deterministic ATerm-style textual form
//! and stored as ordinary store objects with a `.drv` name suffix. Their
//! store path is input-addressed over that canonical form. Output paths
//! for input-addressed outputs are likewise a function of the canonical
//! bytes, which therefore never contain computed input-addressed paths;
//! those output fields serialize empty.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::content_address::{
    BuildStorePathError, CaMethod, ContentAddress, fixed_ca_output_path,
    input_addressed_output_path, output_path_name, text_path, PathRefs,
};
use crate::hash::HashAlgo;
use crate::store_path::{StoreDir, StorePath, StorePathError, validate_name};

mod aterm;
pub mod placeholder;

pub use aterm::ParseDrvError;

/// How one declared output's store path comes to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSpec {
    /// Path is a function of the derivation's canonical bytes and the
    /// output name.
    InputAddressed,
    /// Path is pinned by a content-address fingerprint known up front.
    CaFixed(ContentAddress),
    /// Only the hash mode and algorithm are fixed; the path is
    /// discovered by hashing the realized output.
    CaFloating { method: CaMethod, algo: HashAlgo },
}

impl OutputSpec {
    pub fn is_fixed(&self) -> bool {
        matches!(self, OutputSpec::CaFixed(_))
    }

    pub fn is_content_addressed(&self) -> bool {
        !matches!(self, OutputSpec::InputAddressed)
    }
}

/// A pure build recipe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Derivation {
    /// Human label; output path names derive from it.
    pub name: String,
    /// Target system triple, e.g. `x86_64-linux`.
    pub system: String,
    /// Path to the executable invoked, typically a store path.
    pub builder: String,
    /// Ordered arguments to the builder.
    pub args: Vec<String>,
    /// Builder environment; insertion order is irrelevant.
    pub env: BTreeMap<String, String>,
    /// Store paths referenced as raw inputs.
    pub input_sources: BTreeSet<StorePath>,
    /// Derivation path → output names required from it.
    pub input_derivations: BTreeMap<StorePath, BTreeSet<String>>,
    /// Output name → output-type spec.
    pub outputs: BTreeMap<String, OutputSpec>,
}

#[derive(Debug, Error)]
pub enum DerivationError {
    #[error("derivation has no outputs")]
    NoOutputs,
    #[error("invalid output name {0:?}")]
    InvalidOutputName(String),
    #[error("derivation has no builder")]
    MissingBuilder,
    #[error("derivation has no system")]
    MissingSystem,
    #[error("invalid derivation name: {0}")]
    InvalidName(#[source] StorePathError),
    #[error("invalid output path: {0}")]
    InvalidOutputPath(#[from] BuildStorePathError),
    #[error("invalid store path: {0}")]
    InvalidStorePath(#[from] StorePathError),
}

impl Derivation {
    /// Structural checks every derivation must pass before it is stored
    /// or realized.
    pub fn validate(&self) -> Result<(), DerivationError> {
        validate_name(&self.name).map_err(DerivationError::InvalidName)?;
        if self.outputs.is_empty() {
            return Err(DerivationError::NoOutputs);
        }
        for output_name in self.outputs.keys() {
            if output_name.is_empty()
                || !output_name
                    .bytes()
                    .all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_')
            {
                return Err(DerivationError::InvalidOutputName(output_name.clone()));
            }
        }
        if self.builder.is_empty() {
            return Err(DerivationError::MissingBuilder);
        }
        if self.system.is_empty() {
            return Err(DerivationError::MissingSystem);
        }
        Ok(())
    }

    /// The deterministic textual form this derivation is stored as.
    pub fn marshal(&self, store_dir: &StoreDir) -> Vec<u8> {
        aterm::marshal(self, store_dir)
    }

    /// Parse the textual form back. `name` is the derivation name, which
    /// the caller recovers from the `.drv` store path.
    pub fn parse(store_dir: &StoreDir, input: &[u8], name: &str) -> Result<Self, ParseDrvError> {
        aterm::parse(store_dir, input, name)
    }

    /// The `.drv` store path: input-addressed over the canonical bytes,
    /// referencing all input sources and input derivations.
    pub fn derivation_path(&self, store_dir: &StoreDir) -> Result<StorePath, DerivationError> {
        let references: BTreeSet<&StorePath> = self
            .input_sources
            .iter()
            .chain(self.input_derivations.keys())
            .collect();

        Ok(text_path(
            store_dir,
            &format!("{}.drv", self.name),
            self.marshal(store_dir),
            references,
        )?)
    }

    /// The store path of a declared output, or `None` for floating CA
    /// outputs (known only after the build).
    pub fn output_path(
        &self,
        store_dir: &StoreDir,
        output_name: &str,
    ) -> Result<Option<StorePath>, DerivationError> {
        match self.outputs.get(output_name) {
            None => Err(DerivationError::InvalidOutputName(output_name.to_string())),
            Some(OutputSpec::CaFixed(ca)) => Ok(Some(fixed_ca_output_path(
                store_dir,
                &output_path_name(&self.name, output_name),
                ca,
                &PathRefs::default(),
            )?)),
            Some(OutputSpec::InputAddressed) => Ok(Some(input_addressed_output_path(
                store_dir,
                &self.marshal(store_dir),
                &self.name,
                output_name,
            )?)),
            Some(OutputSpec::CaFloating { .. }) => Ok(None),
        }
    }

    /// Placeholder for one of this derivation's own outputs, inserted
    /// into env/args where the final path is not yet known.
    pub fn hash_placeholder(&self, output_name: &str) -> String {
        placeholder::hash_placeholder(output_name)
    }

    /// Iterate `(input derivation path, output name, placeholder)` for
    /// every input-derivation output this derivation consumes. The
    /// placeholder is the unknown-CA form the scheduler substitutes once
    /// the input is realized.
    pub fn input_derivation_outputs(
        &self,
    ) -> impl Iterator<Item = (&StorePath, &str, String)> + '_ {
        self.input_derivations.iter().flat_map(|(drv_path, outs)| {
            outs.iter().map(move |out| {
                (
                    drv_path,
                    out.as_str(),
                    placeholder::unknown_ca_placeholder(drv_path, out),
                )
            })
        })
    }
}
