// SPDX-License-Identifier: MIT

//! Content addressing modulo self-references.
//!
//! An object's bytes may contain its own path digest (binaries that embed
//! their install location). To give such objects a stable content address,
//! hashing is done with every occurrence of the digest masked out, and the
//! offsets of the occurrences are recorded so the digest can later be
//! rewritten in place without a second scan.
//!
//! The scanner is fed the canonical archive serialization, so offsets are
//! archive offsets, valid against the same byte stream the hash covers.

use std::io::{Read, Seek, SeekFrom, Write};

use memchr::memmem;
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::content_address::{CaMethod, ContentAddress};
use crate::hash::Hash;
use crate::store_path::ENCODED_DIGEST_SIZE;

const CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SelfRefError {
    #[error("original digest must be {ENCODED_DIGEST_SIZE} characters, got {0}")]
    BadDigestLength(usize),
    #[error("replacement digest must be {ENCODED_DIGEST_SIZE} characters, got {0}")]
    BadReplacementLength(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Options for [`source_sha256_content_address`].
pub struct SourceHashOpts {
    /// The rendered digest whose occurrences are masked (the sentinel or
    /// expected digest the builder saw).
    pub original_digest: String,
    /// Flat or recursive; `Text` is not a source mode.
    pub method: CaMethod,
}

/// Everything needed to rewrite the stream later without re-scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfRefAnalysis {
    /// Byte offsets (into the hashed stream) of each digest occurrence.
    pub offsets: Vec<u64>,
    /// The digest that was found at those offsets.
    pub original_digest: String,
}

impl SelfRefAnalysis {
    pub fn has_self_refs(&self) -> bool {
        !self.offsets.is_empty()
    }
}

/// Stream `reader` once, hashing it with every occurrence of
/// `opts.original_digest` replaced by zero bytes, and recording the
/// occurrence offsets.
///
/// Occurrences are found across arbitrary read boundaries. Overlapping
/// occurrences cannot arise: the digest alphabet never lets a digest be
/// a proper prefix of a shifted copy of itself at these lengths, and the
/// scanner advances past each match.
pub fn source_sha256_content_address(
    mut reader: impl Read,
    opts: &SourceHashOpts,
) -> Result<(ContentAddress, SelfRefAnalysis), SelfRefError> {
    let needle = opts.original_digest.as_bytes();
    if needle.len() != ENCODED_DIGEST_SIZE {
        return Err(SelfRefError::BadDigestLength(needle.len()));
    }
    let finder = memmem::Finder::new(needle);

    let mut hasher = Sha256::new();
    let mut offsets: Vec<u64> = Vec::new();

    // `pending` holds raw bytes not yet hashed; `emitted` counts bytes
    // already fed to the hasher, i.e. the stream offset of pending[0].
    let mut pending: Vec<u8> = Vec::with_capacity(CHUNK + needle.len());
    let mut emitted: u64 = 0;
    let mut buf = vec![0u8; CHUNK];

    loop {
        let n = reader.read(&mut buf)?;
        let eof = n == 0;
        pending.extend_from_slice(&buf[..n]);

        // Find every full occurrence within `pending`, then zero it in
        // place. Masked bytes can never re-match (the digest alphabet
        // contains no NUL), and an occurrence straddling the retained
        // tail has not fully arrived yet and is found on a later round.
        let matches: Vec<usize> = finder.find_iter(&pending).collect();
        for pos in matches {
            offsets.push(emitted + pos as u64);
            pending[pos..pos + needle.len()].fill(0);
        }

        if eof {
            hasher.update(&pending);
            break;
        }

        // Keep the last needle-length - 1 bytes so a straddling
        // occurrence can still be detected next round. Any complete
        // match ends at or before the emit boundary + needle length,
        // and was already masked above.
        let keep = needle.len() - 1;
        if pending.len() > keep {
            let emit = pending.len() - keep;
            hasher.update(&pending[..emit]);
            pending.drain(..emit);
            emitted += emit as u64;
        }
    }

    let hash = Hash::sha256(hasher.finalize().into());
    let ca = match opts.method {
        CaMethod::Flat => ContentAddress::Flat(hash),
        _ => ContentAddress::Recursive(hash),
    };

    Ok((
        ca,
        SelfRefAnalysis {
            offsets,
            original_digest: opts.original_digest.clone(),
        },
    ))
}

/// Overwrite each recorded occurrence with `new_digest`.
///
/// `base_offset` shifts the analysis offsets, for streams embedded inside
/// a larger file (an archive inside an export frame).
pub fn rewrite(
    target: &mut (impl Seek + Write),
    base_offset: u64,
    new_digest: &str,
    analysis: &SelfRefAnalysis,
) -> Result<(), SelfRefError> {
    if new_digest.len() != ENCODED_DIGEST_SIZE {
        return Err(SelfRefError::BadReplacementLength(new_digest.len()));
    }

    for offset in &analysis.offsets {
        target.seek(SeekFrom::Start(base_offset + offset))?;
        target.write_all(new_digest.as_bytes())?;
    }
    target.flush()?;

    Ok(())
}

/// Convenience used by tests and the realize engine: hash of the stream
/// with a different digest substituted at the recorded offsets, without
/// touching the original bytes.
pub fn masked_sha256(data: &[u8], analysis: &SelfRefAnalysis) -> Hash {
    let mut masked = data.to_vec();
    for offset in &analysis.offsets {
        let start = *offset as usize;
        masked[start..start + ENCODED_DIGEST_SIZE].fill(0);
    }
    Hash::sha256(Sha256::digest(&masked).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgo;
    use std::io::Cursor;

    const DIGEST_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const DIGEST_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn opts() -> SourceHashOpts {
        SourceHashOpts {
            original_digest: DIGEST_A.to_string(),
            method: CaMethod::Recursive,
        }
    }

    #[test]
    fn records_every_occurrence() {
        let data = format!("pre {DIGEST_A} mid {DIGEST_A} post");
        let (_ca, analysis) =
            source_sha256_content_address(Cursor::new(data.as_bytes()), &opts()).unwrap();
        assert_eq!(vec![4, 41], analysis.offsets);
    }

    #[test]
    fn no_occurrences_is_a_plain_hash() {
        let data = b"no digests here";
        let (ca, analysis) = source_sha256_content_address(Cursor::new(&data[..]), &opts()).unwrap();
        assert!(analysis.offsets.is_empty());
        assert_eq!(ca.hash(), &HashAlgo::Sha256.digest(&data[..]));
    }

    /// The hash is computed modulo the digest: any digest value at the
    /// recorded offsets produces the same content address.
    #[test]
    fn hash_is_invariant_under_rewrite() {
        let data = format!("exec {DIGEST_A}/bin/tool --flag");
        let (ca_before, analysis) =
            source_sha256_content_address(Cursor::new(data.as_bytes()), &opts()).unwrap();

        let mut rewritten = Cursor::new(data.clone().into_bytes());
        rewrite(&mut rewritten, 0, DIGEST_B, &analysis).unwrap();
        let rewritten = rewritten.into_inner();
        assert_eq!(format!("exec {DIGEST_B}/bin/tool --flag").as_bytes(), &rewritten[..]);

        let reopts = SourceHashOpts {
            original_digest: DIGEST_B.to_string(),
            method: CaMethod::Recursive,
        };
        let (ca_after, analysis_after) =
            source_sha256_content_address(Cursor::new(&rewritten[..]), &reopts).unwrap();
        assert_eq!(analysis.offsets, analysis_after.offsets);
        assert_eq!(ca_before, ca_after);
    }

    /// Occurrences straddling read boundaries are still found once.
    #[test]
    fn finds_occurrences_across_chunk_boundaries() {
        struct OneByte<'a>(&'a [u8], usize);
        impl Read for OneByte<'_> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.1 >= self.0.len() {
                    return Ok(0);
                }
                buf[0] = self.0[self.1];
                self.1 += 1;
                Ok(1)
            }
        }

        let data = format!("xy{DIGEST_A}z");
        let (ca_chunked, analysis) =
            source_sha256_content_address(OneByte(data.as_bytes(), 0), &opts()).unwrap();
        assert_eq!(vec![2], analysis.offsets);

        let (ca_whole, _) =
            source_sha256_content_address(Cursor::new(data.as_bytes()), &opts()).unwrap();
        assert_eq!(ca_whole, ca_chunked);
    }

    #[test]
    fn rewrite_validates_replacement_length() {
        let analysis = SelfRefAnalysis {
            offsets: vec![0],
            original_digest: DIGEST_A.to_string(),
        };
        let mut target = Cursor::new(vec![0u8; 40]);
        let err = rewrite(&mut target, 0, "short", &analysis).unwrap_err();
        assert!(matches!(err, SelfRefError::BadReplacementLength(5)));
    }

    #[test]
    fn base_offset_shifts_rewrites() {
        let analysis = SelfRefAnalysis {
            offsets: vec![0],
            original_digest: DIGEST_A.to_string(),
        };
        let mut buf = vec![b'.'; 8 + ENCODED_DIGEST_SIZE];
        let mut target = Cursor::new(std::mem::take(&mut buf));
        rewrite(&mut target, 8, DIGEST_B, &analysis).unwrap();
        let out = target.into_inner();
        assert_eq!(&out[..8], b"........");
        assert_eq!(&out[8..], DIGEST_B.as_bytes());
    }
}
