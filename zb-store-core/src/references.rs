// SPDX-License-Identifier: MIT

//! Streaming reference scanning for store objects.
//!
//! After a build, the daemon needs to know which store paths the output
//! mentions. [`RefScanSink`] is fed arbitrary byte chunks (the archive
//! stream, while it is being hashed anyway) and finds candidate path
//! digests.
//!
//! The scan slides a 32-byte window over the input, validating characters
//! right-to-left against the digest alphabet. An invalid character at
//! window offset `j` lets the scan skip ahead `j + 1` positions, so on
//! binary data the cost is O(n/32) amortized, independent of the number
//! of candidates. Valid windows are looked up in a hash set.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::base32::is_alphabet_char;
use crate::store_path::{ENCODED_DIGEST_SIZE, StorePath};

const HASH_LEN: usize = ENCODED_DIGEST_SIZE;

/// A streaming scanner over NAR chunks for a fixed candidate set.
pub struct RefScanSink {
    /// Digest strings still being looked for (removed on first match).
    pending: HashSet<[u8; HASH_LEN]>,
    /// Digest strings found so far.
    seen: HashSet<[u8; HASH_LEN]>,
    /// Maps digests back to candidate paths for result construction.
    back_map: HashMap<[u8; HASH_LEN], StorePath>,
    /// Trailing bytes of the previous chunk, for boundary matches.
    tail: Vec<u8>,
}

impl RefScanSink {
    /// `candidates` are the paths to look for (typically the build's
    /// input closure plus sibling outputs); `self_path` additionally
    /// detects self-references.
    pub fn new<'a>(
        candidates: impl IntoIterator<Item = &'a StorePath>,
        self_path: Option<&'a StorePath>,
    ) -> Self {
        let mut pending = HashSet::new();
        let mut back_map = HashMap::new();

        for sp in candidates.into_iter().chain(self_path) {
            let digest = digest_bytes(sp);
            if pending.insert(digest) {
                back_map.insert(digest, sp.clone());
            }
        }

        Self {
            pending,
            seen: HashSet::new(),
            back_map,
            tail: Vec::with_capacity(HASH_LEN),
        }
    }

    /// Feed one chunk. Boundary-straddling digests are matched through
    /// a retained tail of the previous chunk.
    pub fn feed(&mut self, data: &[u8]) {
        if self.pending.is_empty() {
            return;
        }

        let tail_len = data.len().min(HASH_LEN);

        if !self.tail.is_empty() {
            let mut overlap = self.tail.clone();
            overlap.extend_from_slice(&data[..tail_len]);
            search(&overlap, &mut self.pending, &mut self.seen);
        }

        search(data, &mut self.pending, &mut self.seen);

        // Rebuild the tail: at most HASH_LEN bytes, suffix of old tail
        // plus suffix of the new chunk.
        let rest = HASH_LEN - tail_len;
        if rest < self.tail.len() {
            self.tail.drain(..self.tail.len() - rest);
        }
        self.tail.extend_from_slice(&data[data.len() - tail_len..]);
    }

    /// The candidate paths whose digests appeared in the stream.
    pub fn found_paths(&self) -> BTreeSet<StorePath> {
        self.seen
            .iter()
            .filter_map(|d| self.back_map.get(d).cloned())
            .collect()
    }
}

fn digest_bytes(sp: &StorePath) -> [u8; HASH_LEN] {
    let s = sp.digest_string();
    let mut buf = [0u8; HASH_LEN];
    buf.copy_from_slice(s.as_bytes());
    buf
}

fn search(data: &[u8], pending: &mut HashSet<[u8; HASH_LEN]>, seen: &mut HashSet<[u8; HASH_LEN]>) {
    if data.len() < HASH_LEN {
        return;
    }

    let mut i = 0;
    'outer: while i + HASH_LEN <= data.len() {
        // Validate the window right-to-left; skip past the first
        // invalid character.
        for j in (0..HASH_LEN).rev() {
            if !is_alphabet_char(data[i + j]) {
                i += j + 1;
                continue 'outer;
            }
        }

        let window: [u8; HASH_LEN] = data[i..i + HASH_LEN].try_into().expect("window length");
        if pending.remove(&window) {
            seen.insert(window);
        }

        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(digest_char: char, name: &str) -> StorePath {
        let digest: String = std::iter::repeat_n(digest_char, 32).collect();
        format!("{digest}-{name}").parse().unwrap()
    }

    #[test]
    fn finds_input_reference() {
        let input = path('a', "input");
        let haystack = format!("some content /zb/store/{}-input more", input.digest_string());

        let mut sink = RefScanSink::new([&input], None);
        sink.feed(haystack.as_bytes());
        assert!(sink.found_paths().contains(&input));
    }

    #[test]
    fn finds_self_reference() {
        let me = path('b', "self");
        let haystack = format!("#!/bin/sh\nexec /zb/store/{}-self/bin/real", me.digest_string());

        let empty: [&StorePath; 0] = [];
        let mut sink = RefScanSink::new(empty, Some(&me));
        sink.feed(haystack.as_bytes());
        assert!(sink.found_paths().contains(&me));
    }

    #[test]
    fn unmentioned_candidates_stay_out() {
        let a = path('a', "a");
        let b = path('c', "b");
        let haystack = format!("only {} here", a.digest_string());

        let mut sink = RefScanSink::new([&a, &b], None);
        sink.feed(haystack.as_bytes());
        let found = sink.found_paths();
        assert!(found.contains(&a));
        assert!(!found.contains(&b));
    }

    /// Feed in every chunk size so digests spanning 2..=32 chunks are
    /// all exercised.
    #[test]
    fn matches_across_chunk_boundaries() {
        let input = path('a', "test");
        let content = format!("prefix{}suffix", input.digest_string());
        let bytes = content.as_bytes();

        for chunk_size in 1..=bytes.len() {
            let mut sink = RefScanSink::new([&input], None);
            for chunk in bytes.chunks(chunk_size) {
                sink.feed(chunk);
            }
            assert!(
                sink.found_paths().contains(&input),
                "missed with chunk_size={chunk_size}"
            );
        }
    }
}
