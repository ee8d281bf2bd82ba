// SPDX-License-Identifier: MIT

//! Archive wire format, shared by the dumper and the restorer.
//!
//! The wire format is an S-expression grammar encoded with one rule:
//! every string (syntactic keywords, names, file contents, symlink
//! targets) is a 64-bit little-endian length followed by the bytes,
//! padded with zeros to 8-byte alignment.
//!
//! ```plain
//! archive ::= "nix-archive-1" node
//!
//! node ::= "(" "type" "symlink" "target" string ")"
//!      ||= "(" "type" "regular" ("executable" "")? "contents" string ")"
//!      ||= "(" "type" "directory" entry* ")"
//!
//! entry ::= "entry" "(" "name" string "node" node ")"
//! ```
//!
//! The purely syntactic runs are pre-concatenated into fixed tokens so
//! the dumper can emit them with single writes and the restorer can
//! compare them wholesale.

/// Maximum length of a directory entry name.
pub const MAX_NAME_LEN: usize = 255;
/// Maximum length of a symlink target.
pub const MAX_TARGET_LEN: usize = 4095;

pub const TOK_NAR: [u8; 56] = *b"\x0d\0\0\0\0\0\0\0nix-archive-1\0\0\0\x01\0\0\0\0\0\0\0(\0\0\0\0\0\0\0\x04\0\0\0\0\0\0\0type\0\0\0\0";
pub const TOK_SYM: [u8; 32] = *b"\x07\0\0\0\0\0\0\0symlink\0\x06\0\0\0\0\0\0\0target\0\0";
pub const TOK_REG: [u8; 32] = *b"\x07\0\0\0\0\0\0\0regular\0\x08\0\0\0\0\0\0\0contents";
pub const TOK_EXE: [u8; 64] = *b"\x07\0\0\0\0\0\0\0regular\0\x0a\0\0\0\0\0\0\0executable\0\0\0\0\0\0\0\0\0\0\0\0\0\0\x08\0\0\0\0\0\0\0contents";
pub const TOK_DIR: [u8; 24] = *b"\x09\0\0\0\0\0\0\0directory\0\0\0\0\0\0\0";
pub const TOK_ENT: [u8; 48] = *b"\x05\0\0\0\0\0\0\0entry\0\0\0\x01\0\0\0\0\0\0\0(\0\0\0\0\0\0\0\x04\0\0\0\0\0\0\0name\0\0\0\0";
pub const TOK_NOD: [u8; 48] = *b"\x04\0\0\0\0\0\0\0node\0\0\0\0\x01\0\0\0\0\0\0\0(\0\0\0\0\0\0\0\x04\0\0\0\0\0\0\0type\0\0\0\0";
pub const TOK_PAR: [u8; 16] = *b"\x01\0\0\0\0\0\0\0)\0\0\0\0\0\0\0";

/// Length of `len` bytes rounded up to 8-byte alignment.
pub const fn aligned(len: u64) -> u64 {
    len.wrapping_add(7) & !7
}

/// Number of zero padding bytes after a string of `len` bytes.
pub const fn padding(len: u64) -> usize {
    (aligned(len) - len) as usize
}

pub const ZEROS: [u8; 8] = [0u8; 8];

#[cfg(test)]
mod tests {
    use super::*;

    fn token(strings: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for s in strings {
            out.extend_from_slice(&(s.len() as u64).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(&ZEROS[..padding(s.len() as u64)]);
        }
        out
    }

    #[test]
    fn tokens_match_their_strings() {
        let cases: &[(&[u8], &[&str])] = &[
            (&TOK_NAR, &["nix-archive-1", "(", "type"]),
            (&TOK_SYM, &["symlink", "target"]),
            (&TOK_REG, &["regular", "contents"]),
            (&TOK_EXE, &["regular", "executable", "", "contents"]),
            (&TOK_DIR, &["directory"]),
            (&TOK_ENT, &["entry", "(", "name"]),
            (&TOK_NOD, &["node", "(", "type"]),
            (&TOK_PAR, &[")"]),
        ];
        for (tok, strings) in cases {
            assert_eq!(tok, &token(strings).as_slice());
        }
    }

    #[test]
    fn padding_math() {
        assert_eq!(0, padding(0));
        assert_eq!(7, padding(1));
        assert_eq!(0, padding(8));
        assert_eq!(3, padding(13));
    }
}
