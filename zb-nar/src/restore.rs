// SPDX-License-Identifier: MIT

//! Restore a canonical archive stream to the filesystem.
//!
//! The parser consumes exactly the archive's bytes from the reader and
//! no more, so a restore can run against a stream that carries further
//! framing after the archive (see [`crate::export`]).

use std::io;
use std::path::{Path, PathBuf};

use bstr::BStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWriteExt as _};

use crate::wire;

/// Keyword strings can never be longer than this.
const MAX_KEYWORD_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("not an archive: bad magic")]
    BadMagic,
    #[error("expected keyword {expected:?}, got {got:?}")]
    UnexpectedKeyword { expected: &'static str, got: String },
    #[error("unknown node type {0:?}")]
    UnknownNodeType(String),
    #[error("invalid entry name {0:?}")]
    InvalidName(String),
    #[error("misordered directory entry {0:?}")]
    MisorderedEntry(String),
    #[error("string of {0} bytes exceeds the allowed maximum")]
    StringTooLong(u64),
    #[error("nonzero padding after string")]
    BadPadding,
    #[error("invalid symlink target")]
    InvalidTarget,
    #[error("creating {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Restore the archive read from `reader` to a fresh `path`.
///
/// `path`'s parent must exist; `path` itself must not.
pub async fn restore<R>(reader: &mut R, path: &Path) -> Result<(), RestoreError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut p = Parser { reader };

    let magic = p.read_string(MAX_KEYWORD_LEN as u64).await?;
    if magic != b"nix-archive-1" {
        return Err(RestoreError::BadMagic);
    }
    p.expect("(").await?;
    p.expect("type").await?;
    p.restore_node(path.to_path_buf()).await
}

struct Parser<'a, R> {
    reader: &'a mut R,
}

impl<R> Parser<'_, R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Read one length-prefixed, padded string, bounded by `max`.
    async fn read_string(&mut self, max: u64) -> Result<Vec<u8>, RestoreError> {
        let len = self.reader.read_u64_le().await?;
        if len > max {
            return Err(RestoreError::StringTooLong(len));
        }
        let mut buf = vec![0u8; len as usize];
        self.reader.read_exact(&mut buf).await?;
        self.read_padding(len).await?;
        Ok(buf)
    }

    async fn read_padding(&mut self, len: u64) -> Result<(), RestoreError> {
        let pad = wire::padding(len);
        if pad > 0 {
            let mut padbuf = [0u8; 8];
            self.reader.read_exact(&mut padbuf[..pad]).await?;
            if padbuf[..pad].iter().any(|b| *b != 0) {
                return Err(RestoreError::BadPadding);
            }
        }
        Ok(())
    }

    async fn expect(&mut self, keyword: &'static str) -> Result<(), RestoreError> {
        let got = self.read_string(MAX_KEYWORD_LEN as u64).await?;
        if got != keyword.as_bytes() {
            return Err(RestoreError::UnexpectedKeyword {
                expected: keyword,
                got: String::from_utf8_lossy(&got).into_owned(),
            });
        }
        Ok(())
    }

    /// Parse one node, `"(" "type"` already consumed, through its
    /// closing `")"`, materializing it at `path`.
    fn restore_node(
        &mut self,
        path: PathBuf,
    ) -> futures::future::BoxFuture<'_, Result<(), RestoreError>> {
        Box::pin(async move {
            let node_type = self.read_string(MAX_KEYWORD_LEN as u64).await?;
            match &node_type[..] {
                b"symlink" => {
                    self.expect("target").await?;
                    let target = self.read_string(wire::MAX_TARGET_LEN as u64).await?;
                    if target.is_empty() || target.contains(&0) {
                        return Err(RestoreError::InvalidTarget);
                    }
                    self.expect(")").await?;

                    let target = bytes_to_path(&target)?;
                    tokio::fs::symlink(&target, &path).await.map_err(|source| {
                        RestoreError::Create { path: path.clone(), source }
                    })?;
                }
                b"regular" => {
                    let mut keyword = self.read_string(MAX_KEYWORD_LEN as u64).await?;
                    let executable = keyword == b"executable";
                    if executable {
                        // "executable" is followed by an empty string.
                        let empty = self.read_string(0).await?;
                        debug_assert!(empty.is_empty());
                        keyword = self.read_string(MAX_KEYWORD_LEN as u64).await?;
                    }
                    if keyword != b"contents" {
                        return Err(RestoreError::UnexpectedKeyword {
                            expected: "contents",
                            got: String::from_utf8_lossy(&keyword).into_owned(),
                        });
                    }

                    let size = self.reader.read_u64_le().await?;
                    let mut file = {
                        let mut options = tokio::fs::OpenOptions::new();
                        options.write(true).create_new(true);
                        {
                            use std::os::unix::fs::OpenOptionsExt as _;
                            options.mode(if executable { 0o777 } else { 0o666 });
                        }
                        options.open(&path).await.map_err(|source| {
                            RestoreError::Create { path: path.clone(), source }
                        })?
                    };

                    let mut taken = (&mut self.reader).take(size);
                    let copied = tokio::io::copy(&mut taken, &mut file).await?;
                    if copied != size {
                        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                    }
                    file.flush().await?;
                    drop(file);

                    self.read_padding(size).await?;
                    self.expect(")").await?;
                }
                b"directory" => {
                    tokio::fs::create_dir(&path).await.map_err(|source| {
                        RestoreError::Create { path: path.clone(), source }
                    })?;

                    let mut prev_name: Option<Vec<u8>> = None;
                    loop {
                        let keyword = self.read_string(MAX_KEYWORD_LEN as u64).await?;
                        match &keyword[..] {
                            b")" => break,
                            b"entry" => {
                                self.expect("(").await?;
                                self.expect("name").await?;
                                let name = self.read_string(wire::MAX_NAME_LEN as u64).await?;
                                validate_entry_name(&name)?;
                                if let Some(prev) = &prev_name
                                    && prev >= &name
                                {
                                    return Err(RestoreError::MisorderedEntry(
                                        String::from_utf8_lossy(&name).into_owned(),
                                    ));
                                }
                                prev_name = Some(name.clone());

                                self.expect("node").await?;
                                self.expect("(").await?;
                                self.expect("type").await?;
                                let child = path.join(bytes_to_path(&name)?);
                                self.restore_node(child).await?;
                                // entry's own closing paren
                                self.expect(")").await?;
                            }
                            other => {
                                return Err(RestoreError::UnexpectedKeyword {
                                    expected: "entry or )",
                                    got: String::from_utf8_lossy(other).into_owned(),
                                });
                            }
                        }
                    }
                }
                other => {
                    return Err(RestoreError::UnknownNodeType(
                        String::from_utf8_lossy(other).into_owned(),
                    ));
                }
            }
            Ok(())
        })
    }
}

fn validate_entry_name(name: &[u8]) -> Result<(), RestoreError> {
    if name.is_empty()
        || name == b"."
        || name == b".."
        || name.contains(&b'/')
        || name.contains(&0)
    {
        return Err(RestoreError::InvalidName(
            String::from_utf8_lossy(name).into_owned(),
        ));
    }
    Ok(())
}

fn bytes_to_path(bytes: &[u8]) -> Result<PathBuf, RestoreError> {
    use bstr::ByteSlice as _;
    bytes
        .to_os_str()
        .map(PathBuf::from)
        .map_err(|_| RestoreError::InvalidName(BStr::new(bytes).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{TOK_DIR, TOK_ENT, TOK_NAR, TOK_NOD, TOK_PAR, TOK_REG};

    fn padded(s: &[u8]) -> Vec<u8> {
        let mut out = (s.len() as u64).to_le_bytes().to_vec();
        out.extend_from_slice(s);
        out.extend_from_slice(&wire::ZEROS[..wire::padding(s.len() as u64)]);
        out
    }

    fn file_node(contents: &[u8]) -> Vec<u8> {
        let mut out = TOK_REG.to_vec();
        out.extend_from_slice(&padded(contents));
        out.extend_from_slice(&TOK_PAR);
        out
    }

    fn dir_with_entries(entries: &[(&[u8], Vec<u8>)]) -> Vec<u8> {
        let mut out = TOK_NAR.to_vec();
        out.extend_from_slice(&TOK_DIR);
        for (name, node) in entries {
            out.extend_from_slice(&TOK_ENT);
            out.extend_from_slice(&padded(name));
            out.extend_from_slice(&TOK_NOD);
            out.extend_from_slice(node);
            out.extend_from_slice(&TOK_PAR);
        }
        out.extend_from_slice(&TOK_PAR);
        out
    }

    #[tokio::test]
    async fn rejects_bad_magic() {
        let tmp = tempfile::TempDir::new().unwrap();
        let bytes = padded(b"not-an-archive");
        let err = restore(&mut std::io::Cursor::new(bytes), &tmp.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::BadMagic));
    }

    #[tokio::test]
    async fn rejects_misordered_entries() {
        let tmp = tempfile::TempDir::new().unwrap();
        let bytes = dir_with_entries(&[
            (b"beta", file_node(b"1")),
            (b"alpha", file_node(b"2")),
        ]);
        let err = restore(&mut std::io::Cursor::new(bytes), &tmp.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::MisorderedEntry(_)));
    }

    #[tokio::test]
    async fn rejects_duplicate_entries() {
        let tmp = tempfile::TempDir::new().unwrap();
        let bytes = dir_with_entries(&[
            (b"same", file_node(b"1")),
            (b"same", file_node(b"2")),
        ]);
        restore(&mut std::io::Cursor::new(bytes), &tmp.path().join("x"))
            .await
            .expect_err("duplicates are misordered");
    }

    #[tokio::test]
    async fn rejects_reserved_names() {
        for name in [&b".."[..], b".", b"a/b"] {
            let tmp = tempfile::TempDir::new().unwrap();
            let bytes = dir_with_entries(&[(name, file_node(b"1"))]);
            let err = restore(&mut std::io::Cursor::new(bytes), &tmp.path().join("x"))
                .await
                .unwrap_err();
            assert!(
                matches!(err, RestoreError::InvalidName(_)),
                "{:?} must be rejected",
                BStr::new(name)
            );
        }
    }

    #[tokio::test]
    async fn rejects_nonzero_padding() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut bytes = TOK_NAR.to_vec();
        bytes.extend_from_slice(&TOK_REG);
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.push(b'x');
        bytes.extend_from_slice(&[0xff; 7]); // padding must be zero
        bytes.extend_from_slice(&TOK_PAR);

        let err = restore(&mut std::io::Cursor::new(bytes), &tmp.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::BadPadding));
    }

    #[tokio::test]
    async fn stops_at_archive_end() {
        // The parser must not consume trailing bytes after the archive.
        let tmp = tempfile::TempDir::new().unwrap();
        let mut bytes = TOK_NAR.to_vec();
        bytes.extend_from_slice(&file_node(b"hello"));
        bytes.extend_from_slice(b"TRAILER");

        let mut cursor = std::io::Cursor::new(bytes);
        restore(&mut cursor, &tmp.path().join("f")).await.unwrap();

        let mut rest = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut cursor, &mut rest)
            .await
            .unwrap();
        assert_eq!(b"TRAILER".to_vec(), rest);
    }
}
