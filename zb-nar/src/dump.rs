// SPDX-License-Identifier: MIT

//! Dump a filesystem subtree to its canonical archive serialization.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::wire;

const COPY_BUF: usize = 64 * 1024;

/// Serialize the subtree at `path` into `writer`.
///
/// Directory entries are emitted in ascending byte order of their names.
/// Only the executable bit of regular files is encoded; all other
/// metadata is deliberately dropped.
pub async fn dump<W>(path: &Path, writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    writer.write_all(&wire::TOK_NAR).await?;
    dump_node(path.to_path_buf(), writer).await?;
    writer.flush().await
}

fn dump_node<'a, W>(
    path: PathBuf,
    writer: &'a mut W,
) -> futures::future::BoxFuture<'a, io::Result<()>>
where
    W: AsyncWrite + Unpin + Send,
{
    Box::pin(async move {
        let meta = tokio::fs::symlink_metadata(&path).await?;

        if meta.is_symlink() {
            let target = tokio::fs::read_link(&path).await?;
            let target = target.as_os_str().as_encoded_bytes();
            if target.is_empty() || target.len() > wire::MAX_TARGET_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unencodable symlink target in {}", path.display()),
                ));
            }
            writer.write_all(&wire::TOK_SYM).await?;
            write_padded(writer, target).await?;
            writer.write_all(&wire::TOK_PAR).await?;
        } else if meta.is_file() {
            let executable = {
                use std::os::unix::fs::PermissionsExt as _;
                meta.permissions().mode() & 0o100 != 0
            };
            writer
                .write_all(if executable { &wire::TOK_EXE[..] } else { &wire::TOK_REG[..] })
                .await?;

            let size = meta.len();
            writer.write_all(&size.to_le_bytes()).await?;
            let file = tokio::fs::File::open(&path).await?;
            let copied = copy_exact(file, writer, size).await?;
            if copied != size {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("file {} changed size during dump", path.display()),
                ));
            }
            writer.write_all(&wire::ZEROS[..wire::padding(size)]).await?;
            writer.write_all(&wire::TOK_PAR).await?;
        } else if meta.is_dir() {
            writer.write_all(&wire::TOK_DIR).await?;

            let mut entries = Vec::new();
            let mut rd = tokio::fs::read_dir(&path).await?;
            while let Some(entry) = rd.next_entry().await? {
                entries.push(entry.file_name());
            }
            entries.sort_by(|a, b| a.as_encoded_bytes().cmp(b.as_encoded_bytes()));

            for name in entries {
                let name_bytes = name.as_encoded_bytes();
                if name_bytes.len() > wire::MAX_NAME_LEN || name_bytes.contains(&0) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unencodable entry name in {}", path.display()),
                    ));
                }
                writer.write_all(&wire::TOK_ENT).await?;
                write_padded(writer, name_bytes).await?;
                writer.write_all(&wire::TOK_NOD).await?;
                dump_node(path.join(&name), writer).await?;
                writer.write_all(&wire::TOK_PAR).await?;
            }

            writer.write_all(&wire::TOK_PAR).await?;
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a regular file, directory or symlink", path.display()),
            ));
        }

        Ok(())
    })
}

async fn write_padded<W>(writer: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(bytes.len() as u64).to_le_bytes()).await?;
    writer.write_all(bytes).await?;
    writer
        .write_all(&wire::ZEROS[..wire::padding(bytes.len() as u64)])
        .await
}

/// Copy at most `limit` bytes; returns the number copied.
async fn copy_exact<R, W>(mut reader: R, writer: &mut W, limit: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF];
    let mut remaining = limit;
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(limit - remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_dir_is_the_minimal_archive() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut bytes = Vec::new();
        dump(tmp.path(), &mut bytes).await.unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&wire::TOK_NAR);
        expected.extend_from_slice(&wire::TOK_DIR);
        expected.extend_from_slice(&wire::TOK_PAR);
        assert_eq!(expected, bytes);
    }

    #[tokio::test]
    async fn entries_come_out_sorted() {
        let tmp = tempfile::TempDir::new().unwrap();
        // Create in non-sorted order; readdir order is arbitrary anyway.
        for name in ["zeta", "alpha", "mid"] {
            std::fs::write(tmp.path().join(name), name).unwrap();
        }

        let mut bytes = Vec::new();
        dump(tmp.path(), &mut bytes).await.unwrap();

        let alpha = bytes.windows(5).position(|w| w == b"alpha").unwrap();
        let mid = bytes.windows(3).position(|w| w == b"mid").unwrap();
        let zeta = bytes.windows(4).position(|w| w == b"zeta").unwrap();
        assert!(alpha < mid && mid < zeta);
    }

    #[tokio::test]
    async fn rejects_special_files() {
        // A unix socket is neither file, dir nor symlink.
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("sock");
        let _listener = std::os::unix::net::UnixListener::bind(&sock_path).unwrap();

        let mut bytes = Vec::new();
        dump(&sock_path, &mut bytes).await.expect_err("must reject");
    }
}
