// SPDX-License-Identifier: MIT

//! An [`AsyncRead`] adapter that hashes everything passing through it.
//!
//! Used by the import path: the restorer pulls archive bytes through
//! this wrapper, so the archive hash and size fall out of the same read
//! pass that materializes the object.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, ReadBuf};
use zb_store_core::Hash;

pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes_read: u64,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_read: 0,
        }
    }

    /// The digest and byte count of everything read so far.
    pub fn finish(self) -> (Hash, u64) {
        (Hash::sha256(self.hasher.finalize().into()), self.bytes_read)
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R> AsyncRead for HashingReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let new_bytes = &buf.filled()[before..];
        this.hasher.update(new_bytes);
        this.bytes_read += new_bytes.len() as u64;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;
    use zb_store_core::HashAlgo;

    #[tokio::test]
    async fn hashes_what_it_reads() {
        let data = b"hello world\n";
        let mut reader = HashingReader::new(&data[..]);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(data.to_vec(), out);

        let (hash, size) = reader.finish();
        assert_eq!(HashAlgo::Sha256.digest(data), hash);
        assert_eq!(data.len() as u64, size);
    }

    #[tokio::test]
    async fn partial_reads_count_only_consumed_bytes() {
        let data = b"0123456789";
        let mut reader = HashingReader::new(&data[..]);

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        let (hash, size) = reader.finish();
        assert_eq!(4, size);
        assert_eq!(HashAlgo::Sha256.digest(b"0123"), hash);
    }
}
