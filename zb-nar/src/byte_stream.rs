// SPDX-License-Identifier: MIT

//! A bounded stream of archive bytes for a filesystem path.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::dump::dump;

/// Default chunk size for yielded `Bytes` (64 KiB).
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Number of chunks buffered in the channel. Lets the encoder work ahead
/// of the consumer without unbounded memory growth.
const CHANNEL_CAPACITY: usize = 4;

/// An [`AsyncWrite`] that freezes its buffer into [`Bytes`] chunks and
/// sends them through a bounded mpsc channel. A full channel makes
/// `poll_write` return `Pending`, so the producer is back-pressured.
struct ChannelWriter {
    sender: PollSender<io::Result<Bytes>>,
    buffer: BytesMut,
    chunk_size: usize,
}

impl ChannelWriter {
    fn new(sender: PollSender<io::Result<Bytes>>, chunk_size: usize) -> Self {
        Self {
            sender,
            buffer: BytesMut::with_capacity(chunk_size),
            chunk_size,
        }
    }

    fn poll_emit_chunk(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.buffer.is_empty() {
            return Poll::Ready(Ok(()));
        }

        ready!(self.sender.poll_reserve(cx))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream dropped"))?;

        let chunk = std::mem::replace(&mut self.buffer, BytesMut::with_capacity(self.chunk_size));
        self.sender
            .send_item(Ok(chunk.freeze()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream dropped"))?;

        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.buffer.len() >= self.chunk_size {
            ready!(self.as_mut().get_mut().poll_emit_chunk(cx))?;
        }

        let this = self.get_mut();
        let n = buf.len().min(this.chunk_size - this.buffer.len());
        this.buffer.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_emit_chunk(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_emit_chunk(cx)
    }
}

/// A [`futures::Stream`] of `Bytes` chunks holding the canonical archive
/// serialization of a path.
///
/// A background task walks the filesystem and encodes the archive; the
/// bounded channel provides pipelining with back-pressure. Errors from
/// the walk surface as stream items.
pub struct NarByteStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl NarByteStream {
    pub fn new(path: PathBuf) -> Self {
        Self::with_chunk_size(path, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(path: PathBuf, chunk_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::task::spawn(async move {
            let mut writer = ChannelWriter::new(PollSender::new(tx.clone()), chunk_size);
            if let Err(e) = dump(&path, &mut writer).await {
                tracing::debug!(path = %path.display(), error = %e, "archive dump failed");
                let _ = tx.send(Err(e)).await;
            }
        });

        Self { rx }
    }
}

impl futures::Stream for NarByteStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
