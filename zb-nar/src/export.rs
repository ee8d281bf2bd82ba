// SPDX-License-Identifier: MIT

//! The framed export container: zero or more archives plus per-object
//! metadata, for batch transfer of store objects over a byte stream.
//!
//! ```plain
//! stream  ::= MAGIC entry* end
//! entry   ::= u64(1) archive string(path) strings(references) strings(signatures)
//! end     ::= u64(0)
//! strings ::= u64(count) string*
//! ```
//!
//! Strings use the archive wire encoding (64-bit LE length, zero-padded
//! to 8 bytes). The archive itself is self-delimiting, so entries need
//! no length prefix; an importer restores the archive inline and then
//! reads the trailer.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::wire;

pub const EXPORT_MAGIC: &[u8; 8] = b"zbstore1";

/// Upper bound for metadata strings in the trailer; store paths and
/// signatures are far below this.
const MAX_META_STRING: u64 = 4096;
const MAX_META_COUNT: u64 = 65536;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("not an export stream: bad magic")]
    BadMagic,
    #[error("bad entry marker {0} (expected 0 or 1)")]
    BadEntryMarker(u64),
    #[error("metadata string of {0} bytes exceeds the allowed maximum")]
    StringTooLong(u64),
    #[error("metadata list of {0} entries exceeds the allowed maximum")]
    ListTooLong(u64),
    #[error("metadata is not valid UTF-8")]
    NotUtf8,
    #[error("nonzero padding in export stream")]
    BadPadding,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Metadata trailing each exported archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTrailer {
    /// Absolute store path of the object.
    pub path: String,
    /// Absolute store paths this object references.
    pub references: Vec<String>,
    /// `keyId:base64` signature strings over the object's realization
    /// record, if any.
    pub signatures: Vec<String>,
}

/// Writer side of the export framing. The caller interleaves archive
/// bytes between [`begin_entry`](Self::begin_entry) and
/// [`finish_entry`](Self::finish_entry).
pub struct ExportWriter<W> {
    writer: W,
    started: bool,
}

impl<W> ExportWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            started: false,
        }
    }

    /// Announce one more object; the caller must now dump its archive
    /// into [`inner`](Self::inner) and then call `finish_entry`.
    pub async fn begin_entry(&mut self) -> Result<(), ExportError> {
        if !self.started {
            self.writer.write_all(EXPORT_MAGIC).await?;
            self.started = true;
        }
        self.writer.write_all(&1u64.to_le_bytes()).await?;
        Ok(())
    }

    /// The underlying writer, for streaming the archive of the current
    /// entry.
    pub fn inner(&mut self) -> &mut W {
        &mut self.writer
    }

    pub async fn finish_entry(&mut self, trailer: &ExportTrailer) -> Result<(), ExportError> {
        write_string(&mut self.writer, trailer.path.as_bytes()).await?;
        write_string_list(&mut self.writer, &trailer.references).await?;
        write_string_list(&mut self.writer, &trailer.signatures).await?;
        Ok(())
    }

    /// Terminate the stream. An export with zero entries still carries
    /// the magic and the end marker.
    pub async fn finish(mut self) -> Result<W, ExportError> {
        if !self.started {
            self.writer.write_all(EXPORT_MAGIC).await?;
        }
        self.writer.write_all(&0u64.to_le_bytes()).await?;
        self.writer.flush().await?;
        Ok(self.writer)
    }
}

async fn write_string<W>(writer: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(bytes.len() as u64).to_le_bytes()).await?;
    writer.write_all(bytes).await?;
    writer
        .write_all(&wire::ZEROS[..wire::padding(bytes.len() as u64)])
        .await
}

async fn write_string_list<W>(writer: &mut W, items: &[String]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(items.len() as u64).to_le_bytes()).await?;
    for item in items {
        write_string(writer, item.as_bytes()).await?;
    }
    Ok(())
}

/// Reader side of the export framing.
pub struct ExportReader<R> {
    reader: R,
    started: bool,
}

impl<R> ExportReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            started: false,
        }
    }

    /// Whether another entry follows. On `true`, the caller must restore
    /// the archive from [`inner`](Self::inner) and then call
    /// [`read_trailer`](Self::read_trailer).
    pub async fn next_entry(&mut self) -> Result<bool, ExportError> {
        if !self.started {
            let mut magic = [0u8; 8];
            self.reader.read_exact(&mut magic).await?;
            if &magic != EXPORT_MAGIC {
                return Err(ExportError::BadMagic);
            }
            self.started = true;
        }

        match self.reader.read_u64_le().await? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ExportError::BadEntryMarker(other)),
        }
    }

    pub fn inner(&mut self) -> &mut R {
        &mut self.reader
    }

    pub async fn read_trailer(&mut self) -> Result<ExportTrailer, ExportError> {
        let path = read_string(&mut self.reader).await?;
        let references = read_string_list(&mut self.reader).await?;
        let signatures = read_string_list(&mut self.reader).await?;
        Ok(ExportTrailer {
            path,
            references,
            signatures,
        })
    }
}

async fn read_string<R>(reader: &mut R) -> Result<String, ExportError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u64_le().await?;
    if len > MAX_META_STRING {
        return Err(ExportError::StringTooLong(len));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;

    let pad = wire::padding(len);
    if pad > 0 {
        let mut padbuf = [0u8; 8];
        reader.read_exact(&mut padbuf[..pad]).await?;
        if padbuf[..pad].iter().any(|b| *b != 0) {
            return Err(ExportError::BadPadding);
        }
    }

    String::from_utf8(buf).map_err(|_| ExportError::NotUtf8)
}

async fn read_string_list<R>(reader: &mut R) -> Result<Vec<String>, ExportError>
where
    R: AsyncRead + Unpin,
{
    let count = reader.read_u64_le().await?;
    if count > MAX_META_COUNT {
        return Err(ExportError::ListTooLong(count));
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(read_string(reader).await?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dump, restore};

    #[tokio::test]
    async fn export_import_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = tmp.path().join("a");
        std::fs::write(&a, b"object a").unwrap();
        let b = tmp.path().join("b");
        std::fs::create_dir(&b).unwrap();
        std::fs::write(b.join("file"), b"object b").unwrap();

        let trailer_a = ExportTrailer {
            path: "/zb/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-a".into(),
            references: vec![],
            signatures: vec![],
        };
        let trailer_b = ExportTrailer {
            path: "/zb/store/bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-b".into(),
            references: vec!["/zb/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-a".into()],
            signatures: vec!["key:c2ln".into()],
        };

        let mut writer = ExportWriter::new(Vec::new());
        writer.begin_entry().await.unwrap();
        dump(&a, writer.inner()).await.unwrap();
        writer.finish_entry(&trailer_a).await.unwrap();
        writer.begin_entry().await.unwrap();
        dump(&b, writer.inner()).await.unwrap();
        writer.finish_entry(&trailer_b).await.unwrap();
        let stream = writer.finish().await.unwrap();

        let mut reader = ExportReader::new(&stream[..]);
        let mut seen = Vec::new();
        let mut i = 0;
        while reader.next_entry().await.unwrap() {
            let dst = tmp.path().join(format!("restored-{i}"));
            restore(reader.inner(), &dst).await.unwrap();
            seen.push(reader.read_trailer().await.unwrap());
            i += 1;
        }

        assert_eq!(vec![trailer_a, trailer_b], seen);
        assert_eq!(
            b"object a".to_vec(),
            std::fs::read(tmp.path().join("restored-0")).unwrap()
        );
        assert_eq!(
            b"object b".to_vec(),
            std::fs::read(tmp.path().join("restored-1/file")).unwrap()
        );
    }

    #[tokio::test]
    async fn empty_export() {
        let stream = ExportWriter::new(Vec::new()).finish().await.unwrap();
        let mut reader = ExportReader::new(&stream[..]);
        assert!(!reader.next_entry().await.unwrap());
    }

    #[tokio::test]
    async fn rejects_garbage() {
        let mut reader = ExportReader::new(&b"definitely not an export"[..]);
        assert!(matches!(
            reader.next_entry().await.unwrap_err(),
            ExportError::BadMagic
        ));
    }
}
