// SPDX-License-Identifier: MIT

//! Content-Length framing.
//!
//! Every message on the socket is `Content-Length: N\r\n` followed by
//! optional further headers, `\r\n`, and exactly `N` payload bytes.
//! JSON-RPC messages carry no content type; binary archive payloads are
//! marked `Content-Type: application/zb-store-export` and interleave
//! with JSON frames.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// The content type of the auxiliary binary side-channel.
pub const STORE_EXPORT_CONTENT_TYPE: &str = "application/zb-store-export";

/// Upper bound for JSON frames; binary frames are streamed and bounded
/// by the importer instead.
pub const MAX_JSON_FRAME: u64 = 64 * 1024 * 1024;

/// Upper bound for one header line.
const MAX_HEADER_LINE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Json,
    StoreExport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub content_length: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("unknown content type {0:?}")]
    UnknownContentType(String),
    #[error("frame of {0} bytes exceeds the allowed maximum")]
    FrameTooLarge(u64),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read one frame header. Returns `None` on clean EOF before the first
/// header byte.
pub async fn read_frame_header<R>(reader: &mut R) -> Result<Option<FrameHeader>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<u64> = None;
    let mut kind = FrameKind::Json;
    let mut first_line = true;

    loop {
        let mut line = Vec::with_capacity(64);
        let mut limited = (&mut *reader).take(MAX_HEADER_LINE as u64);
        let n = limited.read_until(b'\n', &mut line).await?;
        if n == 0 {
            if first_line && content_length.is_none() {
                return Ok(None);
            }
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        first_line = false;

        if !line.ends_with(b"\r\n") {
            return Err(FrameError::MalformedHeader(
                String::from_utf8_lossy(&line).into_owned(),
            ));
        }
        line.truncate(line.len() - 2);

        if line.is_empty() {
            // End of headers.
            let content_length = content_length.ok_or(FrameError::MissingContentLength)?;
            return Ok(Some(FrameHeader {
                kind,
                content_length,
            }));
        }

        let text = String::from_utf8_lossy(&line).into_owned();
        let (name, value) = text
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(text.clone()))?;
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            let length: u64 = value
                .parse()
                .map_err(|_| FrameError::MalformedHeader(text.clone()))?;
            content_length = Some(length);
        } else if name.eq_ignore_ascii_case("content-type") {
            if value == STORE_EXPORT_CONTENT_TYPE {
                kind = FrameKind::StoreExport;
            } else if value.starts_with("application/json") {
                kind = FrameKind::Json;
            } else {
                return Err(FrameError::UnknownContentType(value.to_string()));
            }
        }
        // Unknown headers are ignored for forward compatibility.
    }
}

/// Read a JSON frame body after its header.
pub async fn read_json_body<R>(reader: &mut R, header: FrameHeader) -> Result<Vec<u8>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    if header.content_length > MAX_JSON_FRAME {
        return Err(FrameError::FrameTooLarge(header.content_length));
    }
    let mut body = vec![0u8; header.content_length as usize];
    tokio::io::AsyncReadExt::read_exact(reader, &mut body).await?;
    Ok(body)
}

/// Write one JSON frame.
pub async fn write_json_frame<W>(writer: &mut W, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Write one binary export frame.
pub async fn write_export_frame<W>(writer: &mut W, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!(
        "Content-Length: {}\r\nContent-Type: {STORE_EXPORT_CONTENT_TYPE}\r\n\r\n",
        body.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}
