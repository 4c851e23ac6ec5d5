//! Lazy, single-pass body streaming shared by the request and response readers.

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::HttpParseError;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// How the body is delimited on the wire.
#[derive(Debug, Clone, Copy)]
pub enum Framing {
    Empty,
    ContentLength(u64),
    Chunked,
    /// Response-only: no `Content-Length` or chunked coding was present, so
    /// the body runs until the peer closes the connection (RFC 7230
    /// §3.3.3 rule 7, restricted here to `HTTP/1.0`-style responses).
    UntilClose,
}

/// A lazily-read, single-pass sequence of body chunks. Trailers on a
/// chunked body are read and discarded, never surfaced.
pub struct BodyReader<R> {
    reader: R,
    framing: Framing,
    remaining: u64,
    done: bool,
}

impl<R: AsyncBufRead + Unpin> BodyReader<R> {
    pub fn new(reader: R, framing: Framing) -> Self {
        let remaining = match framing {
            Framing::ContentLength(n) => n,
            _ => 0,
        };
        let done = matches!(framing, Framing::Empty | Framing::ContentLength(0));
        Self {
            reader,
            framing,
            remaining,
            done,
        }
    }

    /// Yield the next chunk of body bytes, or `None` once the body is
    /// exhausted. Once this returns `None` or `Some(Err(_))` the reader
    /// must not be polled again.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, HttpParseError>> {
        if self.done {
            return None;
        }
        let result = match self.framing {
            Framing::Empty => None,
            Framing::ContentLength(_) => self.read_length_chunk().await,
            Framing::Chunked => self.read_chunked_chunk().await,
            Framing::UntilClose => self.read_until_close_chunk().await,
        };
        if !matches!(result, Some(Ok(_))) {
            self.done = true;
        }
        result
    }

    /// Drain and discard the remainder of the body — used when a handler
    /// writes a response without first reading the request body to
    /// completion.
    pub async fn drain(&mut self) -> Result<(), HttpParseError> {
        while let Some(chunk) = self.next_chunk().await {
            chunk?;
        }
        Ok(())
    }

    /// Reclaim the underlying reader. Only meaningful once the body is
    /// known to be exhausted (or was never going to produce bytes, e.g. a
    /// `CONNECT` request) — the connection state machine uses this to hand
    /// the same buffered reader (and any bytes already pulled into its
    /// buffer) on to the next stage, such as a TLS handshake.
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// How this body is delimited on the wire.
    pub fn framing(&self) -> Framing {
        self.framing
    }

    async fn read_length_chunk(&mut self) -> Option<Result<Bytes, HttpParseError>> {
        if self.remaining == 0 {
            return None;
        }
        let want = self.remaining.min(READ_CHUNK_SIZE as u64) as usize;
        let mut buf = vec![0u8; want];
        match self.reader.read_exact(&mut buf).await {
            Ok(_) => {
                self.remaining -= want as u64;
                Some(Ok(Bytes::from(buf)))
            }
            Err(e) => Some(Err(HttpParseError::Io(e))),
        }
    }

    async fn read_chunked_chunk(&mut self) -> Option<Result<Bytes, HttpParseError>> {
        let size = match self.read_chunk_size_line().await {
            Ok(size) => size,
            Err(e) => return Some(Err(e)),
        };
        if size == 0 {
            if let Err(e) = self.consume_trailers().await {
                return Some(Err(e));
            }
            return None;
        }

        let mut buf = vec![0u8; size];
        if let Err(e) = self.reader.read_exact(&mut buf).await {
            return Some(Err(HttpParseError::Io(e)));
        }
        let mut crlf = [0u8; 2];
        if let Err(e) = self.reader.read_exact(&mut crlf).await {
            return Some(Err(HttpParseError::Io(e)));
        }
        if &crlf != b"\r\n" {
            return Some(Err(HttpParseError::MalformedChunk));
        }
        Some(Ok(Bytes::from(buf)))
    }

    async fn read_chunk_size_line(&mut self) -> Result<usize, HttpParseError> {
        let line = read_line(&mut self.reader).await?;
        let size_hex = line.split(';').next().unwrap_or("").trim();
        usize::from_str_radix(size_hex, 16).map_err(|_| HttpParseError::MalformedChunk)
    }

    async fn consume_trailers(&mut self) -> Result<(), HttpParseError> {
        loop {
            if read_line(&mut self.reader).await?.is_empty() {
                return Ok(());
            }
        }
    }

    async fn read_until_close_chunk(&mut self) -> Option<Result<Bytes, HttpParseError>> {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        match self.reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => Some(Ok(Bytes::copy_from_slice(&buf[..n]))),
            Err(e) => Some(Err(HttpParseError::Io(e))),
        }
    }
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, HttpParseError> {
    let mut line = Vec::new();
    let n = reader
        .read_until(b'\n', &mut line)
        .await
        .map_err(HttpParseError::Io)?;
    if n == 0 {
        return Err(HttpParseError::UnexpectedEof);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn collect<R: AsyncBufRead + Unpin>(body: &mut BodyReader<R>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = body.next_chunk().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn content_length_body_reads_exact_bytes() {
        let raw = b"hello worldTRAILING-GARBAGE";
        let reader = Cursor::new(&raw[..]);
        let mut body = BodyReader::new(reader, Framing::ContentLength(11));
        assert_eq!(collect(&mut body).await, b"hello world");
    }

    #[tokio::test]
    async fn zero_length_body_yields_nothing() {
        let reader = Cursor::new(&b""[..]);
        let mut body = BodyReader::new(reader, Framing::ContentLength(0));
        assert!(body.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn chunked_body_reassembles_payload_and_ignores_trailers() {
        let raw = b"5\r\nhello\r\n1\r\n \r\n5\r\nworld\r\n0\r\nX-Trailer: ignored\r\n\r\n";
        let reader = Cursor::new(&raw[..]);
        let mut body = BodyReader::new(reader, Framing::Chunked);
        assert_eq!(collect(&mut body).await, b"hello world");
    }

    #[tokio::test]
    async fn chunked_body_rejects_missing_crlf_terminator() {
        let raw = b"5\r\nhelloXX0\r\n\r\n";
        let reader = Cursor::new(&raw[..]);
        let mut body = BodyReader::new(reader, Framing::Chunked);
        let err = body.next_chunk().await.unwrap().unwrap_err();
        assert!(matches!(err, HttpParseError::MalformedChunk));
    }

    #[tokio::test]
    async fn until_close_body_reads_to_eof() {
        let raw = b"all of this is body until eof";
        let reader = Cursor::new(&raw[..]);
        let mut body = BodyReader::new(reader, Framing::UntilClose);
        assert_eq!(collect(&mut body).await, raw);
    }
}
