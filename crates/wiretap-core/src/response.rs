//! HTTP response line + header parsing, mirroring [`crate::request`] (component C3).

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::body::{BodyReader, Framing};
use crate::error::HttpParseError;
use crate::headers::Headers;
use crate::request::MAX_HEADER_BYTES;

pub const MAX_STATUS_LINE_BYTES: usize = 8 * 1024;

#[derive(Debug)]
pub struct Response<R> {
    pub version: &'static str,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    body: Option<BodyReader<R>>,
}

impl<R: AsyncBufRead + Unpin> Response<R> {
    /// Parse a status line and headers off `reader`. `request_allows_body`
    /// should be `false` for a response to a `HEAD` request or a
    /// successful `CONNECT` (the reader has no knowledge of the
    /// originating request, so the caller computes this from the request
    /// method). 1xx/204/304 responses are always bodyless regardless of
    /// `request_allows_body` or any `Content-Length`/`Transfer-Encoding`
    /// the peer sent (RFC 7230 §3.3.3 rules 1–2) — that much the reader
    /// can determine itself once the status line is parsed.
    pub async fn read(mut reader: R, request_allows_body: bool) -> Result<Self, HttpParseError> {
        let (version, status, reason) = read_status_line(&mut reader).await?;
        let headers = Headers::parse_from(&mut reader, MAX_HEADER_BYTES).await?;

        let has_body = request_allows_body && !is_bodyless_status(status);
        let framing = if has_body {
            response_framing(&headers)?
        } else {
            Framing::Empty
        };

        Ok(Self {
            version,
            status,
            reason,
            headers,
            body: Some(BodyReader::new(reader, framing)),
        })
    }

    pub fn take_body(&mut self) -> Option<BodyReader<R>> {
        self.body.take()
    }
}

/// RFC 7230 §3.3.3 rules 1–2: these status codes never carry a body,
/// regardless of what framing headers the peer sent.
fn is_bodyless_status(status: u16) -> bool {
    (100..200).contains(&status) || matches!(status, 204 | 304)
}

fn response_framing(headers: &Headers) -> Result<Framing, HttpParseError> {
    if let Some(te) = headers.get_first("transfer-encoding") {
        if te
            .split(',')
            .map(str::trim)
            .any(|coding| coding.eq_ignore_ascii_case("chunked"))
        {
            return Ok(Framing::Chunked);
        }
    }
    if let Some(len) = headers.get_first("content-length") {
        let n: u64 = len
            .trim()
            .parse()
            .map_err(|_| HttpParseError::InvalidContentLength)?;
        return Ok(Framing::ContentLength(n));
    }
    // Neither framing header present: HTTP/1.0-style EOF-terminated body.
    Ok(Framing::UntilClose)
}

async fn read_status_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<(&'static str, u16, String), HttpParseError> {
    let mut line = Vec::new();
    let n = reader
        .read_until(b'\n', &mut line)
        .await
        .map_err(HttpParseError::Io)?;
    if n == 0 {
        return Err(HttpParseError::UnexpectedEof);
    }
    if line.len() > MAX_STATUS_LINE_BYTES {
        return Err(HttpParseError::RequestLineTooLarge);
    }
    while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
        line.pop();
    }

    let text = String::from_utf8_lossy(&line);
    let mut parts = text.splitn(3, ' ');
    let version_raw = parts.next().ok_or(HttpParseError::MalformedRequestLine)?;
    let version = match version_raw {
        "HTTP/1.1" => "HTTP/1.1",
        "HTTP/1.0" => "HTTP/1.0",
        other => return Err(HttpParseError::UnsupportedVersion(other.to_string())),
    };
    let status: u16 = parts
        .next()
        .ok_or(HttpParseError::MalformedRequestLine)?
        .parse()
        .map_err(|_| HttpParseError::MalformedRequestLine)?;
    let reason = parts.next().unwrap_or("").to_string();

    Ok((version, status, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn parses_status_line_and_content_length_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        let mut resp = Response::read(Cursor::new(&raw[..]), true).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.reason, "OK");
        let mut body = resp.take_body().unwrap();
        let chunk = body.next_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hi");
    }

    #[tokio::test]
    async fn accepts_http_1_0() {
        let raw = b"HTTP/1.0 200 OK\r\n\r\nrest of stream is body";
        let mut resp = Response::read(Cursor::new(&raw[..]), true).await.unwrap();
        assert_eq!(resp.version, "HTTP/1.0");
        let mut body = resp.take_body().unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = body.next_chunk().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, b"rest of stream is body");
    }

    #[tokio::test]
    async fn head_response_yields_empty_body_regardless_of_headers() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
        let mut resp = Response::read(Cursor::new(&raw[..]), false).await.unwrap();
        assert!(resp.take_body().unwrap().next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn bodyless_status_yields_empty_body_even_when_request_allows_one() {
        for raw in [
            &b"HTTP/1.1 204 No Content\r\nContent-Length: 10\r\n\r\n"[..],
            &b"HTTP/1.1 304 Not Modified\r\nContent-Length: 10\r\n\r\n"[..],
            &b"HTTP/1.1 100 Continue\r\n\r\n"[..],
        ] {
            let mut resp = Response::read(Cursor::new(raw), true).await.unwrap();
            assert!(
                resp.take_body().unwrap().next_chunk().await.is_none(),
                "status {} should be bodyless",
                resp.status
            );
        }
    }
}
