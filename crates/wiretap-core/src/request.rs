//! HTTP/1.1 request line + header parsing, with a streamed body (component C2).

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::body::{BodyReader, Framing};
use crate::error::HttpParseError;
use crate::headers::Headers;
use crate::method::Method;

pub const MAX_REQUEST_LINE_BYTES: usize = 8 * 1024;
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// The scheme the effective request was reached under. The parser has no
/// TLS context of its own — the connection state machine passes this in:
/// `Http` for an absolute-form request read directly off the client
/// socket, `Https` once inside a freshly terminated CONNECT tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

#[derive(Debug)]
pub struct Request<R> {
    pub method: Method,
    /// The raw request-target bytes, exactly as they appeared on the wire.
    pub target: Bytes,
    pub headers: Headers,
    pub scheme: Scheme,
    body: Option<BodyReader<R>>,
}

impl<R: AsyncBufRead + Unpin> Request<R> {
    /// Parse a request line and headers off `reader`, tolerating leading
    /// blank lines (RFC 7230 §3.5). Headers are frozen as of return; the
    /// body is exposed separately via [`Request::take_body`] and must be
    /// read at most once.
    pub async fn read(mut reader: R, scheme: Scheme) -> Result<Self, HttpParseError> {
        let request_line = read_request_line(&mut reader).await?;
        let (method_raw, target, version) = split_request_line(&request_line)?;
        if version != "HTTP/1.1" {
            return Err(HttpParseError::UnsupportedVersion(version.to_string()));
        }

        let method = Method::parse(method_raw)?;
        let headers = Headers::parse_from(&mut reader, MAX_HEADER_BYTES).await?;
        let framing = body_framing(&headers)?;

        Ok(Self {
            method,
            target: Bytes::copy_from_slice(target.as_bytes()),
            headers,
            scheme,
            body: Some(BodyReader::new(reader, framing)),
        })
    }

    /// The effective host: the `Host` header if present, else the
    /// authority embedded in an absolute-form target.
    pub fn host(&self) -> Option<&str> {
        if let Some(host) = self.headers.get_first("host") {
            return Some(host);
        }
        authority_from_absolute_target(std::str::from_utf8(&self.target).ok()?)
    }

    /// Reconstruct an absolute URL from `self.scheme`, the effective host,
    /// and the request-target's path.
    pub fn url(&self) -> Option<String> {
        let target = std::str::from_utf8(&self.target).ok()?;
        if target.starts_with("http://") || target.starts_with("https://") {
            return Some(target.to_string());
        }
        let host = self.host()?;
        Some(format!("{}://{}{}", self.scheme.as_str(), host, target))
    }

    /// For a `CONNECT` request, the `host:port` authority from the target.
    pub fn connect_authority(&self) -> Option<(&str, u16)> {
        if !self.method.is_connect() {
            return None;
        }
        let target = std::str::from_utf8(&self.target).ok()?;
        split_host_port(target)
    }

    /// Take the body reader. Returns `None` if already taken — the body
    /// is single-pass, consumed at most once per request.
    pub fn take_body(&mut self) -> Option<BodyReader<R>> {
        self.body.take()
    }
}

fn authority_from_absolute_target(target: &str) -> Option<&str> {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))?;
    rest.split(['/', '?']).next()
}

fn split_host_port(target: &str) -> Option<(&str, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some((host, port))
}

async fn read_request_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<String, HttpParseError> {
    loop {
        let mut line = Vec::new();
        let n = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(HttpParseError::Io)?;
        if n == 0 {
            return Err(HttpParseError::UnexpectedEof);
        }
        if line.len() > MAX_REQUEST_LINE_BYTES {
            return Err(HttpParseError::RequestLineTooLarge);
        }
        while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
            line.pop();
        }
        if line.is_empty() {
            // Leading CRLF robustness (RFC 7230 §3.5) — keep reading.
            continue;
        }
        return Ok(String::from_utf8_lossy(&line).into_owned());
    }
}

fn split_request_line(line: &str) -> Result<(&str, &str, &str), HttpParseError> {
    let mut parts = line.splitn(3, ' ');
    let method = parts.next().ok_or(HttpParseError::MalformedRequestLine)?;
    let target = parts.next().ok_or(HttpParseError::MalformedRequestLine)?;
    let version = parts.next().ok_or(HttpParseError::MalformedRequestLine)?;
    Ok((method, target, version))
}

fn body_framing(headers: &Headers) -> Result<Framing, HttpParseError> {
    if let Some(te) = headers.get_first("transfer-encoding") {
        if te
            .split(',')
            .map(str::trim)
            .any(|coding| coding.eq_ignore_ascii_case("chunked"))
        {
            return Ok(Framing::Chunked);
        }
    }

    let mut lengths = headers.get_all("content-length");
    if let Some(first) = lengths.next() {
        let n: u64 = first
            .trim()
            .parse()
            .map_err(|_| HttpParseError::InvalidContentLength)?;
        for other in lengths {
            let m: u64 = other
                .trim()
                .parse()
                .map_err(|_| HttpParseError::InvalidContentLength)?;
            if m != n {
                return Err(HttpParseError::InvalidContentLength);
            }
        }
        return Ok(Framing::ContentLength(n));
    }

    Ok(Framing::Empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn parses_absolute_form_get() {
        let raw = b"GET http://example.test/path HTTP/1.1\r\nHost: example.test\r\n\r\n";
        let mut req = Request::read(Cursor::new(&raw[..]), Scheme::Http)
            .await
            .unwrap();
        assert_eq!(req.method.as_str(), "GET");
        assert_eq!(req.host(), Some("example.test"));
        assert_eq!(req.url().as_deref(), Some("http://example.test/path"));
        assert!(req.take_body().unwrap().next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn parses_connect_authority() {
        let raw = b"CONNECT example.test:443 HTTP/1.1\r\n\r\n";
        let req = Request::read(Cursor::new(&raw[..]), Scheme::Http)
            .await
            .unwrap();
        assert!(req.method.is_connect());
        assert_eq!(req.connect_authority(), Some(("example.test", 443)));
    }

    #[tokio::test]
    async fn rejects_http_1_0() {
        let raw = b"GET / HTTP/1.0\r\n\r\n";
        let err = Request::read(Cursor::new(&raw[..]), Scheme::Http)
            .await
            .unwrap_err();
        assert!(matches!(err, HttpParseError::UnsupportedVersion(v) if v == "HTTP/1.0"));
    }

    #[tokio::test]
    async fn rejects_request_line_over_8kib() {
        let raw = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(9 * 1024)).into_bytes();
        let err = Request::read(Cursor::new(&raw[..]), Scheme::Http)
            .await
            .unwrap_err();
        assert!(matches!(err, HttpParseError::RequestLineTooLarge));
    }

    #[tokio::test]
    async fn tolerates_leading_blank_lines() {
        let raw = b"\r\n\r\nGET / HTTP/1.1\r\nHost: a.test\r\n\r\n";
        let req = Request::read(Cursor::new(&raw[..]), Scheme::Http)
            .await
            .unwrap();
        assert_eq!(req.method.as_str(), "GET");
    }

    #[tokio::test]
    async fn reads_content_length_body() {
        let raw = b"POST /x HTTP/1.1\r\nHost: a.test\r\nContent-Length: 5\r\n\r\nhello";
        let mut req = Request::read(Cursor::new(&raw[..]), Scheme::Http)
            .await
            .unwrap();
        let mut body = req.take_body().unwrap();
        let chunk = body.next_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello");
        assert!(body.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn reads_chunked_body() {
        let raw = b"POST /x HTTP/1.1\r\nHost: a.test\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        let mut req = Request::read(Cursor::new(&raw[..]), Scheme::Http)
            .await
            .unwrap();
        let mut body = req.take_body().unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = body.next_chunk().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn rejects_conflicting_content_length() {
        let raw = b"POST /x HTTP/1.1\r\nHost: a.test\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\nx";
        let err = Request::read(Cursor::new(&raw[..]), Scheme::Http)
            .await
            .unwrap_err();
        assert!(matches!(err, HttpParseError::InvalidContentLength));
    }
}
