//! Ordered, case-insensitive-lookup header multimap (component C1).

use std::collections::HashMap;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::HttpParseError;
use crate::token::is_valid_token;

/// An ordered sequence of `(name, value)` pairs. Lookups are
/// case-insensitive; duplicates are retained verbatim — folding across
/// duplicate headers happens only where RFC 7230 §3.2.2 requires it (we
/// don't do it here; callers that need a single value per name use
/// [`Headers::to_dict`]).
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get_first(name).is_some()
    }

    pub fn remove_all(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First-occurrence value per (lowercased) name, for callers that want
    /// plain `HashMap` convenience over full multimap semantics.
    pub fn to_dict(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for (name, value) in &self.entries {
            map.entry(name.to_ascii_lowercase())
                .or_insert_with(|| value.clone());
        }
        map
    }

    /// Serialize as `name: value\r\n` lines followed by a blank line.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> std::io::Result<()> {
        for (name, value) in &self.entries {
            w.write_all(name.as_bytes()).await?;
            w.write_all(b": ").await?;
            w.write_all(value.as_bytes()).await?;
            w.write_all(b"\r\n").await?;
        }
        w.write_all(b"\r\n").await?;
        Ok(())
    }

    /// Parse header lines from `reader` up to (and consuming) the
    /// terminating blank line. `max_bytes` caps the total raw bytes read,
    /// including line terminators.
    pub async fn parse_from<R: AsyncBufRead + Unpin>(
        reader: &mut R,
        max_bytes: usize,
    ) -> Result<Self, HttpParseError> {
        let mut headers = Headers::new();
        let mut total = 0usize;
        let mut host_seen = false;

        loop {
            let mut line = Vec::new();
            let n = reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(HttpParseError::Io)?;
            if n == 0 {
                return Err(HttpParseError::UnexpectedEof);
            }
            total += n;
            if total > max_bytes {
                return Err(HttpParseError::HeadersTooLarge);
            }
            trim_crlf(&mut line);
            if line.is_empty() {
                break;
            }

            if matches!(line.first(), Some(b' ') | Some(b'\t')) && !headers.entries.is_empty() {
                let continuation = String::from_utf8_lossy(&line);
                let last = headers.entries.last_mut().expect("checked non-empty above");
                last.1.push(' ');
                last.1.push_str(continuation.trim());
                continue;
            }

            let text = String::from_utf8_lossy(&line);
            let colon = text.find(':').ok_or(HttpParseError::MalformedHeaderLine)?;
            let name = text[..colon].trim();
            if !is_valid_token(name) {
                return Err(HttpParseError::MalformedHeaderLine);
            }
            let value = text[colon + 1..].trim_matches(|c| c == ' ' || c == '\t');
            if value.bytes().any(|b| b == b'\r' || b == b'\n') {
                return Err(HttpParseError::MalformedHeaderLine);
            }

            if name.eq_ignore_ascii_case("host") {
                if host_seen {
                    return Err(HttpParseError::DuplicateHostHeader);
                }
                host_seen = true;
            }

            headers.append(name.to_string(), value.to_string());
        }

        Ok(headers)
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a str, &'a str);
    type IntoIter = std::iter::Map<
        std::slice::Iter<'a, (String, String)>,
        fn(&'a (String, String)) -> (&'a str, &'a str),
    >;

    fn into_iter(self) -> Self::IntoIter {
        self.entries
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

fn trim_crlf(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn parses_basic_headers_and_stops_at_blank_line() {
        let raw = b"Host: example.test\r\nX-Foo: bar\r\n\r\nbody-follows";
        let mut reader = Cursor::new(&raw[..]);
        let headers = Headers::parse_from(&mut reader, 64 * 1024).await.unwrap();

        assert_eq!(headers.get_first("host"), Some("example.test"));
        assert_eq!(headers.get_first("HOST"), Some("example.test"));
        assert_eq!(headers.get_first("x-foo"), Some("bar"));
        assert_eq!(headers.len(), 2);
    }

    #[tokio::test]
    async fn folds_obsolete_continuation_lines() {
        let raw = b"X-Multi: first\r\n  second\r\n\r\n";
        let mut reader = Cursor::new(&raw[..]);
        let headers = Headers::parse_from(&mut reader, 64 * 1024).await.unwrap();
        assert_eq!(headers.get_first("x-multi"), Some("first second"));
    }

    #[tokio::test]
    async fn rejects_duplicate_host() {
        let raw = b"Host: a.test\r\nHost: b.test\r\n\r\n";
        let mut reader = Cursor::new(&raw[..]);
        let err = Headers::parse_from(&mut reader, 64 * 1024).await.unwrap_err();
        assert!(matches!(err, HttpParseError::DuplicateHostHeader));
    }

    #[tokio::test]
    async fn rejects_lines_without_colon() {
        let raw = b"not-a-header\r\n\r\n";
        let mut reader = Cursor::new(&raw[..]);
        let err = Headers::parse_from(&mut reader, 64 * 1024).await.unwrap_err();
        assert!(matches!(err, HttpParseError::MalformedHeaderLine));
    }

    #[test]
    fn to_dict_keeps_first_occurrence() {
        let mut headers = Headers::new();
        headers.append("X-Foo", "1");
        headers.append("x-foo", "2");
        let dict = headers.to_dict();
        assert_eq!(dict.get("x-foo"), Some(&"1".to_string()));
    }

    #[tokio::test]
    async fn write_to_round_trips_through_parse_from() {
        let mut headers = Headers::new();
        headers.append("Host", "example.test");
        headers.append("X-Foo", "bar");

        let mut buf = Vec::new();
        headers.write_to(&mut buf).await.unwrap();

        let mut reader = Cursor::new(buf);
        let reparsed = Headers::parse_from(&mut reader, 64 * 1024).await.unwrap();
        assert_eq!(reparsed.get_first("host"), Some("example.test"));
        assert_eq!(reparsed.get_first("x-foo"), Some("bar"));
    }
}
