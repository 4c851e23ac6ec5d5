//! The request-line method token.

use crate::error::HttpParseError;
use crate::token::is_valid_token;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Method(String);

impl Method {
    pub fn parse(raw: &str) -> Result<Self, HttpParseError> {
        if !is_valid_token(raw) {
            return Err(HttpParseError::MalformedRequestLine);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_connect(&self) -> bool {
        self.0.eq_ignore_ascii_case("CONNECT")
    }

    /// RFC 7230 §3.3 request methods that never carry a request body.
    pub fn allows_request_body(&self) -> bool {
        !matches!(
            self.0.to_ascii_uppercase().as_str(),
            "GET" | "HEAD" | "CONNECT" | "TRACE"
        )
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_non_token_methods() {
        assert!(Method::parse("").is_err());
        assert!(Method::parse("GET/1").is_err());
        assert!(Method::parse("GET").is_ok());
    }

    #[test]
    fn connect_is_case_insensitive() {
        assert!(Method::parse("connect").unwrap().is_connect());
        assert!(Method::parse("CONNECT").unwrap().is_connect());
        assert!(!Method::parse("GET").unwrap().is_connect());
    }

    #[test]
    fn get_head_connect_trace_disallow_bodies() {
        for m in ["GET", "HEAD", "CONNECT", "TRACE", "get"] {
            assert!(!Method::parse(m).unwrap().allows_request_body(), "{m}");
        }
        for m in ["POST", "PUT", "PATCH", "DELETE"] {
            assert!(Method::parse(m).unwrap().allows_request_body(), "{m}");
        }
    }
}
