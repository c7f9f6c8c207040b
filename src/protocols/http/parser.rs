//! HTTP/1.x request parsing.
//!
//! Only what the hand-off needs: request line, headers and a
//! `Content-Length` body. Chunked request bodies are rejected.

use crate::runtime::middleware::{detect_prefix, Detection};
use bytes::Bytes;

/// Request methods recognized during protocol detection.
const METHODS: &[&[u8]] = &[
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"TRACE ",
    b"CONNECT ",
];

/// Largest accepted request head, terminator included.
pub const MAX_HEAD_LEN: usize = 8 * 1024;

/// Largest accepted request body.
pub const MAX_BODY_LEN: usize = 1024 * 1024;

/// A parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Path component of the target.
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }

    /// Whether the connection stays open after the response.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("connection");
        if self.version == "HTTP/1.0" {
            connection.is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"))
        } else {
            !connection.is_some_and(|v| v.eq_ignore_ascii_case("close"))
        }
    }
}

/// Parse result
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed a request with bytes consumed
    Complete(HttpRequest, usize),
    /// Need more data
    Incomplete,
    /// Parse error
    Error(String),
}

/// Decide whether the buffered bytes start an HTTP request line.
pub fn detect(buffer: &[u8]) -> Detection {
    let mut result = Detection::Mismatch;
    for method in METHODS {
        match detect_prefix(buffer, method) {
            Detection::Match => return Detection::Match,
            Detection::NeedMore => result = Detection::NeedMore,
            Detection::Mismatch => {}
        }
    }
    result
}

/// Parse one request from the front of `buffer` without consuming it.
pub fn parse(buffer: &[u8]) -> ParseResult {
    let Some(head_end) = find_head_end(buffer) else {
        if buffer.len() >= MAX_HEAD_LEN {
            return ParseResult::Error("request head too large".to_string());
        }
        return ParseResult::Incomplete;
    };

    let head = match std::str::from_utf8(&buffer[..head_end]) {
        Ok(head) => head,
        Err(_) => return ParseResult::Error("request head is not valid UTF-8".to_string()),
    };

    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return ParseResult::Error(format!("malformed request line: {}", request_line));
    };
    if !version.starts_with("HTTP/1.") {
        return ParseResult::Error(format!("unsupported version: {}", version));
    }

    let mut headers = Vec::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return ParseResult::Error(format!("malformed header: {}", line));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let mut request = HttpRequest {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
        body: Bytes::new(),
    };

    if request
        .header("transfer-encoding")
        .is_some_and(|v| !v.eq_ignore_ascii_case("identity"))
    {
        return ParseResult::Error("chunked request bodies are not supported".to_string());
    }

    let body_len = match request.header("content-length") {
        None => 0,
        Some(value) => match value.parse::<usize>() {
            Ok(len) if len <= MAX_BODY_LEN => len,
            Ok(len) => return ParseResult::Error(format!("body of {} bytes too large", len)),
            Err(_) => return ParseResult::Error(format!("invalid content-length: {}", value)),
        },
    };

    let body_start = head_end + 4;
    let total = body_start + body_len;
    if buffer.len() < total {
        return ParseResult::Incomplete;
    }
    request.body = Bytes::copy_from_slice(&buffer[body_start..total]);

    ParseResult::Complete(request, total)
}

/// Offset of the blank line ending the head, searched within the head limit.
fn find_head_end(buffer: &[u8]) -> Option<usize> {
    let limit = buffer.len().min(MAX_HEAD_LEN);
    buffer[..limit].windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect() {
        assert_eq!(detect(b"GET / HTTP/1.1\r\n"), Detection::Match);
        assert_eq!(detect(b"OPTIONS * HTTP/1.1\r\n"), Detection::Match);
        assert_eq!(detect(b"PO"), Detection::NeedMore);
        assert_eq!(detect(b""), Detection::NeedMore);
        assert_eq!(detect(b"GETX"), Detection::Mismatch);
        assert_eq!(detect(&[0xFA, 0, 0, 0, 9]), Detection::Mismatch);
        assert_eq!(detect(b"<policy-file-request/>\0"), Detection::Mismatch);
    }

    #[test]
    fn test_parse_get() {
        let data = b"GET /status?full=1 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
        match parse(data) {
            ParseResult::Complete(request, consumed) => {
                assert_eq!(consumed, data.len());
                assert_eq!(request.method, "GET");
                assert_eq!(request.path(), "/status");
                assert_eq!(request.header("HOST"), Some("localhost"));
                assert!(!request.keep_alive());
                assert!(request.body.is_empty());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_body_and_pipelining() {
        let data = b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET / HTTP/1.1\r\n\r\n";
        match parse(data) {
            ParseResult::Complete(request, consumed) => {
                assert_eq!(&request.body[..], b"hello");
                assert!(request.keep_alive());
                assert_eq!(&data[consumed..], b"GET / HTTP/1.1\r\n\r\n");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_incomplete() {
        assert!(matches!(parse(b"GET / HTTP/1.1\r\nHost:"), ParseResult::Incomplete));
        assert!(matches!(
            parse(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc"),
            ParseResult::Incomplete
        ));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(parse(b"GET /\r\n\r\n"), ParseResult::Error(_)));
        assert!(matches!(
            parse(b"GET / HTTP/1.1\r\nContent-Length: x\r\n\r\n"),
            ParseResult::Error(_)
        ));
        assert!(matches!(
            parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n"),
            ParseResult::Error(_)
        ));

        let huge = vec![b'a'; MAX_HEAD_LEN + 1];
        assert!(matches!(parse(&huge), ParseResult::Error(_)));
    }

    #[test]
    fn test_http10_keep_alive() {
        let data = b"GET / HTTP/1.0\r\n\r\n";
        let ParseResult::Complete(request, _) = parse(data) else {
            panic!("expected a request");
        };
        assert!(!request.keep_alive());
    }
}
