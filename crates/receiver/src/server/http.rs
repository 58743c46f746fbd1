//! Request framing for the mirroring control channel.
//!
//! Devices speak an HTTP/RTSP-style text protocol on the control
//! connection: a request line, `Name: value` headers, a blank line and a
//! `Content-Length` body. [`RequestCodec`] turns the byte stream into
//! [`Request`]s and writes [`Response`]s back using the protocol version of
//! the request being answered.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Protocol used when no request has been seen yet.
const DEFAULT_PROTOCOL: &str = "HTTP/1.1";

/// Longest accepted header section.
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Errors produced while framing requests.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request too large: {size} bytes exceeds maximum of {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("malformed request: {0}")]
    Malformed(String),
}

/// A parsed control-channel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub protocol: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Request {
    /// Creates a request with no headers. Mostly useful in tests.
    pub fn new(method: &str, path: &str, body: impl Into<Bytes>) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Returns the first header with `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the path without query string.
    pub fn endpoint(&self) -> &str {
        self.path.split('?').next().unwrap_or_default()
    }

    /// Serializes the request. Used by device simulators and tests.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.path, self.protocol);
        for (name, value) in &self.headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// A control-channel response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: Option<&'static str>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Close the connection after sending.
    pub close: bool,
}

impl Response {
    /// An empty response with the given status.
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            headers: Vec::new(),
            body: Vec::new(),
            close: false,
        }
    }

    /// A 200 response with a body.
    pub fn with_body(content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            content_type: Some(content_type),
            body,
            ..Self::empty(200)
        }
    }

    /// A plain-text response.
    pub fn text(status: u16, message: &str) -> Self {
        Self {
            status,
            ..Self::with_body("text/plain", message.as_bytes().to_vec())
        }
    }

    /// Marks the response as the last one on the connection.
    pub fn closing(mut self) -> Self {
        self.close = true;
        self
    }

    /// Adds a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Returns the status line reason phrase.
    pub fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            413 => "Payload Too Large",
            470 => "Connection Authorization Required",
            500 => "Internal Server Error",
            503 => "Service Unavailable",
            _ => "Unknown",
        }
    }
}

/// Codec for the control channel.
#[derive(Debug)]
pub struct RequestCodec {
    max_request_size: usize,
    // Protocol and CSeq of the request being answered
    protocol: String,
    cseq: Option<String>,
}

impl RequestCodec {
    pub fn new(max_request_size: usize) -> Self {
        Self {
            max_request_size,
            protocol: DEFAULT_PROTOCOL.to_string(),
            cseq: None,
        }
    }
}

impl Decoder for RequestCodec {
    type Item = Request;
    type Error = HttpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let head_end = match find_head_end(src) {
            Some(end) => end,
            None => {
                let limit = self.max_request_size.min(MAX_HEAD_SIZE);
                if src.len() > limit {
                    return Err(HttpError::TooLarge {
                        size: src.len(),
                        max: limit,
                    });
                }
                return Ok(None);
            }
        };

        let head = std::str::from_utf8(&src[..head_end])
            .map_err(|_| HttpError::Malformed("header is not utf-8".to_string()))?;
        let mut lines = head.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (method, path, protocol) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(p), Some(v)) => (m.to_string(), p.to_string(), v.to_string()),
            _ => {
                return Err(HttpError::Malformed(format!(
                    "bad request line: {:?}",
                    request_line
                )))
            }
        };

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HttpError::Malformed(format!("bad header: {:?}", line)))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let content_length = match headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        {
            Some((_, v)) => v
                .parse::<usize>()
                .map_err(|_| HttpError::Malformed(format!("bad content-length: {:?}", v)))?,
            None => 0,
        };

        let total = match (head_end + 4).checked_add(content_length) {
            Some(total) if total <= self.max_request_size => total,
            Some(total) => {
                return Err(HttpError::TooLarge {
                    size: total,
                    max: self.max_request_size,
                })
            }
            None => {
                return Err(HttpError::TooLarge {
                    size: usize::MAX,
                    max: self.max_request_size,
                })
            }
        };
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let _head = src.split_to(head_end + 4);
        let body = src.split_to(content_length).freeze();

        self.protocol = protocol.clone();
        self.cseq = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("cseq"))
            .map(|(_, v)| v.clone());

        Ok(Some(Request {
            method,
            path,
            protocol,
            headers,
            body,
        }))
    }
}

impl Encoder<Response> for RequestCodec {
    type Error = HttpError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut head = format!("{} {} {}\r\n", self.protocol, item.status, item.reason());
        if let Some(cseq) = &self.cseq {
            head.push_str(&format!("CSeq: {}\r\n", cseq));
        }
        head.push_str("Server: Mirrorwall/");
        head.push_str(env!("CARGO_PKG_VERSION"));
        head.push_str("\r\n");
        if let Some(content_type) = item.content_type {
            head.push_str(&format!("Content-Type: {}\r\n", content_type));
        }
        for (name, value) in &item.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str(&format!("Content-Length: {}\r\n", item.body.len()));
        if item.close {
            head.push_str("Connection: close\r\n");
        }
        head.push_str("\r\n");

        dst.reserve(head.len() + item.body.len());
        dst.put_slice(head.as_bytes());
        dst.put_slice(&item.body);
        Ok(())
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parses one response from `buf`. Used by device simulators and tests.
///
/// Returns the status, headers, body and the number of bytes consumed, or
/// `None` if `buf` does not yet hold a complete response.
pub fn parse_response(buf: &[u8]) -> Option<(u16, Vec<(String, String)>, Vec<u8>, usize)> {
    let head_end = find_head_end(buf)?;
    let head = std::str::from_utf8(&buf[..head_end]).ok()?;
    let mut lines = head.split("\r\n");
    let status = lines.next()?.split_whitespace().nth(1)?.parse().ok()?;
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();
    let length = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let total = (head_end + 4).checked_add(length)?;
    if buf.len() < total {
        return None;
    }
    Some((status, headers, buf[head_end + 4..total].to_vec(), total))
}
