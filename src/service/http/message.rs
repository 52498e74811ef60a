//! HTTP request and response values

use bytes::{BufMut, Bytes, BytesMut};

/// Request method. Only `GET` is recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Unexpected,
}

impl HttpMethod {
    /// Case-sensitive match on the request-line token
    pub fn parse(token: &str) -> Self {
        match token {
            "GET" => HttpMethod::Get,
            _ => HttpMethod::Unexpected,
        }
    }
}

/// A fully assembled request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub uri: String,
    pub version: String,
    /// Declared body length; 0 when the header was absent
    pub content_length: usize,
    pub body: Bytes,
}

/// Response sent back on the same connection, which is then closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: String,
    /// Status code and reason phrase, e.g. `200 OK`
    pub code: String,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(version: impl Into<String>, code: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            version: version.into(),
            code: code.into(),
            body: body.into(),
        }
    }

    /// `HTTP/1.1 200 OK` with `body`
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new("HTTP/1.1", "200 OK", body)
    }

    /// Status line and headers, up to and including the blank line
    pub fn head(&self) -> Bytes {
        Bytes::from(format!(
            "{} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.version,
            self.code,
            self.body.len()
        ))
    }

    /// Full serialised response
    pub fn to_bytes(&self) -> Bytes {
        let head = self.head();
        let mut out = BytesMut::with_capacity(head.len() + self.body.len());
        out.put_slice(&head);
        out.put_slice(&self.body);
        out.freeze()
    }
}
