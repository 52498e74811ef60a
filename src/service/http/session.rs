//! Per-connection HTTP request assembly
//!
//! ```text
//! WaitingForHeaderPart ──\r\n\r\n──> WaitingForContentPart ──body──┐
//!          │                                                       v
//!          └──────────no Content-Length──────────────────> RequestReady
//!                                                                  │
//!        WaitingForSendComplete <──response── WaitingForOurResponse <┘
//! ```
//!
//! Anything malformed ends in `Error`; the owner closes the connection
//! without answering.

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use crate::common::ConnectionId;
use crate::error::{Error, Result};

use super::message::{HttpMethod, HttpRequest, HttpResponse};

/// Default cap on the header block (64KB)
pub const DEFAULT_MAX_HEADER_SIZE: usize = 64 * 1024;

/// Default cap on a declared body (16MB)
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 16 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Size limits applied while assembling a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpLimits {
    pub max_header_size: usize,
    pub max_content_length: usize,
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    WaitingForHeaderPart,
    WaitingForContentPart,
    RequestReady,
    WaitingForOurResponse,
    WaitingForSendComplete,
    Error,
}

/// Request-line fields, kept until the body is complete
#[derive(Debug, Default)]
struct RequestHead {
    method: Option<HttpMethod>,
    uri: String,
    version: String,
    content_length: usize,
}

/// State of one HTTP exchange
#[derive(Debug)]
pub struct HttpSession {
    client: ConnectionId,
    limits: HttpLimits,
    state: SessionState,
    buffer: BytesMut,
    head: RequestHead,
    request: Option<HttpRequest>,
}

impl HttpSession {
    pub fn new(client: ConnectionId, limits: HttpLimits) -> Self {
        Self {
            client,
            limits,
            state: SessionState::WaitingForHeaderPart,
            buffer: BytesMut::new(),
            head: RequestHead::default(),
            request: None,
        }
    }

    pub fn client(&self) -> ConnectionId {
        self.client
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Feed received bytes.
    ///
    /// Returns the state reached. Data arriving when no more is expected
    /// is a protocol violation.
    pub fn on_data(&mut self, data: &[u8]) -> Result<SessionState> {
        match self.state {
            SessionState::WaitingForHeaderPart | SessionState::WaitingForContentPart => {}
            state => {
                return Err(Error::Protocol(format!(
                    "{} bytes received in state {:?}",
                    data.len(),
                    state
                )));
            }
        }

        trace!("[{}] {} bytes for HTTP session", self.client, data.len());
        self.buffer.extend_from_slice(data);

        if self.state == SessionState::WaitingForHeaderPart {
            // Earlier bytes were already searched; only a terminator
            // straddling the old tail can start before the new data.
            let from = (self.buffer.len() - data.len()).saturating_sub(HEADER_TERMINATOR.len() - 1);
            match find(&self.buffer[from..], HEADER_TERMINATOR).map(|pos| from + pos) {
                Some(pos) if pos + HEADER_TERMINATOR.len() <= self.limits.max_header_size => {
                    let header = self.buffer.split_to(pos + HEADER_TERMINATOR.len());
                    self.state = self.parse_headers(&header[..pos]);
                }
                Some(_) => self.fail("header block too large"),
                None if self.buffer.len() > self.limits.max_header_size => {
                    self.fail("header block too large")
                }
                None => {}
            }
        }

        let body_complete = match self.state {
            SessionState::WaitingForContentPart => self.buffer.len() >= self.head.content_length,
            SessionState::RequestReady => true,
            _ => false,
        };
        if body_complete {
            self.assemble();
        }

        Ok(self.state)
    }

    /// Parse the header block (without its terminating blank line)
    fn parse_headers(&mut self, header: &[u8]) -> SessionState {
        let text = String::from_utf8_lossy(header);
        let mut lines = text.split("\r\n");

        let mut tokens = lines.next().unwrap_or_default().split(' ');
        self.head.method = Some(HttpMethod::parse(tokens.next().unwrap_or_default()));
        self.head.uri = tokens.next().unwrap_or_default().to_string();
        self.head.version = tokens.next().unwrap_or_default().to_string();

        for line in lines {
            let line = line.trim_start();
            let Some(colon) = line.find(':') else {
                continue;
            };
            let (name, value) = line.split_at(colon + 1);
            if !name.eq_ignore_ascii_case("Content-Length:") {
                continue;
            }

            return match leading_number(value) {
                Some(length) if length > self.limits.max_content_length => {
                    debug!(
                        "[{}] Content-Length {} exceeds limit {}",
                        self.client, length, self.limits.max_content_length
                    );
                    SessionState::Error
                }
                Some(0) => SessionState::RequestReady,
                Some(length) => {
                    self.head.content_length = length;
                    SessionState::WaitingForContentPart
                }
                None => {
                    debug!("[{}] Malformed Content-Length: {:?}", self.client, value);
                    SessionState::Error
                }
            };
        }

        SessionState::RequestReady
    }

    fn assemble(&mut self) {
        let length = self.head.content_length;
        let body = self.buffer.split_to(length).freeze();
        if self.buffer.has_remaining() {
            debug!(
                "[{}] Discarding {} bytes past Content-Length",
                self.client,
                self.buffer.remaining()
            );
            self.buffer.clear();
        }

        self.request = Some(HttpRequest {
            method: self.head.method.unwrap_or(HttpMethod::Unexpected),
            uri: std::mem::take(&mut self.head.uri),
            version: std::mem::take(&mut self.head.version),
            content_length: length,
            body,
        });
        self.state = SessionState::RequestReady;
    }

    fn fail(&mut self, reason: &str) {
        debug!("[{}] HTTP session failed: {}", self.client, reason);
        self.buffer.clear();
        self.state = SessionState::Error;
    }

    /// Hand the assembled request to the application
    pub fn take_request(&mut self) -> Result<HttpRequest> {
        if self.state != SessionState::RequestReady {
            return Err(Error::invalid_state("RequestReady", self.state));
        }
        let request = self
            .request
            .take()
            .ok_or_else(|| Error::invalid_state("assembled request", self.state))?;
        self.state = SessionState::WaitingForOurResponse;
        Ok(request)
    }

    /// Accept the application's response for sending
    pub fn prepare_response(&mut self, response: &HttpResponse) -> Result<()> {
        if self.state != SessionState::WaitingForOurResponse {
            return Err(Error::invalid_state("WaitingForOurResponse", self.state));
        }
        trace!("[{}] Responding {}", self.client, response.code);
        self.state = SessionState::WaitingForSendComplete;
        Ok(())
    }

    pub fn on_send_complete(&mut self) -> Result<()> {
        if self.state != SessionState::WaitingForSendComplete {
            return Err(Error::Protocol(format!(
                "send completed in state {:?}",
                self.state
            )));
        }
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// scanf-style unsigned parse: skip leading whitespace, take the leading digits
fn leading_number(value: &str) -> Option<usize> {
    let value = value.trim_start();
    let end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    value[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> HttpSession {
        HttpSession::new(ConnectionId::next(), HttpLimits::default())
    }

    #[test]
    fn test_request_with_body() {
        let mut session = session();
        let state = session
            .on_data(b"GET /foo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
            .unwrap();
        assert_eq!(state, SessionState::RequestReady);

        let request = session.take_request().unwrap();
        assert_eq!(session.state(), SessionState::WaitingForOurResponse);
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.uri, "/foo");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.content_length, 5);
        assert_eq!(&request.body[..], b"hello");
    }

    #[test]
    fn test_request_in_pieces() {
        let mut session = session();
        assert_eq!(
            session.on_data(b"GET /a HTTP/1.1\r\nConte").unwrap(),
            SessionState::WaitingForHeaderPart
        );
        assert_eq!(
            session.on_data(b"nt-Length: 4\r\n\r\nab").unwrap(),
            SessionState::WaitingForContentPart
        );
        assert_eq!(session.on_data(b"cd").unwrap(), SessionState::RequestReady);
        assert_eq!(&session.take_request().unwrap().body[..], b"abcd");
    }

    #[test]
    fn test_no_content_length_is_ready_immediately() {
        let mut session = session();
        let state = session
            .on_data(b"GET / HTTP/1.0\r\nHost: localhost\r\n\r\n")
            .unwrap();
        assert_eq!(state, SessionState::RequestReady);
        let request = session.take_request().unwrap();
        assert_eq!(request.content_length, 0);
        assert!(request.body.is_empty());
    }

    #[test]
    fn test_zero_content_length() {
        let mut session = session();
        let state = session
            .on_data(b"GET / HTTP/1.1\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        assert_eq!(state, SessionState::RequestReady);
    }

    #[test]
    fn test_malformed_content_length() {
        let mut session = session();
        let state = session
            .on_data(b"GET / HTTP/1.1\r\nContent-Length: abc\r\n\r\n")
            .unwrap();
        assert_eq!(state, SessionState::Error);
        assert!(session.on_data(b"more").is_err());
        assert!(session.take_request().is_err());
    }

    #[test]
    fn test_content_length_case_and_trailing_garbage() {
        let mut session = session();
        let state = session
            .on_data(b"GET / HTTP/1.1\r\ncontent-LENGTH:   3xyz\r\n\r\nabc")
            .unwrap();
        assert_eq!(state, SessionState::RequestReady);
        assert_eq!(session.take_request().unwrap().content_length, 3);
    }

    #[test]
    fn test_content_length_without_space() {
        let mut session = session();
        assert_eq!(
            session.on_data(b"POST /u HTTP/1.1\r\nContent-Length:5\r\n\r\n").unwrap(),
            SessionState::WaitingForContentPart
        );
        assert_eq!(session.on_data(b"hello").unwrap(), SessionState::RequestReady);
        assert_eq!(&session.take_request().unwrap().body[..], b"hello");

        let mut lowercase = HttpSession::new(ConnectionId::next(), HttpLimits::default());
        let state = lowercase
            .on_data(b"GET / HTTP/1.1\r\ncontent-length:2\r\n\r\nok")
            .unwrap();
        assert_eq!(state, SessionState::RequestReady);
        assert_eq!(&lowercase.take_request().unwrap().body[..], b"ok");
    }

    #[test]
    fn test_terminator_split_across_chunks() {
        let mut session = session();
        let chunks: [&[u8]; 4] = [b"GET /t HTTP/1.1\r", b"\n", b"\r", b"\n"];
        for chunk in chunks {
            session.on_data(chunk).unwrap();
        }
        assert_eq!(session.state(), SessionState::RequestReady);
        assert_eq!(session.take_request().unwrap().uri, "/t");
    }

    #[test]
    fn test_first_content_length_wins() {
        let mut session = session();
        session
            .on_data(b"GET / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 9\r\n\r\nz")
            .unwrap();
        assert_eq!(&session.take_request().unwrap().body[..], b"z");
    }

    #[test]
    fn test_surplus_bytes_are_dropped() {
        let mut session = session();
        let state = session
            .on_data(b"GET / HTTP/1.1\r\nContent-Length: 2\r\n\r\nokEXTRA")
            .unwrap();
        assert_eq!(state, SessionState::RequestReady);
        assert_eq!(&session.take_request().unwrap().body[..], b"ok");
    }

    #[test]
    fn test_request_line_tokens() {
        let mut session = session();
        session.on_data(b"POST\r\n\r\n").unwrap();
        let request = session.take_request().unwrap();
        assert_eq!(request.method, HttpMethod::Unexpected);
        assert_eq!(request.uri, "");
        assert_eq!(request.version, "");
    }

    #[test]
    fn test_limits() {
        let limits = HttpLimits {
            max_header_size: 32,
            max_content_length: 10,
        };

        let mut session = HttpSession::new(ConnectionId::next(), limits);
        let state = session.on_data(&[b'a'; 33]).unwrap();
        assert_eq!(state, SessionState::Error);

        let mut session = HttpSession::new(ConnectionId::next(), limits);
        let state = session.on_data(b"GET / X\r\nContent-Length: 11\r\n\r\n").unwrap();
        assert_eq!(state, SessionState::Error);
    }

    #[test]
    fn test_response_flow() {
        let mut session = session();
        let response = HttpResponse::ok("OK");

        assert!(session.prepare_response(&response).is_err());
        session.on_data(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(session.prepare_response(&response).is_err());
        assert!(session.on_send_complete().is_err());

        session.take_request().unwrap();
        session.prepare_response(&response).unwrap();
        assert_eq!(session.state(), SessionState::WaitingForSendComplete);
        assert!(session.prepare_response(&response).is_err());
        assert!(session.on_data(b"late").is_err());
        session.on_send_complete().unwrap();
    }
}
