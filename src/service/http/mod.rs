//! Minimal single-request HTTP service
//!
//! One request per connection: the request is assembled, handed to the
//! application, answered once with `Connection: close` and the connection
//! is torn down after the response is written. No persistent connections,
//! no chunked encoding, no pipelining.

mod message;
mod server;
mod session;

pub use message::{HttpMethod, HttpRequest, HttpResponse};
pub use server::{HttpServer, HttpServerListener};
pub use session::{
    HttpLimits, HttpSession, SessionState, DEFAULT_MAX_CONTENT_LENGTH, DEFAULT_MAX_HEADER_SIZE,
};
