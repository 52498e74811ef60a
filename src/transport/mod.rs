//! Transport Layer
//!
//! Responsibilities:
//! - Own TCP sockets: accept, connect, read, write, close
//! - Enforce read timeouts, connect retries and graceful close
//! - Report every lifecycle step through listener callbacks
//!
//! This layer ONLY deals with raw bytes. Framing belongs to the services.
//!
//! ```text
//! ServerTransport ──accept──> ClientTransport (accepted)
//!                                 │
//!                   ClientListener callbacks
//!                                 │
//!                          service loop (TcpServer / HttpServer)
//! ```
//!
//! Each client transport is driven by one tokio task. The task owns the
//! socket, the receive buffer and the timer; the `ClientTransport` handle
//! only talks to it through a command channel.

mod client;
mod listener;
mod server;

pub use client::ClientTransport;
pub use listener::{ClientListener, EventChannel, ServerListener, TransportEvent};
pub use server::ServerTransport;

use std::time::Duration;

/// Default receive buffer size (64KB)
pub const DEFAULT_INBUF_SIZE: usize = 64 * 1024;

/// Default number of send-queue slots
pub const DEFAULT_SEND_BUFFER_COUNT: usize = 2;

/// Default read timeout (60 seconds)
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Default delay between outbound connect attempts
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(3000);

/// Default bound for one connect attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound for flushing and half-closing on stop
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(1000);

/// Per-connection transport settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Size of the fixed receive buffer
    pub inbuf_size: usize,
    /// Spans that may be in flight at once
    pub send_buffer_count: usize,
    /// Read timeout; `None` disables the timer
    pub read_timeout: Option<Duration>,
    /// Delay before an initiator retries a failed connect
    pub restart_delay: Duration,
    /// Bound for one connect attempt
    pub connect_timeout: Duration,
    /// Bound for the graceful close on stop
    pub close_grace: Duration,
    /// Connect retries after the first failure; `None` retries forever
    pub max_connect_retries: Option<u32>,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            inbuf_size: DEFAULT_INBUF_SIZE,
            send_buffer_count: DEFAULT_SEND_BUFFER_COUNT,
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            restart_delay: DEFAULT_RESTART_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            close_grace: DEFAULT_CLOSE_GRACE,
            max_connect_retries: None,
            nodelay: true,
        }
    }
}

impl TransportConfig {
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_send_buffer_count(mut self, count: usize) -> Self {
        self.send_buffer_count = count;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_max_connect_retries(mut self, retries: Option<u32>) -> Self {
        self.max_connect_retries = retries;
        self
    }
}

/// Lifecycle state of a client transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Constructed or reset, not started
    Idle,
    /// Initiator: connect in flight or waiting to retry
    Connecting,
    /// Socket usable for read and write
    Connected,
    /// Connection lost, waiting for `stop`
    Disconnected,
    /// `stop` requested, draining running objects
    Terminating,
    /// Everything released; may be reset
    Closed,
}

/// Lifecycle state of a server transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Listening,
    Terminating,
    Closed,
}
