//! tcpnet - asynchronous TCP transports and minimal services
//!
//! # Architecture
//!
//! ```text
//! ServerTransport (accept)
//! → ClientTransport (one per connection, state machine)
//! → TransportEvent channel
//! → Service (TcpServer / HttpServer)
//! → Application listener
//! ```
//!
//! ## Core Principles
//!
//! - Transports only move bytes and report lifecycle events
//! - Every `stop` ends in exactly one terminate notification
//! - Services own their connections and decide when they end
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Endpoint, ConnectionId
//! ├── transport/       # Client and server transports, listener contracts
//! ├── service/         # TcpServer and HttpServer
//! └── app/             # Application: Runtime, metrics
//! ```

// Core types
pub mod common;
pub mod error;

// Layers
pub mod transport;
pub mod service;
pub mod app;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{ConnectionId, Endpoint};
pub use config::Config;
pub use error::{Error, Result};

pub use app::Runtime;
pub use service::{HttpServer, HttpServerListener, TcpServer, TcpServerListener};
pub use transport::{
    ClientListener, ClientTransport, EventChannel, ServerListener, ServerTransport,
    TransportConfig, TransportEvent, TransportState,
};
