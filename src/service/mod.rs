//! Service Layer
//!
//! Responsibilities:
//! - Own a server transport and every client it spawns
//! - Turn transport events into application-level callbacks
//! - Decide when a connection is finished and tear it down
//!
//! Each service consumes the `TransportEvent`s of its server and clients
//! from one channel in a single task, so per-connection state is only ever
//! advanced in event order.

pub mod http;
pub mod tcp;

pub use http::{HttpServer, HttpServerListener};
pub use tcp::{TcpServer, TcpServerListener};
