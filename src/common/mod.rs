//! Common types and abstractions
//!
//! This module defines the core types used throughout the crate:
//! - Endpoint: network address representation
//! - ConnectionId: channel identifier of a client transport
//! - Error: unified error types

mod endpoint;
mod id;

pub use endpoint::Endpoint;
pub use id::ConnectionId;

// Re-export error types from crate root
pub use crate::error::{Error, Result};
