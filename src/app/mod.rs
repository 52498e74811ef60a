//! Application Layer
//!
//! This module contains:
//! - Runtime: configuration-driven service construction and lifecycle
//! - Metrics: Prometheus counters shared by transports and services

pub mod metrics;
mod runtime;

pub use runtime::Runtime;
