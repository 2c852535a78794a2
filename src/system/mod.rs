//! System utilities and monitoring
//!
//! This module contains metrics collection for the repository server.

pub mod metrics;

pub use metrics::{collect_metrics, Metrics};
