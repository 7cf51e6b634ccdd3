//! Observability infrastructure.
//!
//! Provides:
//! - The metrics register served by the worker health server
//! - OpenTelemetry/OTLP metrics for key operations
//! - Structured tracing setup

pub mod metrics;
pub mod register;
pub mod tracing;

pub use register::{ConsumerStatus, MetricsRegister, MetricsSnapshot};
