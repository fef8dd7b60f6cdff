//! # Tablehold Runtime
//!
//! Resilience building blocks shared by the storage executor and the
//! background workers:
//!
//! - [`retry`]: exponential backoff policy with jitter, driven by the
//!   transaction executor and the outbox worker.
//! - [`circuit_breaker`]: fail-fast guard that stops hammering a degraded
//!   database during connection outages.
//! - [`metrics`]: Prometheus exporter and the counters/gauges every
//!   component reports into.
//!
//! These are policy objects, not I/O: the `postgres` crate wires them to
//! actual transactions.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Retry policy and exponential backoff
pub mod retry;

/// Circuit breaker guarding the storage backend
pub mod circuit_breaker;

/// Prometheus metrics for observability
pub mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, State};
pub use retry::RetryPolicy;
