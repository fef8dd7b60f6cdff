//! Delivery port: how outbox messages leave the system.
//!
//! The outbox worker owns retry and backoff policy; a [`DeliveryPort`]
//! implementation only reports what happened to one send attempt. Transport
//! failures and 5xx/429 responses are [`DeliveryOutcome::Retryable`]; other
//! 4xx responses are [`DeliveryOutcome::Permanent`].

use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The provider accepted the message.
    Delivered,
    /// Transient failure; the worker schedules another attempt.
    Retryable {
        /// HTTP status, when the failure produced one
        status: Option<u16>,
        /// Provider-supplied retry hint (e.g. a 429 Retry-After header).
        /// When present it overrides the worker's computed backoff.
        retry_after: Option<Duration>,
    },
    /// The provider rejected the message for good; no further attempts.
    Permanent {
        /// HTTP status of the rejection
        status: u16,
        /// Response body, for the `last_error` audit trail
        body: String,
    },
}

/// Port through which the outbox worker hands a message to the outside
/// world.
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of
/// `async fn` to enable trait object usage (`Arc<dyn DeliveryPort>`).
///
/// Implementations must never panic on provider misbehavior: map everything
/// to a [`DeliveryOutcome`] so one bad message cannot take the worker down.
pub trait DeliveryPort: Send + Sync {
    /// Attempt to deliver one message.
    fn send<'a>(
        &'a self,
        topic: &'a str,
        payload: &'a Value,
    ) -> Pin<Box<dyn Future<Output = DeliveryOutcome> + Send + 'a>>;
}

impl<T: DeliveryPort + ?Sized> DeliveryPort for Arc<T> {
    fn send<'a>(
        &'a self,
        topic: &'a str,
        payload: &'a Value,
    ) -> Pin<Box<dyn Future<Output = DeliveryOutcome> + Send + 'a>> {
        (**self).send(topic, payload)
    }
}
