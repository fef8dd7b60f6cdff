//! HTTP delivery adapter.
//!
//! Posts each outbox message as `{"topic": ..., "payload": ...}` JSON to a
//! configured endpoint and maps the response onto [`DeliveryOutcome`]:
//! 2xx is delivered, 429 and 5xx are retryable (429 carrying the
//! `Retry-After` hint), every other 4xx is a permanent rejection, and
//! transport errors are retryable.

use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tablehold_core::{DeliveryOutcome, DeliveryPort};

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// [`DeliveryPort`] over HTTP POST.
#[derive(Debug, Clone)]
pub struct HttpDeliveryPort {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDeliveryPort {
    /// Create an adapter posting to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns the `reqwest` error when the client cannot be built.
    pub fn new(endpoint: String) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_SEND_TIMEOUT)
            .build()?;
        Ok(Self { client, endpoint })
    }

    /// Create an adapter reusing an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client, endpoint: String) -> Self {
        Self { client, endpoint }
    }
}

impl DeliveryPort for HttpDeliveryPort {
    fn send<'a>(
        &'a self,
        topic: &'a str,
        payload: &'a Value,
    ) -> Pin<Box<dyn Future<Output = DeliveryOutcome> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.endpoint)
                .json(&json!({ "topic": topic, "payload": payload }))
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return DeliveryOutcome::Delivered;
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        return DeliveryOutcome::Retryable {
                            status: Some(status.as_u16()),
                            retry_after: parse_retry_after(&response),
                        };
                    }
                    if status.is_server_error() {
                        return DeliveryOutcome::Retryable {
                            status: Some(status.as_u16()),
                            retry_after: None,
                        };
                    }
                    let body = response.text().await.unwrap_or_default();
                    DeliveryOutcome::Permanent {
                        status: status.as_u16(),
                        body,
                    }
                }
                Err(e) => {
                    tracing::warn!(topic = topic, error = %e, "delivery transport error");
                    DeliveryOutcome::Retryable {
                        status: e.status().map(|s| s.as_u16()),
                        retry_after: None,
                    }
                }
            }
        })
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
