//! Outbound webhook delivery.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use pulse_events::Event;

/// JSON body POSTed to a webhook destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub rule_id: String,
    pub event: Event,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WebhookError {
    #[error("webhook request timed out")]
    Timeout,

    #[error("webhook transport error: {0}")]
    Transport(String),

    #[error("webhook returned status {0}")]
    Status(u16),
}

#[async_trait]
pub trait WebhookClient: Send + Sync {
    /// Deliver `payload` to `url`. Returns the response status on 2xx.
    async fn send(&self, url: &str, payload: &WebhookPayload) -> Result<u16, WebhookError>;
}

#[async_trait]
impl<C> WebhookClient for Arc<C>
where
    C: WebhookClient + ?Sized,
{
    async fn send(&self, url: &str, payload: &WebhookPayload) -> Result<u16, WebhookError> {
        (**self).send(url, payload).await
    }
}

/// `reqwest`-backed client with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpWebhookClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpWebhookClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl WebhookClient for HttpWebhookClient {
    #[instrument(skip(self, payload), fields(rule_id = %payload.rule_id, event_id = %payload.event.id), err)]
    async fn send(&self, url: &str, payload: &WebhookPayload) -> Result<u16, WebhookError> {
        let response = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WebhookError::Timeout
                } else {
                    WebhookError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(WebhookError::Status(status.as_u16()))
        }
    }
}

/// A delivery captured by [`RecordingWebhookClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedDelivery {
    pub url: String,
    pub payload: WebhookPayload,
}

/// Records every call instead of sending it. Scripted failures are returned
/// first, in order; once they run out every call succeeds with 200.
#[derive(Debug, Default)]
pub struct RecordingWebhookClient {
    deliveries: Mutex<Vec<RecordedDelivery>>,
    scripted_failures: Mutex<Vec<WebhookError>>,
}

impl RecordingWebhookClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next calls with `errors`, in order.
    pub fn fail_with(&self, errors: impl IntoIterator<Item = WebhookError>) {
        if let Ok(mut scripted) = self.scripted_failures.lock() {
            scripted.extend(errors);
        }
    }

    /// Every call made so far, failed ones included.
    pub fn deliveries(&self) -> Vec<RecordedDelivery> {
        self.deliveries
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl WebhookClient for RecordingWebhookClient {
    async fn send(&self, url: &str, payload: &WebhookPayload) -> Result<u16, WebhookError> {
        if let Ok(mut deliveries) = self.deliveries.lock() {
            deliveries.push(RecordedDelivery {
                url: url.to_string(),
                payload: payload.clone(),
            });
        }

        let scripted = self
            .scripted_failures
            .lock()
            .ok()
            .and_then(|mut s| (!s.is_empty()).then(|| s.remove(0)));
        match scripted {
            Some(err) => Err(err),
            None => Ok(200),
        }
    }
}
