//! Task completion callbacks.
//!
//! Once a task is terminal its JSON snapshot is POSTed to the task's
//! `webhook_url`. Delivery failures are logged and leave `webhook_sent`
//! unset; they never change the task outcome.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;

use crate::model::Task;
use crate::retry::{Retryable, millis};

/// Future returned by [`WebhookNotifier::notify`].
pub type WebhookFuture<'a> = Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + 'a>>;

/// Delivers task snapshots to callback URLs.
pub trait WebhookNotifier: Send + Sync {
    /// Sends `task` to `url`.
    fn notify<'a>(&'a self, url: &'a str, task: &'a Task) -> WebhookFuture<'a>;
}

/// Notifier that POSTs JSON with `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpWebhookNotifier {
    client: Client,
}

impl Default for HttpWebhookNotifier {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl HttpWebhookNotifier {
    /// Creates a notifier whose requests time out after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    async fn post(&self, url: &str, task: &Task) -> Result<(), WebhookError> {
        let response = self
            .client
            .post(url)
            .json(task)
            .send()
            .await
            .map_err(|err| WebhookError::Delivery {
                url: url.to_owned(),
                message: err.to_string(),
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(WebhookError::Rejected {
            url: url.to_owned(),
            status: status.as_u16(),
        })
    }
}

impl WebhookNotifier for HttpWebhookNotifier {
    fn notify<'a>(&'a self, url: &'a str, task: &'a Task) -> WebhookFuture<'a> {
        Box::pin(self.post(url, task))
    }
}

/// Errors raised while delivering a webhook.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WebhookError {
    /// The request could not be sent.
    #[error("webhook delivery to {url} failed: {message}")]
    Delivery {
        /// Target URL.
        url: String,
        /// Transport error.
        message: String,
    },
    /// The endpoint answered with a non-success status.
    #[error("webhook {url} answered with status {status}")]
    Rejected {
        /// Target URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },
    /// The endpoint did not answer in time.
    #[error("timeout after {after_ms}ms waiting for {operation}")]
    Timeout {
        /// Operation being waited on.
        operation: String,
        /// Deadline in milliseconds.
        after_ms: u64,
    },
}

impl Retryable for WebhookError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Delivery { .. } | Self::Timeout { .. } => true,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
        }
    }

    fn timed_out(operation: &str, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.to_owned(),
            after_ms: millis(after),
        }
    }

    fn exhausted(self, _operation: &str, _attempts: u32) -> Self {
        self
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(500, true)]
    #[case(503, true)]
    #[case(429, true)]
    #[case(404, false)]
    #[case(400, false)]
    fn server_side_rejections_are_retried(#[case] status: u16, #[case] retryable: bool) {
        let error = WebhookError::Rejected {
            url: "https://hooks.example.com".to_owned(),
            status,
        };
        assert_eq!(error.is_retryable(), retryable);
    }
}
