//! Webhook delivery for terminal tasks.

use std::sync::Arc;

use tracing::{info, warn};

use crate::model::{Task, TaskId};
use crate::repository::Repository;
use crate::retry::RetryPolicy;
use crate::webhook::WebhookNotifier;

const MARK_ATTEMPTS: u32 = 5;

/// Sends task snapshots and records `webhook_sent` once delivered.
#[derive(Clone)]
pub(crate) struct WebhookDispatcher {
    repo: Arc<dyn Repository>,
    notifier: Arc<dyn WebhookNotifier>,
    retry: RetryPolicy,
}

impl WebhookDispatcher {
    pub(crate) fn new(
        repo: Arc<dyn Repository>,
        notifier: Arc<dyn WebhookNotifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            repo,
            notifier,
            retry,
        }
    }

    /// Delivers `task` if it carries a URL that has not been notified yet.
    /// Failures are logged only.
    pub(crate) async fn deliver(&self, task: Task) {
        let Some(url) = task.webhook_url.clone() else {
            return;
        };
        if task.webhook_sent || !task.status.is_terminal() {
            return;
        }
        let delivered = self
            .retry
            .run("webhook delivery", || self.notifier.notify(&url, &task))
            .await;
        match delivered {
            Ok(()) => self.mark_sent(&task.id).await,
            Err(err) => warn!(task_id = %task.id, %url, error = %err, "webhook delivery failed"),
        }
    }

    async fn mark_sent(&self, task_id: &TaskId) {
        for _ in 0..MARK_ATTEMPTS {
            let mut task = match self.repo.get_task(task_id).await {
                Ok(task) => task,
                Err(err) => {
                    warn!(%task_id, error = %err, "webhook sent but task could not be reloaded");
                    return;
                }
            };
            if task.webhook_sent {
                return;
            }
            task.webhook_sent = true;
            match self.repo.update_task(task).await {
                Ok(_) => {
                    info!(%task_id, "webhook delivered");
                    return;
                }
                Err(err) if err.is_stale() => {}
                Err(err) => {
                    warn!(%task_id, error = %err, "failed to record webhook delivery");
                    return;
                }
            }
        }
        warn!(%task_id, "gave up recording webhook delivery after concurrent updates");
    }
}
