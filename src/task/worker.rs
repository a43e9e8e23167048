//! Worker pool draining the task queue.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::runner::TaskRunner;
use crate::error::EngineError;
use crate::model::{TaskId, TaskStatus};
use crate::repository::{ListOptions, TaskFilter};

const INTERRUPTED: &str = "worker stopped while the task was running; instances keep their \
                           provider ids and can be terminated with a new task";

/// Tasks touched by start-up recovery.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Recovery {
    /// `running` tasks marked failed.
    pub interrupted: usize,
    /// `pending` tasks queued again.
    pub requeued: usize,
}

/// A fixed set of workers sharing one queue receiver.
#[derive(Debug)]
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(runner: &TaskRunner, queue: mpsc::Receiver<TaskId>, workers: usize) -> Self {
        let (shutdown, signal) = watch::channel(false);
        let receiver = Arc::new(Mutex::new(queue));
        let handles = (0..workers.max(1))
            .map(|index| {
                tokio::spawn(work(
                    index,
                    runner.clone(),
                    Arc::clone(&receiver),
                    signal.clone(),
                ))
            })
            .collect();
        Self { shutdown, handles }
    }

    /// Asks every worker to stop after its current task.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Waits for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "worker exited abnormally");
            }
        }
    }
}

async fn work(
    index: usize,
    runner: TaskRunner,
    receiver: Arc<Mutex<mpsc::Receiver<TaskId>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = tokio::select! {
            _ = shutdown.changed() => None,
            task_id = async { receiver.lock().await.recv().await } => task_id,
        };
        let Some(task_id) = next else {
            break;
        };
        runner.run(&task_id).await;
    }
    debug!(worker = index, "worker stopped");
}

/// Fails tasks a previous process left `running` and queues `pending` ones
/// again, oldest first.
pub(crate) async fn recover(
    runner: &TaskRunner,
    queue: &mpsc::Sender<TaskId>,
) -> Result<Recovery, EngineError> {
    let mut recovery = Recovery::default();

    let running = runner.repo.list_tasks(&with_status(TaskStatus::Running)).await?;
    for mut task in running {
        task.transition(TaskStatus::Failed)?;
        task.error = Some(INTERRUPTED.to_owned());
        match runner.repo.update_task(task).await {
            Ok(saved) => {
                warn!(task_id = %saved.id, "interrupted task marked failed");
                recovery.interrupted += 1;
                runner.webhooks.deliver(saved).await;
            }
            Err(err) if err.is_stale() => {}
            Err(err) => return Err(err.into()),
        }
    }

    let pending = runner.repo.list_tasks(&with_status(TaskStatus::Pending)).await?;
    for task in pending.into_iter().rev() {
        queue
            .send(task.id)
            .await
            .map_err(|_| EngineError::Server("task queue closed during recovery".to_owned()))?;
        recovery.requeued += 1;
    }

    if recovery != Recovery::default() {
        info!(
            interrupted = recovery.interrupted,
            requeued = recovery.requeued,
            "recovered tasks from a previous run"
        );
    }
    Ok(recovery)
}

fn with_status(status: TaskStatus) -> TaskFilter {
    TaskFilter {
        options: ListOptions {
            status: Some(status),
            ..ListOptions::default()
        },
        ..TaskFilter::default()
    }
}
