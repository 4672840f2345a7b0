use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::info;
use uuid::Uuid;

use super::job_queue::{EnqueueOutcome, JobQueue, NewJob, QueueError};

pub const INVESTIGATE_TASK: &str = "investigate";

/// Dedup key for a run's job.
pub fn job_key(run_id: Uuid) -> String {
    format!("investigate-run:{run_id}")
}

/// Opens the underlying queue. Called at most once per successful init.
#[async_trait]
pub trait JobQueueConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn JobQueue>, QueueError>;
}

enum QueueState {
    Idle,
    Ready(Arc<dyn JobQueue>),
    Closed,
}

/// Owns the process's queue connection: opened lazily on first use and
/// released by a single shutdown that every `close` caller observes.
pub struct QueueAdapter {
    connector: Arc<dyn JobQueueConnector>,
    max_attempts: i32,
    // Held across `connect`, so a close waits out an init in flight.
    state: Mutex<QueueState>,
    closed: OnceCell<Result<(), Arc<str>>>,
}

impl QueueAdapter {
    pub fn new(connector: Arc<dyn JobQueueConnector>, max_attempts: i32) -> Self {
        Self {
            connector,
            max_attempts,
            state: Mutex::new(QueueState::Idle),
            closed: OnceCell::new(),
        }
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    /// The shared queue handle, connecting on first call. A failed connect
    /// leaves the adapter idle so the next call retries.
    pub async fn queue(&self) -> Result<Arc<dyn JobQueue>, QueueError> {
        let mut state = self.state.lock().await;
        match &*state {
            QueueState::Ready(queue) => Ok(queue.clone()),
            QueueState::Closed => Err(QueueError::Closed),
            QueueState::Idle => {
                let queue = self.connector.connect().await?;
                info!("Job queue connected");
                *state = QueueState::Ready(queue.clone());
                Ok(queue)
            }
        }
    }

    /// Submit the run's job. Repeated calls for one run collapse into one job.
    pub async fn enqueue(&self, run_id: Uuid) -> Result<EnqueueOutcome, QueueError> {
        let queue = self.queue().await?;
        queue.add_job(self.new_job(run_id)).await
    }

    /// Hand a recovered run back to the queue. A job still locked by the
    /// run's previous, dead holder is replaced rather than collapsed onto.
    pub async fn requeue(&self, run_id: Uuid) -> Result<EnqueueOutcome, QueueError> {
        let queue = self.queue().await?;
        queue.replace_job(self.new_job(run_id)).await
    }

    fn new_job(&self, run_id: Uuid) -> NewJob {
        NewJob {
            job_key: job_key(run_id),
            task: INVESTIGATE_TASK.to_string(),
            payload: serde_json::json!({ "runId": run_id }),
            max_attempts: self.max_attempts,
        }
    }

    /// Release the connection. Concurrent and repeated calls share the
    /// outcome of the first.
    pub async fn close(&self) -> Result<(), QueueError> {
        let outcome = self
            .closed
            .get_or_init(|| async {
                let mut state = self.state.lock().await;
                match std::mem::replace(&mut *state, QueueState::Closed) {
                    QueueState::Ready(queue) => {
                        info!("Shutting down job queue");
                        queue
                            .shutdown()
                            .await
                            .map_err(|e| Arc::<str>::from(e.to_string()))
                    }
                    QueueState::Idle | QueueState::Closed => Ok(()),
                }
            })
            .await;

        outcome.clone().map_err(QueueError::Shutdown)
    }
}
