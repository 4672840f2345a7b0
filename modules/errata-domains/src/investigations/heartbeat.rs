use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use super::lease::RunLeaseManager;

/// Stop handle for a running heartbeat. Dropping it aborts the task, so a
/// forgotten handle never keeps the lease alive.
pub struct HeartbeatHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    /// Signal the loop and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl RunLeaseManager {
    /// Extend the lease every `interval` on a detached task. Failed or
    /// rejected extensions are logged and retried on the next tick.
    pub fn start_heartbeat(&self, run_id: Uuid, worker: &str, interval: Duration) -> HeartbeatHandle {
        let leases = self.clone();
        let worker = worker.to_string();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            // The claim just set a fresh lease, so the first beat waits a full period.
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }

                match leases.extend(run_id, &worker).await {
                    Ok(true) => debug!(run_id = %run_id, worker = %worker, "Heartbeat extended lease"),
                    Ok(false) => warn!(
                        run_id = %run_id,
                        worker = %worker,
                        "Heartbeat rejected: lease no longer held by this worker"
                    ),
                    Err(e) => warn!(run_id = %run_id, worker = %worker, error = %e, "Heartbeat failed"),
                }
            }
        });

        HeartbeatHandle {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }
}
