pub mod adapter;
pub mod job_queue;

pub use adapter::{job_key, JobQueueConnector, QueueAdapter, INVESTIGATE_TASK};
pub use job_queue::{
    EnqueueOutcome, FailResult, Job, JobQueue, NewJob, PgJobQueue, PgJobQueueConnector, QueueError,
    STALE_LOCK,
};
