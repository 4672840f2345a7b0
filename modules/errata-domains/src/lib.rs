pub mod credentials;
pub mod errors;
pub mod findings;
pub mod investigations;
pub mod prompts;
pub mod queue;
pub mod worker;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use errors::{classify, Classification, Disposition, ErrorKind, InvestigationError, StageError};
pub use investigations::{
    is_recoverable_processing_run_state, ClaimOutcome, HeartbeatHandle, Investigation,
    InvestigationRun, InvestigationStatus, RecoveryReport, RunLeaseManager, RunStore,
};
pub use prompts::{PromptCache, PromptCacheError};
pub use queue::{JobQueue, QueueAdapter, QueueError};
pub use worker::{InvestigationWorker, JobOutcome};
