pub mod heartbeat;
pub mod lease;
pub mod models;
pub mod recovery;
pub mod store;

pub use heartbeat::HeartbeatHandle;
pub use lease::{is_recoverable_processing_run_state, ClaimOutcome, RunLeaseManager};
pub use models::claim::{Claim, ClaimDraft, ClaimSource};
pub use models::investigation::{Investigation, InvestigationStatus};
pub use models::investigation_run::{InvestigationRun, RunState};
pub use recovery::RecoveryReport;
pub use store::{PgRunStore, RunContext, RunStore};
