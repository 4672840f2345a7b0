pub mod orchestrator;
pub mod schema;
pub mod tools;
pub mod validator;

pub use orchestrator::{InvestigationInput, InvestigationOrchestrator, SessionOutcome};
pub use schema::{ClaimList, ClaimValidationVerdict};
pub use validator::{ClaimValidationResult, ClaimValidator};
