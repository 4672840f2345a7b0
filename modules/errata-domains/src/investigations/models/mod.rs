pub mod claim;
pub mod investigation;
pub mod investigation_run;
