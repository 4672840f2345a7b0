use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::investigation::InvestigationStatus;

/// Execution context of one investigation. A non-null `lease_owner` always
/// comes with a non-null `lease_expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct InvestigationRun {
    pub id: Uuid,
    pub investigation_id: Uuid,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub recover_after_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub queued_at: DateTime<Utc>,
    /// Set when a per-run key is attached; stays set after the key is consumed.
    pub key_source_attached: bool,
}

impl InvestigationRun {
    pub fn new(investigation_id: Uuid, queued_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            investigation_id,
            lease_owner: None,
            lease_expires_at: None,
            recover_after_at: None,
            started_at: None,
            heartbeat_at: None,
            queued_at,
            key_source_attached: false,
        }
    }

    pub fn is_held_by(&self, worker: &str) -> bool {
        self.lease_owner.as_deref() == Some(worker)
    }
}

/// A run together with the status of its owning investigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub run: InvestigationRun,
    pub status: InvestigationStatus,
}
