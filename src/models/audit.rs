use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeletionReason {
    Delivered,
    Manual,
    Expired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeletionResult {
    Success,
    Failure,
}

/// One row of the append-only deletion ledger. One record per deletion attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeletionAuditRecord {
    pub id: Uuid,
    pub object_key: String,
    pub reason: DeletionReason,
    pub result: DeletionResult,
    pub created_at: DateTime<Utc>,
}

impl DeletionAuditRecord {
    pub fn new(object_key: &str, reason: DeletionReason, result: DeletionResult) -> Self {
        Self {
            id: Uuid::new_v4(),
            object_key: object_key.to_string(),
            reason,
            result,
            created_at: Utc::now(),
        }
    }
}
