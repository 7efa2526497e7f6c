use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checks::{CheckId, CheckKind, OwnerId};

/// Owner model - the recipient of a check's alerts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Owner {
    pub id: OwnerId,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl Owner {
    pub fn new(email: String) -> Self {
        Self { id: OwnerId::new(), email, created_at: Utc::now() }
    }
}

/// AlertState model - failure episode and notification bookkeeping of one check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertState {
    pub check_id: CheckId,
    pub kind: CheckKind,
    pub owner: OwnerId,
    /// Time of the first failure of the current episode, `None` while healthy
    pub failed_since: Option<DateTime<Utc>>,
    /// Time the last notification was sent successfully
    pub last_notified: Option<DateTime<Utc>>,
    /// Failures observed since the last success
    pub consecutive_failures: u32,
}

impl AlertState {
    /// Fresh state for a check that has not been observed yet
    pub fn new(check_id: CheckId, kind: CheckKind, owner: OwnerId) -> Self {
        Self { check_id, kind, owner, failed_since: None, last_notified: None, consecutive_failures: 0 }
    }
}

/// Convert a timestamp to Unix milliseconds for storage
pub fn timestamp_to_i64(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

/// Convert stored Unix milliseconds back to a timestamp
pub fn i64_to_timestamp(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH)
}
