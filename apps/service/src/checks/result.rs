use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::{CheckId, CheckKind, OwnerId};

/// HTTP specific diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpDetail {
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

/// TLS specific diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsDetail {
    pub tls_version: Option<String>,
    pub cipher_suite: Option<String>,
    /// Earliest `notAfter` of the presented certificate chain
    pub expiry: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResultDetail {
    Http(HttpDetail),
    Tls(TlsDetail),
}

impl ResultDetail {
    pub fn kind(&self) -> CheckKind {
        match self {
            ResultDetail::Http(_) => CheckKind::Http,
            ResultDetail::Tls(_) => CheckKind::Tls,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ResultDetail::Http(detail) => detail.error.as_deref(),
            ResultDetail::Tls(detail) => detail.error.as_deref(),
        }
    }
}

/// Result of one check execution. Append-only once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check that produced this result
    pub check_id: CheckId,

    /// Owner of that check
    pub owner: OwnerId,

    /// Tick time the execution was started for
    pub timestamp: DateTime<Utc>,

    pub success: bool,

    /// Wall time spent in the probe
    pub duration_ms: u64,

    pub detail: ResultDetail,
}

impl CheckResult {
    pub fn kind(&self) -> CheckKind {
        self.detail.kind()
    }

    /// One line description of the outcome, used as alert text
    pub fn diagnostic(&self) -> String {
        let outcome = if self.success { "succeeded" } else { "failed" };
        match &self.detail {
            ResultDetail::Http(detail) => match (&detail.error, detail.status_code) {
                (Some(error), _) => format!("HTTP check {outcome}: {error}"),
                (None, Some(code)) => {
                    format!("HTTP check {outcome} with status code {code} after {}ms", self.duration_ms)
                }
                (None, None) => format!("HTTP check {outcome}"),
            },
            ResultDetail::Tls(detail) => match &detail.error {
                Some(error) => format!("TLS check {outcome}: {error}"),
                None => format!(
                    "TLS check {outcome} ({}, {}) after {}ms",
                    detail.tls_version.as_deref().unwrap_or("unknown version"),
                    detail.cipher_suite.as_deref().unwrap_or("unknown cipher"),
                    self.duration_ms
                ),
            },
        }
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {}", self.timestamp.to_rfc3339(), self.check_id, self.diagnostic())
    }
}

/// Outcome of one execution as seen by the alert evaluator
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub check_id: CheckId,
    pub kind: CheckKind,
    pub owner: OwnerId,
    pub success: bool,
    pub at: DateTime<Utc>,
    pub diagnostic: String,
}

impl From<&CheckResult> for Outcome {
    fn from(result: &CheckResult) -> Self {
        Self {
            check_id: result.check_id,
            kind: result.kind(),
            owner: result.owner,
            success: result.success,
            at: result.timestamp,
            diagnostic: result.diagnostic(),
        }
    }
}
