use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Instant;
use tracing::debug;

use super::Check;
use super::result::{CheckResult, HttpDetail, ResultDetail};
use super::types::{CheckId, CheckKind, OwnerId};

/// HTTP reachability probe
///
/// Succeeds when the target answers a GET with a 2xx status code.
#[derive(Debug, Clone)]
pub struct HttpCheck {
    id: CheckId,
    owner: OwnerId,
    url: String,
    client: reqwest::Client,
}

impl HttpCheck {
    /// `client` is shared between checks and carries the probe timeout
    pub fn new(id: CheckId, owner: OwnerId, url: String, client: reqwest::Client) -> Self {
        Self { id, owner, url, client }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Check for HttpCheck {
    fn id(&self) -> CheckId {
        self.id
    }

    fn owner(&self) -> OwnerId {
        self.owner
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Http
    }

    async fn execute(&self, now: DateTime<Utc>) -> CheckResult {
        let start = Instant::now();
        let response = self.client.get(&self.url).send().await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (success, detail) = match response {
            Ok(response) => {
                let status = response.status();
                (status.is_success(), HttpDetail { status_code: Some(status.as_u16()), error: None })
            }
            Err(e) => {
                debug!("HTTP check {} against {} failed: {}", self.id, self.url, e);
                (false, HttpDetail { status_code: None, error: Some(format!("HTTP request failed: {e}")) })
            }
        };

        CheckResult {
            check_id: self.id,
            owner: self.owner,
            timestamp: now,
            success,
            duration_ms,
            detail: ResultDetail::Http(detail),
        }
    }
}
