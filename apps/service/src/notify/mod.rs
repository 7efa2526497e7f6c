/// Outbound notifications
///
/// The alert evaluator's only side effect: telling an owner that one of
/// their checks keeps failing.

pub mod email;

pub use email::EmailNotifier;

use async_trait::async_trait;
use tracing::warn;

use crate::checks::OwnerId;

/// Errors that can occur while delivering a notification
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Unknown owner {0}")]
    UnknownOwner(OwnerId),

    #[error("Owner lookup failed: {0}")]
    Lookup(String),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("SMTP delivery failed: {0}")]
    Smtp(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Delivery channel for failure notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Notify the owner of a failing check
    async fn send_failure(&self, owner: OwnerId, subject: &str, text: &str) -> Result<(), NotifyError>;
}

/// Notifier that only writes the alert to the log, used when mail is disabled
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_failure(&self, owner: OwnerId, subject: &str, text: &str) -> Result<(), NotifyError> {
        warn!("{} (owner {}): {}", subject, owner, text);
        Ok(())
    }
}
