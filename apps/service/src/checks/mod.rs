/// Checks module - the probes the engine schedules
///
/// This module is responsible for:
/// - The `Check` contract every probe fulfils
/// - HTTP reachability and TLS handshake probes
/// - Building checks from their persisted definition
pub mod factory;
pub mod http;
pub mod result;
pub mod tls;
pub mod types;
pub mod validation;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

pub use factory::{CheckFactory, CheckFactoryRegistry, HttpCheckFactory, TlsCheckFactory};
pub use http::HttpCheck;
pub use result::{CheckResult, HttpDetail, Outcome, ResultDetail, TlsDetail};
pub use tls::TlsCheck;
pub use types::{CheckConfig, CheckId, CheckKind, CheckSpec, OwnerId};

/// A periodically executed probe
///
/// Implementations bound their own execution time and report probe failures
/// as a failed `CheckResult`, never as an error or a panic.
#[async_trait]
pub trait Check: Send + Sync + fmt::Debug {
    fn id(&self) -> CheckId;

    fn owner(&self) -> OwnerId;

    fn kind(&self) -> CheckKind;

    /// Execute the probe for the tick at `now`
    async fn execute(&self, now: DateTime<Utc>) -> CheckResult;
}
