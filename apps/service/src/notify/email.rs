//! SMTP notifier via `lettre`.
//!
//! The recipient of each alert is the owner's address from the owner
//! directory in storage.

use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor, message::Mailbox,
    transport::smtp::authentication::Credentials,
};
use std::fmt;
use std::sync::Arc;
use tracing::info;

use super::{Notifier, NotifyError};
use crate::checks::OwnerId;
use crate::database::CheckStore;

/// Port on which SMTP servers expect implicit TLS
const IMPLICIT_TLS_PORT: u16 = 465;

/// Sends failure notifications as emails via SMTP
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    owners: Arc<dyn CheckStore>,
}

impl fmt::Debug for EmailNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailNotifier").field("from", &self.from).finish_non_exhaustive()
    }
}

impl EmailNotifier {
    /// Build an `EmailNotifier` from the mail settings.
    ///
    /// Port 465 always uses implicit TLS; other ports use STARTTLS when
    /// `starttls` is set and a plain connection otherwise. SMTP credentials
    /// are taken from `SMTP_USERNAME` and `SMTP_PASSWORD` when both are set.
    pub fn from_config(
        smtp_host: &str,
        smtp_port: u16,
        starttls: bool,
        from: &str,
        owners: Arc<dyn CheckStore>,
    ) -> Result<Self, NotifyError> {
        let from: Mailbox = from.parse().map_err(|e: lettre::address::AddressError| {
            NotifyError::Config(format!("invalid sender address {}: {}", from, e))
        })?;

        let mut builder = if smtp_port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(smtp_host)
                .map_err(|e| NotifyError::Config(e.to_string()))?
                .port(smtp_port)
        } else if starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(smtp_host)
                .map_err(|e| NotifyError::Config(e.to_string()))?
                .port(smtp_port)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(smtp_host).port(smtp_port)
        };

        if let (Ok(username), Ok(password)) =
            (std::env::var("SMTP_USERNAME"), std::env::var("SMTP_PASSWORD"))
        {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self { transport: builder.build(), from, owners })
    }

    /// Resolve the mailbox of an owner
    async fn recipient(&self, owner: OwnerId) -> Result<Mailbox, NotifyError> {
        let owner = self
            .owners
            .get_owner(owner)
            .await
            .map_err(|e| NotifyError::Lookup(e.to_string()))?
            .ok_or(NotifyError::UnknownOwner(owner))?;

        owner
            .email
            .parse()
            .map_err(|e: lettre::address::AddressError| NotifyError::Address(format!("{}: {}", owner.email, e)))
    }

    /// Assemble the message without sending it
    fn message(&self, to: Mailbox, subject: &str, text: &str) -> Result<Message, NotifyError> {
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .body(text.to_string())
            .map_err(|e| NotifyError::Smtp(e.to_string()))
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn send_failure(&self, owner: OwnerId, subject: &str, text: &str) -> Result<(), NotifyError> {
        let to = self.recipient(owner).await?;
        let email = self.message(to.clone(), subject, text)?;

        self.transport.send(email).await.map_err(|e| NotifyError::Smtp(e.to_string()))?;

        info!("Sent failure notification to {} (owner {})", to.email, owner);
        Ok(())
    }
}
