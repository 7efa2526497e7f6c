use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, ProtocolVersion, RootCertStore, crypto};
use tracing::debug;

use super::Check;
use super::result::{CheckResult, ResultDetail, TlsDetail};
use super::types::{CheckId, CheckKind, OwnerId};

/// Build the connector shared by all TLS checks, trusting the Mozilla root set
pub fn default_connector() -> Result<TlsConnector> {
    let roots = RootCertStore { roots: webpki_roots::TLS_SERVER_ROOTS.to_vec() };
    let config = ClientConfig::builder_with_provider(Arc::new(crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// TLS handshake and certificate probe
#[derive(Clone)]
pub struct TlsCheck {
    id: CheckId,
    owner: OwnerId,
    host: String,
    port: u16,
    connector: TlsConnector,
    timeout: Duration,
}

impl std::fmt::Debug for TlsCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsCheck")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TlsCheck {
    pub fn new(
        id: CheckId,
        owner: OwnerId,
        host: String,
        port: u16,
        connector: TlsConnector,
        timeout: Duration,
    ) -> Self {
        Self { id, owner, host, port, connector, timeout }
    }

    /// Dial, handshake and collect the negotiated session parameters
    async fn handshake(&self) -> Result<TlsDetail> {
        let server_name = ServerName::try_from(self.host.as_str())
            .map_err(|e| anyhow!("invalid server name {}: {}", self.host, e))?
            .to_owned();

        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| anyhow!("TCP connection failed: {}", e))?;

        let tls = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|e| anyhow!("TLS handshake failed: {}", e))?;

        let (_, session) = tls.get_ref();

        Ok(TlsDetail {
            tls_version: session.protocol_version().map(version_name),
            cipher_suite: session.negotiated_cipher_suite().map(|suite| format!("{:?}", suite.suite())),
            expiry: session.peer_certificates().and_then(earliest_expiry),
            error: None,
        })
    }
}

#[async_trait]
impl Check for TlsCheck {
    fn id(&self) -> CheckId {
        self.id
    }

    fn owner(&self) -> OwnerId {
        self.owner
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Tls
    }

    async fn execute(&self, now: DateTime<Utc>) -> CheckResult {
        let start = Instant::now();
        let outcome = timeout(self.timeout, self.handshake()).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (success, detail) = match outcome {
            Ok(Ok(detail)) => (true, detail),
            Ok(Err(e)) => {
                debug!("TLS check {} against {}:{} failed: {}", self.id, self.host, self.port, e);
                (false, TlsDetail { error: Some(e.to_string()), ..TlsDetail::default() })
            }
            Err(_) => (
                false,
                TlsDetail {
                    error: Some(format!("TLS handshake timeout after {}s", self.timeout.as_secs())),
                    ..TlsDetail::default()
                },
            ),
        };

        CheckResult {
            check_id: self.id,
            owner: self.owner,
            timestamp: now,
            success,
            duration_ms,
            detail: ResultDetail::Tls(detail),
        }
    }
}

fn version_name(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::SSLv3 => "SSL 3.0".to_string(),
        ProtocolVersion::TLSv1_0 => "TLS 1.0".to_string(),
        ProtocolVersion::TLSv1_1 => "TLS 1.1".to_string(),
        ProtocolVersion::TLSv1_2 => "TLS 1.2".to_string(),
        ProtocolVersion::TLSv1_3 => "TLS 1.3".to_string(),
        other => format!("{other:?}"),
    }
}

/// Earliest `notAfter` over the presented chain, unparsable certificates are skipped
fn earliest_expiry(chain: &[CertificateDer<'static>]) -> Option<DateTime<Utc>> {
    chain
        .iter()
        .filter_map(|der| x509_parser::parse_x509_certificate(der.as_ref()).ok())
        .map(|(_, cert)| cert.validity().not_after.timestamp())
        .min()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}
