//! Construction of runnable checks from their persisted definition.
//!
//! The registry is an explicit object handed to the scheduler, so tests can
//! register their own factories without touching process wide state.

use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsConnector;

use super::validation::validate_check_config;
use super::types::{CheckConfig, CheckKind, CheckSpec};
use super::{Check, HttpCheck, TlsCheck, tls};

/// Builds checks of one kind
pub trait CheckFactory: Send + Sync {
    fn kind(&self) -> CheckKind;

    /// Validate a user supplied configuration without building a check
    fn validate(&self, config: &CheckConfig) -> Result<()> {
        if config.kind() != self.kind() {
            return Err(anyhow!("{} factory cannot handle {} checks", self.kind(), config.kind()));
        }
        validate_check_config(config)
    }

    fn build(&self, spec: &CheckSpec) -> Result<Arc<dyn Check>>;
}

/// Builds HTTP checks sharing one client
pub struct HttpCheckFactory {
    client: reqwest::Client,
}

impl HttpCheckFactory {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vigil/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }
}

impl CheckFactory for HttpCheckFactory {
    fn kind(&self) -> CheckKind {
        CheckKind::Http
    }

    fn build(&self, spec: &CheckSpec) -> Result<Arc<dyn Check>> {
        self.validate(&spec.config)?;
        match &spec.config {
            CheckConfig::Http { url } => {
                Ok(Arc::new(HttpCheck::new(spec.id, spec.owner, url.clone(), self.client.clone())))
            }
            other => Err(anyhow!("not an HTTP configuration: {:?}", other)),
        }
    }
}

/// Builds TLS checks sharing one connector
pub struct TlsCheckFactory {
    connector: TlsConnector,
    timeout: Duration,
}

impl TlsCheckFactory {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self { connector: tls::default_connector()?, timeout })
    }
}

impl CheckFactory for TlsCheckFactory {
    fn kind(&self) -> CheckKind {
        CheckKind::Tls
    }

    fn build(&self, spec: &CheckSpec) -> Result<Arc<dyn Check>> {
        self.validate(&spec.config)?;
        match &spec.config {
            CheckConfig::Tls { host, port } => Ok(Arc::new(TlsCheck::new(
                spec.id,
                spec.owner,
                host.clone(),
                *port,
                self.connector.clone(),
                self.timeout,
            ))),
            other => Err(anyhow!("not a TLS configuration: {:?}", other)),
        }
    }
}

/// Maps a check kind to the factory building it
#[derive(Default, Clone)]
pub struct CheckFactoryRegistry {
    factories: HashMap<CheckKind, Arc<dyn CheckFactory>>,
}

impl CheckFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the HTTP and TLS factories, probes bounded by `probe_timeout`
    pub fn with_defaults(probe_timeout: Duration) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(HttpCheckFactory::new(probe_timeout)?));
        registry.register(Arc::new(TlsCheckFactory::new(probe_timeout)?));
        Ok(registry)
    }

    /// Register a factory, replacing any previous one for the same kind
    pub fn register(&mut self, factory: Arc<dyn CheckFactory>) {
        self.factories.insert(factory.kind(), factory);
    }

    pub fn get(&self, kind: CheckKind) -> Option<&Arc<dyn CheckFactory>> {
        self.factories.get(&kind)
    }

    pub fn validate(&self, config: &CheckConfig) -> Result<()> {
        self.get(config.kind())
            .ok_or_else(|| anyhow!("no factory registered for {} checks", config.kind()))?
            .validate(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::types::OwnerId;

    fn registry() -> CheckFactoryRegistry {
        CheckFactoryRegistry::with_defaults(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_default_registry_builds_both_kinds() {
        let registry = registry();
        let owner = OwnerId::new();

        let http = CheckSpec::new(owner, CheckConfig::Http { url: "https://example.com".into() });
        let tls = CheckSpec::new(owner, CheckConfig::Tls { host: "example.com".into(), port: 443 });

        let built = registry.get(CheckKind::Http).unwrap().build(&http).unwrap();
        assert_eq!(built.id(), http.id);
        assert_eq!(built.kind(), CheckKind::Http);

        let built = registry.get(CheckKind::Tls).unwrap().build(&tls).unwrap();
        assert_eq!(built.owner(), owner);
        assert_eq!(built.kind(), CheckKind::Tls);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let registry = registry();
        let spec = CheckSpec::new(OwnerId::new(), CheckConfig::Http { url: "ftp://example.com".into() });

        assert!(registry.get(CheckKind::Http).unwrap().build(&spec).is_err());
        assert!(registry.validate(&spec.config).is_err());
    }

    #[test]
    fn test_factory_rejects_foreign_kind() {
        let registry = registry();
        let spec = CheckSpec::new(OwnerId::new(), CheckConfig::Tls { host: "example.com".into(), port: 443 });

        assert!(registry.get(CheckKind::Http).unwrap().build(&spec).is_err());
    }

    #[test]
    fn test_empty_registry_has_no_factories() {
        let registry = CheckFactoryRegistry::new();
        assert!(registry.get(CheckKind::Http).is_none());
        assert!(registry.validate(&CheckConfig::Http { url: "https://example.com".into() }).is_err());
    }
}
