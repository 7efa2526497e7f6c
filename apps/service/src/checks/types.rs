use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable identity of a check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckId(pub Uuid);

/// Identity of the user owning a check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub Uuid);

macro_rules! uuid_newtype {
    ($name:ident) => {
        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_newtype!(CheckId);
uuid_newtype!(OwnerId);

/// Type of probe a check performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Http,
    Tls,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Http => "http",
            CheckKind::Tls => "tls",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(CheckKind::Http),
            "tls" => Ok(CheckKind::Tls),
            other => Err(anyhow::anyhow!("Unsupported check type: {}", other)),
        }
    }
}

/// Type-specific, user mutable part of a check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CheckConfig {
    Http { url: String },
    Tls { host: String, port: u16 },
}

impl CheckConfig {
    pub fn kind(&self) -> CheckKind {
        match self {
            CheckConfig::Http { .. } => CheckKind::Http,
            CheckConfig::Tls { .. } => CheckKind::Tls,
        }
    }

    /// Short human readable target, used in logs and mails
    pub fn target(&self) -> String {
        match self {
            CheckConfig::Http { url } => url.clone(),
            CheckConfig::Tls { host, port } => format!("{host}:{port}"),
        }
    }
}

/// Persisted definition of a check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSpec {
    pub id: CheckId,
    pub owner: OwnerId,
    pub config: CheckConfig,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckSpec {
    /// Create a new, enabled check with a fresh identity
    pub fn new(owner: OwnerId, config: CheckConfig) -> Self {
        let now = Utc::now();
        Self { id: CheckId::new(), owner, config, enabled: true, created_at: now, updated_at: now }
    }

    pub fn kind(&self) -> CheckKind {
        self.config.kind()
    }

    /// Same identity and owner, new configuration
    pub fn with_config(mut self, config: CheckConfig) -> Self {
        self.config = config;
        self.updated_at = Utc::now();
        self
    }
}
