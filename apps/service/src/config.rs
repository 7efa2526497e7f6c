use std::time::Duration;
use std::{env, fmt, fs, path};

use serde::{Deserialize, Serialize};

use crate::engine::{AlertPolicy, EngineSettings, SchedulerSettings, WriterSettings};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unable to read config file {0}: {1}")]
    ReadFailed(path::PathBuf, #[source] std::io::Error),

    #[error("Unable to write config file {0}: {1}")]
    WriteFailed(path::PathBuf, #[source] std::io::Error),

    #[error("Unable to parse config file {0}: {1}")]
    ParseFailed(path::PathBuf, #[source] toml::de::Error),

    #[error("Unable to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),

    #[error("No config path available, set XDG_CONFIG_HOME or HOME")]
    ConfigPathUnavailable,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: Database,
    pub engine: Engine,
    pub alert: Alert,
    pub mail: Mail,
    pub logging: Logging,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    pub path: path::PathBuf,
    pub max_connections: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Engine {
    pub poll_interval_secs: u64,
    pub batch_flush_interval_secs: u64,
    pub max_batch_size: usize,
    pub queue_capacity: usize,
    pub probe_timeout_secs: u64,
    pub start_jitter: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    #[default]
    Sustained,
    Consecutive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Alert {
    pub policy: PolicyKind,
    pub sustained_failure_threshold_secs: u64,
    pub notification_cooldown_secs: u64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mail {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub starttls: bool,
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub format: String,
}

impl Default for Database {
    fn default() -> Self {
        Self { path: path::PathBuf::from("vigil.db"), max_connections: 8 }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            batch_flush_interval_secs: 5,
            max_batch_size: 500,
            queue_capacity: 1024,
            probe_timeout_secs: 10,
            start_jitter: true,
        }
    }
}

impl Default for Alert {
    fn default() -> Self {
        Self {
            policy: PolicyKind::Sustained,
            sustained_failure_threshold_secs: 60,
            notification_cooldown_secs: 300,
            consecutive_failures: 3,
        }
    }
}

impl Default for Mail {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: "localhost".into(),
            smtp_port: 587,
            starttls: true,
            from: "Vigil <vigil@localhost>".into(),
        }
    }
}

impl Default for Logging {
    fn default() -> Self {
        Self { level: "info".into(), format: "compact".into() }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::Sustained => f.write_str("sustained"),
            PolicyKind::Consecutive => f.write_str("consecutive"),
        }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/vigil/config.toml or
/// $HOME/.config/...)
pub fn default_config_path() -> Result<path::PathBuf, Error> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(Error::ConfigPathUnavailable);
    };

    Ok(path.join("vigil/config.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_1 = |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
            writeln!(f, "    {}: {}", label, value)
        };
        let write_title_1 = |f: &mut fmt::Formatter<'_>, label: &str| writeln!(f, "  {}", label);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Database")?;
        write_1(f, "Path", &self.database.path.display())?;
        write_1(f, "Max Connections", &self.database.max_connections)?;

        write_title_1(f, "Engine")?;
        write_1(f, "Poll Interval (s)", &self.engine.poll_interval_secs)?;
        write_1(f, "Batch Flush Interval (s)", &self.engine.batch_flush_interval_secs)?;
        write_1(f, "Max Batch Size", &self.engine.max_batch_size)?;
        write_1(f, "Queue Capacity", &self.engine.queue_capacity)?;
        write_1(f, "Probe Timeout (s)", &self.engine.probe_timeout_secs)?;
        write_1(f, "Start Jitter", &self.engine.start_jitter)?;

        write_title_1(f, "Alert")?;
        write_1(f, "Policy", &self.alert.policy)?;
        match self.alert.policy {
            PolicyKind::Sustained => {
                write_1(f, "Sustained Failure Threshold (s)", &self.alert.sustained_failure_threshold_secs)?
            }
            PolicyKind::Consecutive => write_1(f, "Consecutive Failures", &self.alert.consecutive_failures)?,
        }
        write_1(f, "Notification Cooldown (s)", &self.alert.notification_cooldown_secs)?;

        write_title_1(f, "Mail")?;
        write_1(f, "Enabled", &self.mail.enabled)?;
        if self.mail.enabled {
            write_1(f, "SMTP Server", &format!("{}:{}", self.mail.smtp_host, self.mail.smtp_port))?;
            write_1(f, "STARTTLS", &self.mail.starttls)?;
            write_1(f, "From", &self.mail.from)?;
        }

        write_title_1(f, "Logging")?;
        write_1(f, "Level", &self.logging.level)?;
        write_1(f, "Format", &self.logging.format)?;

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/vigil/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    ///
    /// ```no_run
    /// let cfg = vigil::config::Config::from_config(None::<&std::path::Path>)?;
    /// println!("{}", cfg);
    /// # Ok::<(), vigil::config::Error>(())
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, Error> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|err| Error::ReadFailed(config_path.clone(), err))?;
            toml::from_str(raw_string.as_str()).map_err(|err| Error::ParseFailed(config_path, err))
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), Error> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| Error::WriteFailed(parent.to_path_buf(), err))?;
        }

        fs::write(path, config_str).map_err(|err| Error::WriteFailed(path.to_path_buf(), err))
    }

    /// Policy deciding when a failing check notifies its owner
    pub fn alert_policy(&self) -> AlertPolicy {
        let cooldown = Duration::from_secs(self.alert.notification_cooldown_secs);
        match self.alert.policy {
            PolicyKind::Sustained => AlertPolicy::Sustained {
                threshold: Duration::from_secs(self.alert.sustained_failure_threshold_secs),
                cooldown,
            },
            PolicyKind::Consecutive => {
                AlertPolicy::Consecutive { failures: self.alert.consecutive_failures.max(1), cooldown }
            }
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.probe_timeout_secs.max(1))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            scheduler: SchedulerSettings {
                poll_interval: Duration::from_secs(self.engine.poll_interval_secs.max(1)),
                start_jitter: self.engine.start_jitter,
            },
            writer: WriterSettings {
                flush_interval: Duration::from_secs(self.engine.batch_flush_interval_secs.max(1)),
                max_batch_size: self.engine.max_batch_size.max(1),
                queue_capacity: self.engine.queue_capacity.max(1),
            },
            alert_policy: self.alert_policy(),
        }
    }
}
