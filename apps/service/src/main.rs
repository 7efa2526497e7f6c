use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use logger::LogFormat;
use tokio::signal;
use tracing::{info, level_filters::LevelFilter, warn};

use vigil::checks::{CheckConfig, CheckFactoryRegistry, CheckId, OwnerId};
use vigil::config::Config;
use vigil::database::{CheckStore, DatabaseImpl, Owner, ResultStore, initialize_database};
use vigil::engine::Engine;
use vigil::notify::{EmailNotifier, LogNotifier, Notifier};
use vigil::pool::open_pool;

/// Vigil check service: runs HTTP and TLS checks and alerts their owners.
#[derive(Parser, Debug)]
#[command(name = "vigil-service", version, about)]
struct Cli {
    /// Path to the config file (created with defaults when missing).
    #[arg(long, short, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// Override the database file from the config.
    #[arg(long, env = "VIGIL_DATABASE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine until Ctrl+C or SIGTERM (default)
    Run,
    /// Print the effective configuration
    ShowConfig,
    /// Register an owner that checks can notify
    AddOwner {
        #[arg(long)]
        email: String,
    },
    /// Register a check; picked up by the engine on its next start
    AddCheck {
        #[arg(long)]
        owner: OwnerId,
        /// URL of an HTTP check
        #[arg(long, conflicts_with_all = ["host", "port"])]
        url: Option<String>,
        /// Host of a TLS check
        #[arg(long, requires = "port")]
        host: Option<String>,
        /// Port of a TLS check
        #[arg(long)]
        port: Option<u16>,
    },
    /// List the checks of an owner
    ListChecks {
        #[arg(long)]
        owner: OwnerId,
    },
    /// Show the most recent results of a check
    Results {
        #[arg(long)]
        check: CheckId,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Print one JSON object per line
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Ignoring .env file: {e}");
        }
    }

    let cli = Cli::parse();
    let mut config = Config::from_config(cli.config.as_ref()).context("unable to load configuration")?;
    if let Some(database) = cli.database {
        config.database.path = database;
    }

    let level = LevelFilter::from_str(&config.logging.level).unwrap_or(LevelFilter::INFO);
    logger::init_with(level, config.logging.format.parse::<LogFormat>().ok());

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::ShowConfig => {
            print!("{}", config);
            Ok(())
        }
        Command::AddOwner { email } => {
            let db = open_database(&config).await?;
            let owner = Owner::new(email);
            db.create_owner(&owner).await?;
            println!("{}", owner.id);
            Ok(())
        }
        Command::AddCheck { owner, url, host, port } => {
            let check = match (url, host, port) {
                (Some(url), None, None) => CheckConfig::Http { url },
                (None, Some(host), Some(port)) => CheckConfig::Tls { host, port },
                _ => anyhow::bail!("pass either --url or --host with --port"),
            };
            add_check(&config, owner, check).await
        }
        Command::ListChecks { owner } => {
            let db = open_database(&config).await?;
            for check in db.list_checks_by_owner(owner).await? {
                let state = if check.enabled { "enabled" } else { "disabled" };
                println!("{}  {:<4}  {:<8}  {}", check.id, check.kind(), state, check.config.target());
            }
            Ok(())
        }
        Command::Results { check, limit, json } => {
            let db = open_database(&config).await?;
            for result in db.recent_results(check, limit).await? {
                if json {
                    println!("{}", serde_json::to_string(&result)?);
                } else {
                    println!("{}", result);
                }
            }
            Ok(())
        }
    }
}

async fn open_database(config: &Config) -> Result<Arc<DatabaseImpl>> {
    let pool = open_pool(&config.database.path, config.database.max_connections)
        .await
        .with_context(|| format!("unable to open database {}", config.database.path.display()))?;
    initialize_database(&*pool.get().await?).await?;
    Ok(Arc::new(DatabaseImpl::new_from_pool(pool)))
}

async fn add_check(config: &Config, owner: OwnerId, check: CheckConfig) -> Result<()> {
    let db = open_database(config).await?;
    if db.get_owner(owner).await?.is_none() {
        anyhow::bail!("no owner with id {}", owner);
    }

    let factories = CheckFactoryRegistry::with_defaults(config.probe_timeout())?;
    factories.validate(&check)?;

    let spec = vigil::checks::CheckSpec::new(owner, check);
    db.insert_check(&spec).await?;
    println!("{}", spec.id);
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    info!("Starting vigil-service v{}", env!("CARGO_PKG_VERSION"));

    let db = open_database(&config).await?;
    let factories = Arc::new(CheckFactoryRegistry::with_defaults(config.probe_timeout())?);

    let notifier: Arc<dyn Notifier> = if config.mail.enabled {
        Arc::new(EmailNotifier::from_config(
            &config.mail.smtp_host,
            config.mail.smtp_port,
            config.mail.starttls,
            &config.mail.from,
            db.clone(),
        )?)
    } else {
        warn!("Mail is disabled, failure notifications are only logged");
        Arc::new(LogNotifier)
    };

    let engine = Engine::start(config.engine_settings(), db, notifier, factories).await?;

    shutdown_signal().await?;

    engine.shutdown().await?;
    info!("vigil-service stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("unable to install SIGTERM handler")?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("unable to listen for Ctrl+C")?;
                info!("Received Ctrl+C");
            }
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("unable to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
