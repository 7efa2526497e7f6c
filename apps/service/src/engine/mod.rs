/// Engine module - scheduling, persistence and alerting of checks
///
/// The engine is the core coordinator that:
/// - Runs one runner task per scheduled check
/// - Commits results in batches through the writer task
/// - Feeds outcomes to the alert evaluator task
/// - Stops everything in order on shutdown, so the last batch is committed

pub mod alert;
pub mod runner;
pub mod scheduler;
pub mod writer;

#[cfg(test)]
pub(crate) mod tests;

pub use alert::{AlertDecision, AlertEvaluator, AlertPolicy};
pub use runner::{Runner, RunnerState, Sinks};
pub use scheduler::{Scheduler, SchedulerError, SchedulerSettings};
pub use writer::{BatchWriter, ResultSubmitter, WriterSettings, WriterStats};

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::checks::CheckFactoryRegistry;
use crate::database::{AlertStore, CheckStore, ResultStore};
use crate::notify::Notifier;

/// Everything the engine needs to know up front
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub scheduler: SchedulerSettings,
    pub writer: WriterSettings,
    pub alert_policy: AlertPolicy,
}

/// Handle of a running engine
pub struct Engine {
    scheduler: Arc<Scheduler>,
    writer_stats: Arc<WriterStats>,
    writer: JoinHandle<()>,
    evaluator: JoinHandle<()>,
}

impl Engine {
    /// Spawn the writer and the evaluator, then schedule every enabled check from storage
    pub async fn start<D>(
        settings: EngineSettings,
        db: Arc<D>,
        notifier: Arc<dyn Notifier>,
        factories: Arc<CheckFactoryRegistry>,
    ) -> Result<Self>
    where
        D: CheckStore + ResultStore + AlertStore + 'static,
    {
        let capacity = settings.writer.queue_capacity;

        let (writer, submitter) = BatchWriter::new(db.clone(), settings.writer);
        let writer_stats = writer.stats();
        let writer = tokio::spawn(writer.run());

        let (evaluator, outcomes) = AlertEvaluator::new(db.clone(), notifier, settings.alert_policy, capacity);
        let evaluator = tokio::spawn(evaluator.run());

        let sinks = Sinks { results: submitter.sender(), outcomes };
        let scheduler = Arc::new(Scheduler::new(factories, settings.scheduler, sinks));

        let engine = Self { scheduler, writer_stats, writer, evaluator };

        if let Err(e) = engine.scheduler.load(db.as_ref()).await {
            error!("Failed to load checks, shutting the engine down: {:#}", e);
            engine.shutdown().await?;
            return Err(e.context("unable to load checks from storage"));
        }

        info!("Engine started with {} checks", engine.scheduler.len().await);
        Ok(engine)
    }

    /// Registry used to add, update and remove checks at runtime
    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn writer_stats(&self) -> Arc<WriterStats> {
        Arc::clone(&self.writer_stats)
    }

    /// Stop every runner, then wait for the writer and the evaluator to drain
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down engine");
        self.scheduler.close().await;

        self.writer.await.context("result writer failed")?;
        self.evaluator.await.context("alert evaluator failed")?;

        info!(
            "Engine stopped ({} results committed, {} lost)",
            self.writer_stats.committed(),
            self.writer_stats.dropped()
        );
        Ok(())
    }
}
