//! Registry mapping each check to its single active runner.
//!
//! All map mutations go through one lock. Waiting for a runner to confirm
//! termination happens outside of it; during that window the runner keeps
//! its slot in the `Stopping` state so no second runner for the same check
//! can be started.

use anyhow::Result;
use futures::future::{join, join_all};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::runner::{Runner, RunnerState, Sinks};
use crate::checks::{Check, CheckConfig, CheckFactoryRegistry, CheckId, CheckKind, CheckSpec};
use crate::database::CheckStore;

/// Errors returned by registry operations
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("A runner for check {0} already exists")]
    DuplicateKey(CheckId),

    #[error("No runner registered for check {0}")]
    NotFound(CheckId),

    #[error("No factory registered for {0} checks")]
    UnsupportedKind(CheckKind),

    #[error("Invalid check {id}: {reason}")]
    InvalidCheck { id: CheckId, reason: String },

    #[error("Scheduler is closed")]
    Closed,
}

/// Timing applied to every runner
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub start_jitter: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(15), start_jitter: true }
    }
}

struct Entry {
    spec: CheckSpec,
    runner: Runner,
}

struct Inner {
    runners: HashMap<CheckId, Entry>,
    /// `None` once the scheduler is closed
    sinks: Option<Sinks>,
}

/// Registry of independently scheduled, cancellable check runners
pub struct Scheduler {
    inner: Mutex<Inner>,
    factories: Arc<CheckFactoryRegistry>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(factories: Arc<CheckFactoryRegistry>, settings: SchedulerSettings, sinks: Sinks) -> Self {
        Self {
            inner: Mutex::new(Inner { runners: HashMap::new(), sinks: Some(sinks) }),
            factories,
            settings,
        }
    }

    /// Build and start a runner for `spec`
    ///
    /// Returns once the runner's loop is launched. Fails with `DuplicateKey`
    /// when the check already has a runner, including one still stopping.
    pub async fn add(&self, spec: CheckSpec) -> Result<(), SchedulerError> {
        let check = self.build(&spec)?;
        self.install(spec, check).await
    }

    /// Stop the runner of a check and wait until it has terminated
    ///
    /// No result of that runner is emitted after this returns. The removed
    /// definition is handed back.
    pub async fn remove(&self, id: CheckId) -> Result<CheckSpec, SchedulerError> {
        let (spec, completion) = {
            let mut inner = self.inner.lock().await;
            let entry = inner
                .runners
                .get_mut(&id)
                .filter(|entry| !entry.runner.stop_requested())
                .ok_or(SchedulerError::NotFound(id))?;
            (entry.spec.clone(), entry.runner.stop())
        };

        if let Some(completion) = completion {
            completion.wait().await;
        }

        {
            // A concurrent stop_all may already have dropped the slot, and a new runner taken it
            let mut inner = self.inner.lock().await;
            if inner.runners.get(&id).is_some_and(|entry| entry.runner.stop_requested()) {
                inner.runners.remove(&id);
            }
        }
        info!("Removed runner for check {}", id);
        Ok(spec)
    }

    /// Replace the configuration of a scheduled check
    ///
    /// The new configuration is validated before the running check is
    /// touched; the old runner is stopped and awaited before the new one
    /// starts, so its next tick already uses the new configuration. The slot
    /// stays reserved meanwhile: a concurrent `add` of the same check fails
    /// with `DuplicateKey` and a concurrent `remove` with `NotFound`. A
    /// concurrent `close` cancels the update; a concurrent `stop_all` may.
    pub async fn update(&self, id: CheckId, config: CheckConfig) -> Result<CheckSpec, SchedulerError> {
        let (spec, check, completion) = {
            let mut inner = self.inner.lock().await;
            if inner.sinks.is_none() {
                return Err(SchedulerError::Closed);
            }

            let entry = inner
                .runners
                .get_mut(&id)
                .filter(|entry| !entry.runner.stop_requested())
                .ok_or(SchedulerError::NotFound(id))?;
            let spec = entry.spec.clone().with_config(config);
            let check = self.build(&spec)?;
            (spec, check, entry.runner.stop())
        };

        if let Some(completion) = completion {
            completion.wait().await;
        }

        let mut inner = self.inner.lock().await;
        match inner.runners.get(&id) {
            Some(entry) if entry.runner.stop_requested() => {}
            Some(_) => return Err(SchedulerError::DuplicateKey(id)),
            // Dropped by a concurrent stop_all
            None => return Err(SchedulerError::NotFound(id)),
        }

        let Some(sinks) = inner.sinks.clone() else {
            inner.runners.remove(&id);
            return Err(SchedulerError::Closed);
        };

        let mut runner = Runner::new(check, self.settings.poll_interval, self.settings.start_jitter);
        runner.start(sinks);
        inner.runners.insert(id, Entry { spec: spec.clone(), runner });

        info!("Updated check {} to {}", id, spec.config.target());
        Ok(spec)
    }

    /// Stop every runner and wait for all of them; returns how many were stopped
    ///
    /// Runners already stopping on behalf of a concurrent `remove` or
    /// `update` are waited for as well, so no runner emits after this returns.
    /// Runners installed after the call took its snapshot are left running.
    pub async fn stop_all(&self) -> usize {
        let (completions, stopping) = {
            let mut inner = self.inner.lock().await;
            let mut completions = Vec::new();
            let mut stopping = Vec::new();
            for entry in inner.runners.values_mut() {
                match entry.runner.stop() {
                    Some(completion) => completions.push(completion),
                    None => stopping.extend(entry.runner.terminated()),
                }
            }
            (completions, stopping)
        };

        let stopped = completions.len();
        join(
            join_all(completions.into_iter().map(|completion| completion.wait())),
            join_all(stopping.into_iter().map(|termination| termination.wait())),
        )
        .await;

        // Slots of runners restarted meanwhile are not ours to drop
        self.inner
            .lock()
            .await
            .runners
            .retain(|_, entry| {
                !(entry.runner.stop_requested() && entry.runner.state() == RunnerState::Stopped)
            });

        info!("Stopped {} check runners", stopped);
        stopped
    }

    /// Stop everything and release the streams so downstream consumers drain
    ///
    /// Later `add` calls fail with `Closed`.
    pub async fn close(&self) {
        let sinks = self.inner.lock().await.sinks.take();
        self.stop_all().await;
        drop(sinks);
        debug!("Scheduler closed");
    }

    /// Schedule every enabled check from storage; returns how many were started
    ///
    /// A check that cannot be built is logged and skipped.
    pub async fn load(&self, store: &dyn CheckStore) -> Result<usize> {
        let specs = store.load_active_checks().await?;
        let total = specs.len();
        let mut started = 0;

        for spec in specs.into_iter().filter(|spec| spec.enabled) {
            let id = spec.id;
            match self.add(spec).await {
                Ok(()) => started += 1,
                Err(e) => warn!("Skipping check {} at startup: {}", id, e),
            }
        }

        info!("Scheduled {} of {} stored checks", started, total);
        Ok(started)
    }

    pub async fn contains(&self, id: CheckId) -> bool {
        self.inner.lock().await.runners.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.runners.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn ids(&self) -> Vec<CheckId> {
        self.inner.lock().await.runners.keys().copied().collect()
    }

    /// State of the runner of a check, if any
    pub async fn state(&self, id: CheckId) -> Option<RunnerState> {
        self.inner.lock().await.runners.get(&id).map(|entry| entry.runner.state())
    }

    fn build(&self, spec: &CheckSpec) -> Result<Arc<dyn Check>, SchedulerError> {
        let factory = self
            .factories
            .get(spec.kind())
            .ok_or(SchedulerError::UnsupportedKind(spec.kind()))?;

        factory
            .build(spec)
            .map_err(|e| SchedulerError::InvalidCheck { id: spec.id, reason: format!("{:#}", e) })
    }

    async fn install(&self, spec: CheckSpec, check: Arc<dyn Check>) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().await;
        let sinks = inner.sinks.clone().ok_or(SchedulerError::Closed)?;

        if inner.runners.contains_key(&spec.id) {
            return Err(SchedulerError::DuplicateKey(spec.id));
        }

        let mut runner = Runner::new(check, self.settings.poll_interval, self.settings.start_jitter);
        runner.start(sinks);

        debug!("Scheduled {} check {} for {}", spec.kind(), spec.id, spec.config.target());
        inner.runners.insert(spec.id, Entry { spec, runner });
        Ok(())
    }
}
