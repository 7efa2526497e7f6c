//! User initiated check management.
//!
//! Storage is the source of truth for definitions, the scheduler for what
//! runs. Every operation keeps the two in step and scopes access to the
//! owner of the check.

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::checks::{CheckConfig, CheckFactoryRegistry, CheckId, CheckResult, CheckSpec, OwnerId};
use crate::database::{CheckStore, ResultStore};
use crate::engine::{Scheduler, SchedulerError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Check {0} not found")]
    NotFound(CheckId),

    #[error("Invalid check: {0}")]
    Invalid(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub struct CheckService {
    checks: Arc<dyn CheckStore>,
    results: Arc<dyn ResultStore>,
    scheduler: Arc<Scheduler>,
    factories: Arc<CheckFactoryRegistry>,
}

impl CheckService {
    pub fn new<D>(db: Arc<D>, scheduler: Arc<Scheduler>, factories: Arc<CheckFactoryRegistry>) -> Self
    where
        D: CheckStore + ResultStore + 'static,
    {
        Self { checks: db.clone(), results: db, scheduler, factories }
    }

    /// Validate, persist and schedule a new check
    pub async fn create(&self, owner: OwnerId, config: CheckConfig) -> Result<CheckSpec, ServiceError> {
        self.validate(&config)?;

        let spec = CheckSpec::new(owner, config);
        self.checks.insert_check(&spec).await?;

        if let Err(e) = self.scheduler.add(spec.clone()).await {
            // Not scheduled, so not kept either
            self.checks.delete_check(spec.id).await?;
            return Err(e.into());
        }

        info!("Created {} check {} for owner {}", spec.kind(), spec.id, owner);
        Ok(spec)
    }

    pub async fn read(&self, owner: OwnerId, id: CheckId) -> Result<CheckSpec, ServiceError> {
        self.checks
            .get_check(id)
            .await?
            .filter(|spec| spec.owner == owner)
            .ok_or(ServiceError::NotFound(id))
    }

    pub async fn list_by_owner(&self, owner: OwnerId) -> Result<Vec<CheckSpec>, ServiceError> {
        Ok(self.checks.list_checks_by_owner(owner).await?)
    }

    /// Most recent results of a check, newest first
    pub async fn results(&self, owner: OwnerId, id: CheckId, limit: usize) -> Result<Vec<CheckResult>, ServiceError> {
        self.read(owner, id).await?;
        Ok(self.results.recent_results(id, limit).await?)
    }

    /// Persist a new configuration and restart the runner with it
    ///
    /// History and alert state are kept; only the runner is replaced.
    pub async fn update(&self, owner: OwnerId, id: CheckId, config: CheckConfig) -> Result<CheckSpec, ServiceError> {
        let current = self.read(owner, id).await?;
        self.validate(&config)?;

        let spec = current.with_config(config.clone());
        self.checks.update_check(&spec).await?;

        if spec.enabled {
            match self.scheduler.update(id, config).await {
                Ok(_) => {}
                Err(SchedulerError::NotFound(_)) => {
                    warn!("Check {} was not scheduled, scheduling it now", id);
                    self.scheduler.add(spec.clone()).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!("Updated check {} to {}", id, spec.config.target());
        Ok(spec)
    }

    /// Stop the runner, then delete the check with its results and alert state
    pub async fn delete(&self, owner: OwnerId, id: CheckId) -> Result<(), ServiceError> {
        self.read(owner, id).await?;

        match self.scheduler.remove(id).await {
            Ok(_) | Err(SchedulerError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.checks.delete_check(id).await?;

        info!("Deleted check {}", id);
        Ok(())
    }

    fn validate(&self, config: &CheckConfig) -> Result<(), ServiceError> {
        self.factories.validate(config).map_err(|e| ServiceError::Invalid(format!("{:#}", e)))
    }
}
