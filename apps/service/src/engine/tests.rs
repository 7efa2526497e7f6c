/// Integration tests for engine components
///
/// These tests verify end-to-end functionality of:
/// - Registry exclusivity under concurrent add/remove/update
/// - Runner → writer → storage persistence
/// - Runner → alert evaluator → notifier gating
///
/// The doubles defined here are shared with the unit tests of the engine
/// submodules.
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::*;
use crate::checks::{
    Check, CheckConfig, CheckFactory, CheckId, CheckKind, CheckResult, CheckSpec, HttpDetail, Outcome,
    OwnerId, ResultDetail,
};
use crate::database::{AlertState, DatabaseImpl, Owner, initialize_database};
use crate::notify::{LogNotifier, NotifyError};
use crate::pool::open_pool;

pub(crate) const SLOW_CHECK: Duration = Duration::from_secs(5);

/// Check that never touches the network
///
/// Fails when its target mentions "down" and takes [`SLOW_CHECK`] when it
/// mentions "slow".
#[derive(Debug)]
pub(crate) struct FakeCheck {
    id: CheckId,
    owner: OwnerId,
    target: String,
    success: bool,
    latency: Duration,
    executions: AtomicUsize,
    origin: (DateTime<Utc>, Instant),
}

impl FakeCheck {
    pub(crate) fn new(success: bool) -> Arc<Self> {
        Arc::new(Self::build(CheckId::new(), OwnerId::new(), "fake".into(), success))
    }

    pub(crate) fn for_spec(spec: &CheckSpec) -> Arc<Self> {
        let target = spec.config.target();
        let success = !target.contains("down");
        Arc::new(Self::build(spec.id, spec.owner, target, success))
    }

    fn build(id: CheckId, owner: OwnerId, target: String, success: bool) -> Self {
        let latency = if target.contains("slow") { SLOW_CHECK } else { Duration::ZERO };
        Self {
            id,
            owner,
            target,
            success,
            latency,
            executions: AtomicUsize::new(0),
            origin: (Utc::now(), Instant::now()),
        }
    }

    pub(crate) fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Wall clock time following tokio's clock, so paused tests see time pass
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().duration_since(self.origin.1);
        self.origin.0 + chrono::Duration::from_std(elapsed).unwrap()
    }
}

#[async_trait]
impl Check for FakeCheck {
    fn id(&self) -> CheckId {
        self.id
    }

    fn owner(&self) -> OwnerId {
        self.owner
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Http
    }

    async fn execute(&self, _now: DateTime<Utc>) -> CheckResult {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let detail = if self.success {
            HttpDetail { status_code: Some(200), error: None }
        } else {
            HttpDetail { status_code: None, error: Some(format!("{} is down", self.target)) }
        };

        CheckResult {
            check_id: self.id,
            owner: self.owner,
            timestamp: self.now(),
            success: self.success,
            duration_ms: 1,
            detail: ResultDetail::Http(detail),
        }
    }
}

/// HTTP factory producing fake checks
struct FakeCheckFactory;

impl CheckFactory for FakeCheckFactory {
    fn kind(&self) -> CheckKind {
        CheckKind::Http
    }

    fn build(&self, spec: &CheckSpec) -> Result<Arc<dyn Check>> {
        self.validate(&spec.config)?;
        Ok(FakeCheck::for_spec(spec))
    }
}

pub(crate) fn fake_registry() -> Arc<CheckFactoryRegistry> {
    let mut registry = CheckFactoryRegistry::new();
    registry.register(Arc::new(FakeCheckFactory));
    Arc::new(registry)
}

pub(crate) fn http_spec(url: &str) -> CheckSpec {
    CheckSpec::new(OwnerId::new(), CheckConfig::Http { url: url.to_string() })
}

pub(crate) fn sinks(capacity: usize) -> (Sinks, mpsc::Receiver<CheckResult>, mpsc::Receiver<Outcome>) {
    let (results_tx, results_rx) = mpsc::channel(capacity);
    let (outcomes_tx, outcomes_rx) = mpsc::channel(capacity);
    (Sinks { results: results_tx, outcomes: outcomes_tx }, results_rx, outcomes_rx)
}

fn result(success: bool) -> CheckResult {
    CheckResult {
        check_id: CheckId::new(),
        owner: OwnerId::new(),
        timestamp: Utc::now(),
        success,
        duration_ms: 5,
        detail: ResultDetail::Http(HttpDetail { status_code: Some(if success { 200 } else { 500 }), error: None }),
    }
}

pub(crate) fn passing_result() -> CheckResult {
    result(true)
}

pub(crate) fn failing_result() -> CheckResult {
    result(false)
}

/// In-memory storage with switchable commit failures
#[derive(Default)]
pub(crate) struct MemoryStore {
    checks: Mutex<HashMap<CheckId, CheckSpec>>,
    owners: Mutex<HashMap<OwnerId, Owner>>,
    results: Mutex<Vec<CheckResult>>,
    alerts: Mutex<HashMap<CheckId, AlertState>>,
    commits: AtomicUsize,
    fail_commits: AtomicBool,
}

impl MemoryStore {
    pub(crate) fn with_checks(specs: &[CheckSpec]) -> Self {
        let store = Self::default();
        store.checks.lock().unwrap().extend(specs.iter().map(|spec| (spec.id, spec.clone())));
        store
    }

    pub(crate) fn result_count(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    pub(crate) fn results_of(&self, id: CheckId) -> Vec<CheckResult> {
        self.results.lock().unwrap().iter().filter(|r| r.check_id == id).cloned().collect()
    }

    pub(crate) fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn alert(&self, id: CheckId) -> Option<AlertState> {
        self.alerts.lock().unwrap().get(&id).cloned()
    }
}

#[async_trait]
impl CheckStore for MemoryStore {
    async fn load_active_checks(&self) -> Result<Vec<CheckSpec>> {
        Ok(self.checks.lock().unwrap().values().filter(|spec| spec.enabled).cloned().collect())
    }

    async fn get_check(&self, id: CheckId) -> Result<Option<CheckSpec>> {
        Ok(self.checks.lock().unwrap().get(&id).cloned())
    }

    async fn list_checks_by_owner(&self, owner: OwnerId) -> Result<Vec<CheckSpec>> {
        Ok(self.checks.lock().unwrap().values().filter(|spec| spec.owner == owner).cloned().collect())
    }

    async fn insert_check(&self, spec: &CheckSpec) -> Result<()> {
        self.checks.lock().unwrap().insert(spec.id, spec.clone());
        Ok(())
    }

    async fn update_check(&self, spec: &CheckSpec) -> Result<()> {
        let mut checks = self.checks.lock().unwrap();
        let existing = checks.get_mut(&spec.id).ok_or_else(|| anyhow!("no check with id {}", spec.id))?;
        *existing = spec.clone();
        Ok(())
    }

    async fn delete_check(&self, id: CheckId) -> Result<()> {
        self.checks.lock().unwrap().remove(&id);
        self.alerts.lock().unwrap().remove(&id);
        self.results.lock().unwrap().retain(|r| r.check_id != id);
        Ok(())
    }

    async fn create_owner(&self, owner: &Owner) -> Result<()> {
        self.owners.lock().unwrap().insert(owner.id, owner.clone());
        Ok(())
    }

    async fn get_owner(&self, id: OwnerId) -> Result<Option<Owner>> {
        Ok(self.owners.lock().unwrap().get(&id).cloned())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn commit_results(&self, batch: &[CheckResult]) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(anyhow!("disk full"));
        }
        self.results.lock().unwrap().extend_from_slice(batch);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn recent_results(&self, id: CheckId, limit: usize) -> Result<Vec<CheckResult>> {
        Ok(self.results_of(id).into_iter().rev().take(limit).collect())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn get_alert_state(&self, id: CheckId) -> Result<Option<AlertState>> {
        Ok(self.alert(id))
    }

    async fn upsert_alert_state(&self, state: &AlertState) -> Result<()> {
        if self.checks.lock().unwrap().contains_key(&state.check_id) {
            self.alerts.lock().unwrap().insert(state.check_id, state.clone());
        }
        Ok(())
    }

    async fn delete_alert_state(&self, id: CheckId) -> Result<()> {
        self.alerts.lock().unwrap().remove(&id);
        Ok(())
    }
}

/// Notifier recording every delivery, optionally failing
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<(OwnerId, String, String)>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub(crate) fn sent(&self) -> Vec<(OwnerId, String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_failure(&self, owner: OwnerId, subject: &str, text: &str) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Smtp("connection refused".into()));
        }
        self.sent.lock().unwrap().push((owner, subject.to_string(), text.to_string()));
        Ok(())
    }
}

fn settings(poll_secs: u64, threshold_secs: u64, cooldown_secs: u64) -> EngineSettings {
    EngineSettings {
        scheduler: SchedulerSettings { poll_interval: Duration::from_secs(poll_secs), start_jitter: false },
        writer: WriterSettings { flush_interval: Duration::from_secs(5), max_batch_size: 100, queue_capacity: 64 },
        alert_policy: AlertPolicy::Sustained {
            threshold: Duration::from_secs(threshold_secs),
            cooldown: Duration::from_secs(cooldown_secs),
        },
    }
}

fn outcome(check: &CheckSpec, success: bool, secs: i64) -> Outcome {
    Outcome {
        check_id: check.id,
        kind: CheckKind::Http,
        owner: check.owner,
        success,
        at: DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
        diagnostic: if success { "HTTP check succeeded".into() } else { "HTTP check failed".into() },
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_add_exactly_one_wins() {
    let (sinks, _results, _outcomes) = sinks(64);
    let scheduler = Arc::new(Scheduler::new(fake_registry(), SchedulerSettings::default(), sinks));
    let spec = http_spec("https://example.com");

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let scheduler = Arc::clone(&scheduler);
            let spec = spec.clone();
            tokio::spawn(async move { scheduler.add(spec).await })
        })
        .collect();

    let mut added = 0;
    let mut duplicates = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(()) => added += 1,
            Err(SchedulerError::DuplicateKey(id)) => {
                assert_eq!(id, spec.id);
                duplicates += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!((added, duplicates), (1, 7));
    assert_eq!(scheduler.len().await, 1);
    scheduler.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_churn_keeps_at_most_one_runner_per_check() {
    let (sinks, _results, _outcomes) = sinks(1024);
    let scheduler = Arc::new(Scheduler::new(
        fake_registry(),
        SchedulerSettings { poll_interval: Duration::from_millis(100), start_jitter: false },
        sinks,
    ));
    let specs: Vec<_> = (0..3).map(|i| http_spec(&format!("https://{i}.example.com"))).collect();

    let workers: Vec<_> = (0..6)
        .map(|worker| {
            let scheduler = Arc::clone(&scheduler);
            let specs = specs.clone();
            tokio::spawn(async move {
                for round in 0..20 {
                    let spec = &specs[(worker + round) % specs.len()];
                    let _ = match (worker + round) % 3 {
                        0 => scheduler.add(spec.clone()).await.map(|_| ()),
                        1 => scheduler.remove(spec.id).await.map(|_| ()),
                        _ => scheduler.update(spec.id, spec.config.clone()).await.map(|_| ()),
                    };
                    tokio::time::sleep(Duration::from_millis(30)).await;
                }
            })
        })
        .collect();

    for worker in workers {
        worker.await.unwrap();
        assert!(scheduler.len().await <= specs.len());
    }

    let ids = scheduler.ids().await;
    for spec in &specs {
        assert!(ids.iter().filter(|id| **id == spec.id).count() <= 1);
    }
    scheduler.stop_all().await;
    assert!(scheduler.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_removed_check_emits_nothing() {
    let (sinks, mut results, _outcomes) = sinks(256);
    let scheduler = Scheduler::new(
        fake_registry(),
        SchedulerSettings { poll_interval: Duration::from_secs(1), start_jitter: false },
        sinks,
    );
    let kept = http_spec("https://kept.example.com");
    let removed = http_spec("https://removed.example.com");
    scheduler.add(kept.clone()).await.unwrap();
    scheduler.add(removed.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    scheduler.remove(removed.id).await.unwrap();
    while results.try_recv().is_ok() {}

    tokio::time::sleep(Duration::from_secs(10)).await;
    let mut after = Vec::new();
    while let Ok(result) = results.try_recv() {
        after.push(result.check_id);
    }

    assert!(!after.is_empty());
    assert!(after.iter().all(|id| *id == kept.id));
    scheduler.stop_all().await;
}

#[tokio::test]
async fn test_evaluator_follows_failure_episode() {
    let check = http_spec("https://example.com");
    let store = Arc::new(MemoryStore::with_checks(&[check.clone()]));
    let notifier = Arc::new(RecordingNotifier::default());
    let policy = AlertPolicy::Sustained { threshold: Duration::from_secs(30), cooldown: Duration::from_secs(300) };
    let (evaluator, _tx) = AlertEvaluator::new(store.clone(), notifier.clone(), policy, 16);

    let timeline = [
        (false, 0, AlertDecision::EpisodeStarted),
        (false, 15, AlertDecision::Pending),
        (false, 30, AlertDecision::Notify),
        (false, 45, AlertDecision::Cooldown),
        (false, 60, AlertDecision::Cooldown),
        (true, 70, AlertDecision::Healthy),
        (false, 85, AlertDecision::EpisodeStarted),
    ];
    for (success, secs, expected) in timeline {
        assert_eq!(evaluator.evaluate(&outcome(&check, success, secs)).await.unwrap(), expected, "at t={secs}s");
    }

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, check.owner);
    assert_eq!(sent[0].1, "[Vigil] Problem found");
    assert!(sent[0].2.starts_with(&format!("Check of type http with id {} failed:", check.id)));

    let state = store.alert(check.id).unwrap();
    assert_eq!(state.failed_since, Some(outcome(&check, false, 85).at));
    assert_eq!(state.last_notified, Some(outcome(&check, false, 30).at));
}

#[tokio::test]
async fn test_failed_notification_is_retried_on_next_failure() {
    let check = http_spec("https://example.com");
    let store = Arc::new(MemoryStore::with_checks(&[check.clone()]));
    let notifier = Arc::new(RecordingNotifier::default());
    let policy = AlertPolicy::Sustained { threshold: Duration::from_secs(30), cooldown: Duration::from_secs(300) };
    let (evaluator, _tx) = AlertEvaluator::new(store.clone(), notifier.clone(), policy, 16);

    evaluator.evaluate(&outcome(&check, false, 0)).await.unwrap();
    notifier.set_failing(true);
    assert_eq!(evaluator.evaluate(&outcome(&check, false, 30)).await.unwrap(), AlertDecision::Notify);
    assert_eq!(store.alert(check.id).unwrap().last_notified, None);

    notifier.set_failing(false);
    assert_eq!(evaluator.evaluate(&outcome(&check, false, 45)).await.unwrap(), AlertDecision::Notify);
    assert_eq!(notifier.sent().len(), 1);
    assert_eq!(store.alert(check.id).unwrap().last_notified, Some(outcome(&check, false, 45).at));
}

#[tokio::test]
async fn test_alert_state_of_deleted_check_is_not_recreated() {
    let check = http_spec("https://example.com");
    let store = Arc::new(MemoryStore::default());
    let (evaluator, _tx) = AlertEvaluator::new(store.clone(), Arc::new(LogNotifier), AlertPolicy::default(), 16);

    evaluator.evaluate(&outcome(&check, false, 0)).await.unwrap();

    assert!(store.alert(check.id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_engine_persists_and_alerts() {
    let failing = http_spec("https://down.example.com");
    let healthy = http_spec("https://up.example.com");
    let store = Arc::new(MemoryStore::with_checks(&[failing.clone(), healthy.clone()]));
    let notifier = Arc::new(RecordingNotifier::default());

    let engine = Engine::start(settings(15, 30, 300), store.clone(), notifier.clone(), fake_registry())
        .await
        .unwrap();
    assert_eq!(engine.scheduler().len().await, 2);

    // Ticks at 15s, 30s, ..., 120s; the failure episode starts at 15s
    tokio::time::sleep(Duration::from_millis(121_000)).await;
    let stats = engine.writer_stats();
    engine.shutdown().await.unwrap();

    assert_eq!(store.results_of(failing.id).len(), 8);
    assert_eq!(store.results_of(healthy.id).len(), 8);
    assert_eq!(stats.committed(), 16);
    assert_eq!(stats.dropped(), 0);

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, failing.owner);
    assert!(sent[0].2.contains("https://down.example.com is down"));

    let state = store.alert(failing.id).unwrap();
    assert!(state.failed_since.is_some());
    assert!(store.alert(healthy.id).unwrap().failed_since.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_engine_shutdown_commits_last_batch() {
    let check = http_spec("https://example.com");
    let store = Arc::new(MemoryStore::with_checks(&[check.clone()]));
    let mut settings = settings(1, 60, 300);
    settings.writer.flush_interval = Duration::from_secs(3600);

    let engine = Engine::start(settings, store.clone(), Arc::new(LogNotifier), fake_registry())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(store.result_count(), 0);

    engine.shutdown().await.unwrap();
    assert_eq!(store.result_count(), 3);
    assert_eq!(store.commits(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_engine_skips_unbuildable_checks() {
    let good = http_spec("https://example.com");
    let tls = CheckSpec::new(OwnerId::new(), CheckConfig::Tls { host: "example.com".into(), port: 443 });
    let mut disabled = http_spec("https://disabled.example.com");
    disabled.enabled = false;
    let store = Arc::new(MemoryStore::with_checks(&[good.clone(), tls, disabled]));

    let engine = Engine::start(settings(15, 60, 300), store, Arc::new(LogNotifier), fake_registry())
        .await
        .unwrap();

    assert_eq!(engine.scheduler().ids().await, vec![good.id]);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_engine_with_libsql_storage() -> Result<()> {
    let temp_dir = tempdir()?;
    let pool = open_pool(temp_dir.path().join("engine.db"), 4).await?;
    initialize_database(&*pool.get().await?).await?;
    let db = Arc::new(DatabaseImpl::new_from_pool(pool));

    let owner = Owner::new("ops@example.com".into());
    db.create_owner(&owner).await?;
    let check = CheckSpec::new(owner.id, CheckConfig::Http { url: "https://down.example.com".into() });
    db.insert_check(&check).await?;

    let mut settings = settings(1, 0, 300);
    settings.scheduler.poll_interval = Duration::from_millis(50);
    settings.writer.flush_interval = Duration::from_millis(20);

    let notifier = Arc::new(RecordingNotifier::default());
    let engine = Engine::start(settings, db.clone(), notifier.clone(), fake_registry()).await?;
    tokio::time::sleep(Duration::from_millis(400)).await;
    let stats = engine.writer_stats();
    engine.shutdown().await?;

    let stored = db.recent_results(check.id, 1000).await?;
    assert!(!stored.is_empty());
    assert_eq!(stored.len() as u64, stats.committed());
    assert!(stored.iter().all(|result| !result.success));

    let state = db.get_alert_state(check.id).await?.expect("alert state");
    assert!(state.failed_since.is_some());
    assert!(state.consecutive_failures as usize >= stored.len().min(2));
    if stored.len() >= 2 {
        assert_eq!(notifier.sent().len(), 1);
    }
    Ok(())
}
