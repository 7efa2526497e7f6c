//! Execution loop driving one check on a fixed interval.
//!
//! A runner owns no shared state: it executes its check on every tick and
//! hands the result to the writer and the outcome to the alert evaluator.

use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use crate::checks::{Check, CheckId, CheckResult, Outcome};

/// Streams every runner emits into
#[derive(Debug, Clone)]
pub struct Sinks {
    pub results: mpsc::Sender<CheckResult>,
    pub outcomes: mpsc::Sender<Outcome>,
}

/// Lifecycle of a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunnerState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl RunnerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Shared cell holding a runner's state, written by the loop and its owner
#[derive(Debug, Clone)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(RunnerState::Idle as u8)))
    }

    fn get(&self) -> RunnerState {
        RunnerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: RunnerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Periodic, cancellable execution of one check
#[derive(Debug)]
pub struct Runner {
    check: Arc<dyn Check>,
    period: Duration,
    jitter: bool,
    state: StateCell,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    done: Option<watch::Receiver<bool>>,
}

/// Completion signal of a runner that was asked to stop
#[derive(Debug)]
pub struct Completion {
    id: CheckId,
    state: StateCell,
    handle: JoinHandle<()>,
}

impl Completion {
    /// Wait until the execution loop has exited
    pub async fn wait(self) {
        if let Err(e) = self.handle.await {
            error!("Runner for check {} terminated abnormally: {}", self.id, e);
        }
        self.state.set(RunnerState::Stopped);
    }
}

/// Exit signal of a started runner, observable by anyone holding it
///
/// Unlike [`Completion`] it does not own the task, so it can be awaited
/// for a runner someone else already asked to stop.
#[derive(Debug)]
pub struct Termination(watch::Receiver<bool>);

impl Termination {
    pub async fn wait(mut self) {
        // A dropped sender means the loop task is gone as well
        let _ = self.0.wait_for(|done| *done).await;
    }
}

impl Runner {
    /// Create an idle runner ticking every `period`
    pub fn new(check: Arc<dyn Check>, period: Duration, jitter: bool) -> Self {
        Self {
            check,
            period: period.max(Duration::from_millis(1)),
            jitter,
            state: StateCell::new(),
            stop_tx: None,
            handle: None,
            done: None,
        }
    }

    pub fn id(&self) -> CheckId {
        self.check.id()
    }

    pub fn state(&self) -> RunnerState {
        self.state.get()
    }

    /// Launch the execution loop; returns once the task is spawned, not once it ticked
    pub fn start(&mut self, sinks: Sinks) {
        if self.state() != RunnerState::Idle {
            warn!("Runner for check {} already started ({:?})", self.id(), self.state());
            return;
        }

        let first_tick = Instant::now() + self.start_delay();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);

        self.state.set(RunnerState::Running);
        self.stop_tx = Some(stop_tx);
        self.done = Some(done_rx);
        self.handle = Some(tokio::spawn(run_loop(
            Arc::clone(&self.check),
            first_tick,
            self.period,
            sinks,
            stop_rx,
            self.state.clone(),
            done_tx,
        )));

        debug!("Started runner for check {} every {:?}", self.id(), self.period);
    }

    /// Signal the loop to stop; the returned completion confirms termination
    ///
    /// Returns `None` when the runner was never started or is already stopping.
    pub fn stop(&mut self) -> Option<Completion> {
        let handle = self.handle.take()?;

        self.state.set(RunnerState::Stopping);
        if let Some(stop_tx) = self.stop_tx.take() {
            // The loop may already have exited on a closed stream
            let _ = stop_tx.send(());
        }

        Some(Completion { id: self.id(), state: self.state.clone(), handle })
    }

    /// Whether `stop` already handed out the completion of this runner
    pub fn stop_requested(&self) -> bool {
        self.handle.is_none() && self.state() != RunnerState::Idle
    }

    /// Signal fired once the loop has exited, however it was stopped
    ///
    /// `None` for a runner that was never started.
    pub fn terminated(&self) -> Option<Termination> {
        self.done.clone().map(Termination)
    }

    /// Stop and wait for termination
    pub async fn shutdown(mut self) {
        if let Some(completion) = self.stop() {
            completion.wait().await;
        }
    }

    /// Delay before the first tick, randomized to stagger runners started together
    fn start_delay(&self) -> Duration {
        if !self.jitter {
            return self.period;
        }
        let millis = self.period.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..millis.max(1)))
    }
}

async fn run_loop(
    check: Arc<dyn Check>,
    first_tick: Instant,
    period: Duration,
    sinks: Sinks,
    mut stop_rx: oneshot::Receiver<()>,
    state: StateCell,
    done: watch::Sender<bool>,
) {
    let id = check.id();
    let mut ticker = interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            // A dropped sender counts as a stop request too
            _ = &mut stop_rx => {
                debug!("Runner for check {} received stop signal", id);
                break;
            }

            _ = ticker.tick() => {
                let result = check.execute(Utc::now()).await;
                let outcome = Outcome::from(&result);

                if !emit(&sinks.results, result, "result", id).await
                    || !emit(&sinks.outcomes, outcome, "outcome", id).await
                {
                    break;
                }
            }
        }
    }

    state.set(RunnerState::Stopped);
    done.send_replace(true);
    debug!("Runner for check {} stopped", id);
}

/// Hand an item to a stream; returns false once the stream is closed
///
/// A full stream is waited on rather than dropped from, which stalls the
/// runner's next tick until the consumer catches up.
async fn emit<T>(tx: &mpsc::Sender<T>, item: T, stream: &str, id: CheckId) -> bool {
    match tx.try_send(item) {
        Ok(()) => true,
        Err(TrySendError::Full(item)) => {
            warn!("The {} stream is full, check {} waits for the consumer", stream, id);
            if tx.send(item).await.is_err() {
                info!("The {} stream closed, runner for check {} exits", stream, id);
                return false;
            }
            true
        }
        Err(TrySendError::Closed(_)) => {
            info!("The {} stream closed, runner for check {} exits", stream, id);
            false
        }
    }
}
