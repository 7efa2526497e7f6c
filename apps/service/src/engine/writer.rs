//! Batched persistence of check results.
//!
//! Results are buffered and committed in one storage transaction per batch:
//! on every flush tick, whenever the batch is full, and once more when the
//! stream closes. A failed commit is rolled back and its results are lost;
//! the loss is logged and counted in [`WriterStats`].

use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info};

use crate::checks::CheckResult;
use crate::database::ResultStore;

#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub flush_interval: Duration,
    pub max_batch_size: usize,
    pub queue_capacity: usize,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self { flush_interval: Duration::from_secs(5), max_batch_size: 500, queue_capacity: 1024 }
    }
}

/// Counters of the writer, readable while it runs
#[derive(Debug, Default)]
pub struct WriterStats {
    committed: AtomicU64,
    dropped: AtomicU64,
    batches_committed: AtomicU64,
    batches_failed: AtomicU64,
}

impl WriterStats {
    /// Results durably written
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    /// Results lost to failed commits
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn batches_committed(&self) -> u64 {
        self.batches_committed.load(Ordering::Relaxed)
    }

    pub fn batches_failed(&self) -> u64 {
        self.batches_failed.load(Ordering::Relaxed)
    }
}

/// Producer side of the writer
#[derive(Debug, Clone)]
pub struct ResultSubmitter {
    tx: mpsc::Sender<CheckResult>,
}

impl ResultSubmitter {
    /// Enqueue a result; only waits for queue space, never for storage
    pub async fn submit(&self, result: CheckResult) -> Result<()> {
        self.tx
            .send(result)
            .await
            .map_err(|_| anyhow!("result writer has stopped"))
    }

    /// Raw sender, handed to runners
    pub fn sender(&self) -> mpsc::Sender<CheckResult> {
        self.tx.clone()
    }
}

/// Draining side of the writer
pub struct BatchWriter {
    store: Arc<dyn ResultStore>,
    settings: WriterSettings,
    rx: mpsc::Receiver<CheckResult>,
    stats: Arc<WriterStats>,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn ResultStore>, settings: WriterSettings) -> (Self, ResultSubmitter) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let writer = Self { store, settings, rx, stats: Arc::new(WriterStats::default()) };
        (writer, ResultSubmitter { tx })
    }

    pub fn stats(&self) -> Arc<WriterStats> {
        Arc::clone(&self.stats)
    }

    /// Drain the stream until every submitter is gone, committing as it goes
    pub async fn run(mut self) {
        let period = self.settings.flush_interval.max(Duration::from_millis(1));
        let max_batch_size = self.settings.max_batch_size.max(1);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut batch = Vec::with_capacity(max_batch_size);

        info!("Result writer started (flush every {:?}, at most {} per batch)", period, max_batch_size);

        loop {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(result) => {
                        batch.push(result);
                        if batch.len() >= max_batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => {
                        self.flush(&mut batch).await;
                        break;
                    }
                },
                _ = ticker.tick() => self.flush(&mut batch).await,
            }
        }

        info!(
            "Result writer stopped: {} results committed, {} lost in {} failed batches",
            self.stats.committed(),
            self.stats.dropped(),
            self.stats.batches_failed()
        );
    }

    async fn flush(&self, batch: &mut Vec<CheckResult>) {
        if batch.is_empty() {
            return;
        }

        let count = batch.len() as u64;
        match self.store.commit_results(batch).await {
            Ok(()) => {
                self.stats.committed.fetch_add(count, Ordering::Relaxed);
                self.stats.batches_committed.fetch_add(1, Ordering::Relaxed);
                debug!("Committed batch of {} results", count);
            }
            Err(e) => {
                self.stats.dropped.fetch_add(count, Ordering::Relaxed);
                self.stats.batches_failed.fetch_add(1, Ordering::Relaxed);
                error!("Failed to commit batch, {} results lost: {:#}", count, e);
            }
        }

        batch.clear();
    }
}
