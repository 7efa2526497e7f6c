//! Failure tracking and notification gating.
//!
//! Every outcome moves the check's [`AlertState`] through a failure episode.
//! An owner is notified once a failure persisted long enough, and at most
//! once per cooldown window while it goes on.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::checks::Outcome;
use crate::database::{AlertState, AlertStore};
use crate::notify::Notifier;

pub const NOTIFICATION_SUBJECT: &str = "[Vigil] Problem found";

/// When a failing check becomes worth a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertPolicy {
    /// Failing for at least `threshold` since the first failure of the episode
    Sustained { threshold: Duration, cooldown: Duration },
    /// At least `failures` failed executions in a row
    Consecutive { failures: u32, cooldown: Duration },
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self::Sustained { threshold: Duration::from_secs(60), cooldown: Duration::from_secs(300) }
    }
}

impl AlertPolicy {
    pub fn cooldown(&self) -> Duration {
        match self {
            Self::Sustained { cooldown, .. } | Self::Consecutive { cooldown, .. } => *cooldown,
        }
    }
}

/// What one outcome did to the alert state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDecision {
    /// Success; any failure episode is over
    Healthy,
    /// First failure of a new episode
    EpisodeStarted,
    /// Still failing, not yet past the policy's threshold
    Pending,
    /// Past the threshold, but a notification was sent within the cooldown
    Cooldown,
    /// The owner should be notified
    Notify,
}

impl AlertState {
    /// Apply one outcome observed at `at`
    ///
    /// `failed_since` is only cleared by a success. `last_notified` is never
    /// touched here; see [`AlertState::mark_notified`].
    pub fn observe(&mut self, success: bool, at: DateTime<Utc>, policy: &AlertPolicy) -> AlertDecision {
        if success {
            self.failed_since = None;
            self.consecutive_failures = 0;
            return AlertDecision::Healthy;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let started = self.failed_since.is_none();
        let failed_since = *self.failed_since.get_or_insert(at);

        let eligible = match policy {
            // The first failure of an episode never notifies on its own
            AlertPolicy::Sustained { threshold, .. } => !started && elapsed(failed_since, at) >= *threshold,
            AlertPolicy::Consecutive { failures, .. } => self.consecutive_failures >= *failures,
        };

        if !eligible {
            return if started { AlertDecision::EpisodeStarted } else { AlertDecision::Pending };
        }

        match self.last_notified {
            Some(last) if elapsed(last, at) < policy.cooldown() => AlertDecision::Cooldown,
            _ => AlertDecision::Notify,
        }
    }

    /// Record a delivered notification
    pub fn mark_notified(&mut self, at: DateTime<Utc>) {
        self.last_notified = Some(at);
    }
}

/// Time from `since` to `at`; zero when the clock went backwards
fn elapsed(since: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - since).to_std().unwrap_or_default()
}

/// Body of the failure notification
pub fn failure_text(outcome: &Outcome) -> String {
    format!("Check of type {} with id {} failed: {}", outcome.kind, outcome.check_id, outcome.diagnostic)
}

/// Consumes outcomes, keeps alert state and notifies owners
pub struct AlertEvaluator {
    store: Arc<dyn AlertStore>,
    notifier: Arc<dyn Notifier>,
    policy: AlertPolicy,
    rx: mpsc::Receiver<Outcome>,
}

impl AlertEvaluator {
    pub fn new(
        store: Arc<dyn AlertStore>,
        notifier: Arc<dyn Notifier>,
        policy: AlertPolicy,
        capacity: usize,
    ) -> (Self, mpsc::Sender<Outcome>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { store, notifier, policy, rx }, tx)
    }

    /// Evaluate outcomes until every sender is gone
    pub async fn run(mut self) {
        info!("Alert evaluator started with {:?}", self.policy);

        while let Some(outcome) = self.rx.recv().await {
            if let Err(e) = self.evaluate(&outcome).await {
                warn!("Skipping outcome of check {}: {:#}", outcome.check_id, e);
            }
        }

        info!("Alert evaluator stopped");
    }

    /// Process a single outcome
    ///
    /// A failed notification leaves `last_notified` unchanged, so the next
    /// failing outcome tries again.
    pub async fn evaluate(&self, outcome: &Outcome) -> Result<AlertDecision> {
        let mut state = self
            .store
            .get_alert_state(outcome.check_id)
            .await?
            .unwrap_or_else(|| AlertState::new(outcome.check_id, outcome.kind, outcome.owner));

        let decision = state.observe(outcome.success, outcome.at, &self.policy);
        match decision {
            AlertDecision::Notify => {
                let text = failure_text(outcome);
                match self.notifier.send_failure(outcome.owner, NOTIFICATION_SUBJECT, &text).await {
                    Ok(()) => {
                        state.mark_notified(outcome.at);
                        info!("Notified owner {} about check {}", outcome.owner, outcome.check_id);
                    }
                    Err(e) => {
                        warn!("Failed to notify owner {} about check {}: {}", outcome.owner, outcome.check_id, e)
                    }
                }
            }
            AlertDecision::EpisodeStarted => debug!("Check {} started failing", outcome.check_id),
            _ => {}
        }

        self.store.upsert_alert_state(&state).await?;
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::{CheckId, CheckKind, OwnerId};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn sustained(threshold: u64, cooldown: u64) -> AlertPolicy {
        AlertPolicy::Sustained {
            threshold: Duration::from_secs(threshold),
            cooldown: Duration::from_secs(cooldown),
        }
    }

    fn state() -> AlertState {
        AlertState::new(CheckId::new(), CheckKind::Http, OwnerId::new())
    }

    #[test]
    fn test_failure_episode_timeline() {
        let policy = sustained(30, 300);
        let mut state = state();
        let notify = |state: &mut AlertState, success: bool, secs: i64| {
            let decision = state.observe(success, at(secs), &policy);
            if decision == AlertDecision::Notify {
                state.mark_notified(at(secs));
            }
            decision
        };

        assert_eq!(notify(&mut state, false, 0), AlertDecision::EpisodeStarted);
        assert_eq!(notify(&mut state, false, 15), AlertDecision::Pending);
        assert_eq!(notify(&mut state, false, 30), AlertDecision::Notify);
        assert_eq!(notify(&mut state, false, 45), AlertDecision::Cooldown);
        assert_eq!(notify(&mut state, false, 60), AlertDecision::Cooldown);
        assert_eq!(notify(&mut state, true, 70), AlertDecision::Healthy);
        assert_eq!(state.failed_since, None);
        assert_eq!(state.last_notified, Some(at(30)));
        assert_eq!(notify(&mut state, false, 85), AlertDecision::EpisodeStarted);
        assert_eq!(state.failed_since, Some(at(85)));
    }

    #[test]
    fn test_failed_since_tracks_episodes() {
        let policy = AlertPolicy::default();
        let mut state = state();

        for (i, success) in [false, false, true, false, true, true, false].into_iter().enumerate() {
            state.observe(success, at(i as i64 * 15), &policy);
            assert_eq!(state.failed_since.is_none(), success);
        }
    }

    #[test]
    fn test_short_episode_never_notifies() {
        let policy = sustained(60, 300);
        let mut state = state();

        for secs in (0..60).step_by(15) {
            assert_ne!(state.observe(false, at(secs), &policy), AlertDecision::Notify);
        }
        state.observe(true, at(60), &policy);
        assert_ne!(state.observe(false, at(75), &policy), AlertDecision::Notify);
    }

    #[test]
    fn test_one_notification_per_cooldown_window() {
        let policy = sustained(60, 300);
        let mut state = state();
        let mut sent = Vec::new();

        // Fails every 15s for 20 minutes
        for secs in (0..1200).step_by(15) {
            if state.observe(false, at(secs), &policy) == AlertDecision::Notify {
                state.mark_notified(at(secs));
                sent.push(secs);
            }
        }

        assert_eq!(sent, vec![60, 360, 660, 960]);
    }

    #[test]
    fn test_unsent_notification_is_retried_next_failure() {
        let policy = sustained(30, 300);
        let mut state = state();

        state.observe(false, at(0), &policy);
        assert_eq!(state.observe(false, at(30), &policy), AlertDecision::Notify);
        // Delivery failed, so nothing is marked
        assert_eq!(state.observe(false, at(45), &policy), AlertDecision::Notify);
    }

    #[test]
    fn test_consecutive_policy() {
        let policy = AlertPolicy::Consecutive { failures: 3, cooldown: Duration::from_secs(300) };
        let mut state = state();

        assert_eq!(state.observe(false, at(0), &policy), AlertDecision::EpisodeStarted);
        assert_eq!(state.observe(false, at(1), &policy), AlertDecision::Pending);
        assert_eq!(state.observe(false, at(2), &policy), AlertDecision::Notify);
        state.mark_notified(at(2));
        assert_eq!(state.observe(false, at(3), &policy), AlertDecision::Cooldown);

        state.observe(true, at(4), &policy);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_clock_going_backwards_counts_as_no_time() {
        let policy = sustained(30, 300);
        let mut state = state();

        state.observe(false, at(100), &policy);
        assert_eq!(state.observe(false, at(50), &policy), AlertDecision::Pending);
    }

    #[test]
    fn test_failure_text() {
        let outcome = Outcome {
            check_id: CheckId::new(),
            kind: CheckKind::Tls,
            owner: OwnerId::new(),
            success: false,
            at: at(0),
            diagnostic: "TLS check failed: TLS handshake failed".into(),
        };

        assert_eq!(
            failure_text(&outcome),
            format!("Check of type tls with id {} failed: TLS check failed: TLS handshake failed", outcome.check_id)
        );
    }
}
