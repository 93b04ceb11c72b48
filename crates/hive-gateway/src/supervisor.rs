//! Background reconnection of failed computes with exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use hive_proto::ComputeId;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;

/// Backoff applied between reconnection attempts of one compute.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Growth factor of the delay per attempt.
    pub backoff_multiplier: f64,
    /// Attempts before giving up (`None` = forever).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given attempt (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    #[must_use]
    pub const fn should_reconnect(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

/// Handle of the running supervisor task.
#[derive(Debug)]
pub struct SupervisorHandle {
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Check if the supervisor is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    /// Stop the supervisor. Attempts in flight are abandoned.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug)]
struct RetryState {
    attempts: u32,
    next_at: Instant,
    gave_up: bool,
}

/// Start the supervisor.
///
/// Every `check_interval` it looks for `failed` computes and reconnects the
/// ones whose backoff has elapsed, without reporting failures. A compute
/// leaves the schedule once it is no longer failed.
pub fn start_supervisor(
    connections: Arc<ConnectionManager>,
    check_interval: Duration,
    reconnect: ReconnectConfig,
) -> SupervisorHandle {
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);

    let task = tokio::spawn(async move {
        let mut timer = tokio::time::interval(check_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut schedule: HashMap<ComputeId, RetryState> = HashMap::new();
        info!(interval = ?check_interval, "reconnect supervisor started");

        while flag.load(Ordering::SeqCst) {
            timer.tick().await;
            if !flag.load(Ordering::SeqCst) {
                break;
            }

            let due = collect_due(&connections, &reconnect, &mut schedule, Instant::now());
            if due.is_empty() {
                continue;
            }

            debug!(count = due.len(), "reconnecting failed computes");
            let attempts = due.iter().map(|id| connections.connect(id, false));
            for (id, result) in due.iter().zip(join_all(attempts).await) {
                if let Err(e) = result {
                    debug!(compute_id = %id, error = %e, "reconnect skipped");
                } else if connections.is_connected(id) {
                    info!(compute_id = %id, "compute reconnected");
                }
            }
        }
        debug!("reconnect supervisor stopped");
    });

    SupervisorHandle { running, task }
}

/// Update the schedule from the registry and return the computes to retry now.
fn collect_due(
    connections: &ConnectionManager,
    reconnect: &ReconnectConfig,
    schedule: &mut HashMap<ComputeId, RetryState>,
    now: Instant,
) -> Vec<ComputeId> {
    let failed: Vec<ComputeId> = connections
        .registry()
        .list()
        .into_iter()
        .filter(|record| record.status.is_failed())
        .map(|record| record.compute_id)
        .collect();

    schedule.retain(|id, _| failed.contains(id));

    let mut due = Vec::new();
    for id in failed {
        let state = schedule.entry(id.clone()).or_insert_with(|| RetryState {
            attempts: 0,
            next_at: now + reconnect.delay_for_attempt(1),
            gave_up: false,
        });

        if state.gave_up || now < state.next_at {
            continue;
        }
        if !reconnect.should_reconnect(state.attempts) {
            state.gave_up = true;
            warn!(compute_id = %id, attempts = state.attempts, "giving up reconnecting compute");
            continue;
        }

        state.attempts += 1;
        state.next_at = now + reconnect.delay_for_attempt(state.attempts + 1);
        due.push(id);
    }
    due
}
