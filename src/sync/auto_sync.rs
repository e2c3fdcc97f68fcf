//! Background sync triggers.
//!
//! Two tasks run per engine: one reacts to the device coming back online,
//! the other drains the queue on a fixed period. Both share the worker's
//! single-flight guard and last-attempt clock, so they never overlap and
//! never drain more often than the configured minimum spacing allows.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::engine::{EngineError, SyncContext};
use crate::sync::DrainOutcome;

const MIN_PERIOD: Duration = Duration::from_millis(10);

/// Owns the autosync tasks. Dropping it aborts them.
pub struct AutoSyncHandle {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl AutoSyncHandle {
    /// Signals both tasks to stop and waits for them to finish.
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(true);
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                tracing::error!("Autosync task ended abnormally: {}", e);
            }
        }
        tracing::debug!("Autosync stopped");
    }
}

impl Drop for AutoSyncHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Starts the reconnect and periodic triggers.
///
/// The reconnect task begins with one gated drain so that anything queued
/// by a previous run goes out as soon as the server is reachable.
pub fn start(context: Arc<SyncContext>) -> AutoSyncHandle {
    let (stop, stop_rx) = watch::channel(false);
    let reconnect = tokio::spawn(reconnect_loop(Arc::clone(&context), stop_rx.clone()));
    let periodic = tokio::spawn(periodic_loop(context, stop_rx));
    AutoSyncHandle {
        stop,
        tasks: vec![reconnect, periodic],
    }
}

/// Sleeps for `delay`; returns true if a stop was requested meanwhile.
async fn sleep_or_stop(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stop.changed() => true,
    }
}

async fn reconnect_loop(context: Arc<SyncContext>, mut stop: watch::Receiver<bool>) {
    // Changes reported while a reconnect is handled stay buffered, so a flap
    // during the settle delay is seen as a fresh edge afterwards.
    let mut changes = context.observer().changes();
    let mut was_online = context.observer().is_online();
    context.state().update(|s| s.online = was_online);

    // Dispatches are never cancelled mid-flight, so shutdown waits for this.
    log_outcome("Initial sync", context.sync_now().await);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            received = changes.recv() => {
                let online = match received {
                    Ok(status) => status.is_online(),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Missed {} connectivity change(s)", skipped);
                        was_online = false;
                        context.observer().is_online()
                    }
                    Err(RecvError::Closed) => break,
                };
                context.state().update(|s| s.online = online);
                let came_online = online && !was_online;
                was_online = online;

                if came_online && on_reconnect(&context, &mut stop).await {
                    break;
                }
            }
        }
    }
}

/// Drains after a settle delay, then refreshes the active scope.
///
/// Returns true if a stop was requested.
async fn on_reconnect(context: &SyncContext, stop: &mut watch::Receiver<bool>) -> bool {
    match context.pending_count().await {
        Ok(0) => return false,
        Ok(pending) => tracing::info!("Back online with {} pending change(s)", pending),
        Err(e) => {
            tracing::error!("Failed to read sync queue: {}", e);
            return false;
        }
    }

    if sleep_or_stop(stop, context.settings().settle_delay).await {
        return true;
    }

    let outcome = context.sync_now().await;
    let drained = matches!(outcome, Ok(DrainOutcome::Completed(_)));
    log_outcome("Reconnect sync", outcome);
    if !drained {
        return false;
    }

    refresh_with_retries(context, stop).await
}

async fn refresh_with_retries(context: &SyncContext, stop: &mut watch::Receiver<bool>) -> bool {
    let attempts = context.settings().refresh_retries + 1;
    for attempt in 1..=attempts {
        match context.refresh_scope().await {
            Ok(count) => {
                tracing::info!("Refreshed {} record(s) from server", count);
                return false;
            }
            Err(EngineError::NoScope) => return false,
            Err(e) => {
                tracing::warn!("Refresh attempt {}/{} failed: {}", attempt, attempts, e);
                if attempt < attempts
                    && sleep_or_stop(stop, context.settings().refresh_retry_delay).await
                {
                    return true;
                }
            }
        }
    }
    false
}

async fn periodic_loop(context: Arc<SyncContext>, mut stop: watch::Receiver<bool>) {
    let period = context.settings().periodic_interval.max(MIN_PERIOD);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                if should_drain_periodically(&context).await {
                    log_outcome("Periodic sync", context.sync_now().await);
                }
            }
        }
    }
}

async fn should_drain_periodically(context: &SyncContext) -> bool {
    if !context.observer().is_online() || context.worker().is_in_flight() {
        return false;
    }
    if let Some(elapsed) = context.worker().since_last_attempt() {
        if elapsed < context.settings().min_spacing {
            tracing::debug!("Periodic sync skipped: last attempt {:?} ago", elapsed);
            return false;
        }
    }
    matches!(context.pending_count().await, Ok(n) if n > 0)
}

fn log_outcome(label: &str, outcome: Result<DrainOutcome, EngineError>) {
    match outcome {
        Ok(DrainOutcome::Completed(report)) => tracing::debug!(
            "{}: {} of {} change(s) delivered",
            label,
            report.succeeded,
            report.attempted
        ),
        Ok(DrainOutcome::Skipped { reason }) => tracing::info!("{} skipped: {}", label, reason),
        Err(e) => tracing::error!("{} failed: {}", label, e),
    }
}
