//! Connectivity tracking.
//!
//! The platform layer pushes link-state events through [`NetworkObserver::report`];
//! consumers read the latest status or subscribe to changes. Because a device
//! can be attached to a network with no working route, sync attempts also run
//! an active HTTP probe ([`NetworkObserver::probe_reachability`]).

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::remote::RemoteError;

/// Point-in-time connectivity as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct NetworkStatus {
    /// A network link is up.
    pub connected: bool,
    /// The platform believes the internet is reachable over that link.
    pub reachable: bool,
}

impl NetworkStatus {
    pub fn online() -> Self {
        Self {
            connected: true,
            reachable: true,
        }
    }

    pub fn offline() -> Self {
        Self::default()
    }

    pub fn is_online(&self) -> bool {
        self.connected && self.reachable
    }
}

/// Active subscription to connectivity changes. Dropping it unsubscribes.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

const CHANGE_CAPACITY: usize = 64;
const MIN_POLL: Duration = Duration::from_millis(100);

pub struct NetworkObserver {
    status: watch::Sender<NetworkStatus>,
    changes: broadcast::Sender<NetworkStatus>,
    client: reqwest::Client,
    probe_urls: Vec<String>,
}

impl NetworkObserver {
    pub fn new(
        initial: NetworkStatus,
        probe_urls: Vec<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let (status, _) = watch::channel(initial);
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            status,
            changes,
            client,
            probe_urls,
        })
    }

    pub fn current_status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current_status().is_online()
    }

    /// Records a connectivity event from the platform.
    ///
    /// Subscribers are only woken when the status actually changes. Returns
    /// whether it did.
    pub fn report(&self, status: NetworkStatus) -> bool {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            // Sent under the watch lock so both channels agree on order
            let _ = self.changes.send(status);
            true
        });
        if changed {
            tracing::info!(
                "Connectivity changed: connected={} reachable={}",
                status.connected,
                status.reachable
            );
        }
        changed
    }

    /// Every reported change in order, for consumers that drive their own loop.
    pub fn changes(&self) -> broadcast::Receiver<NetworkStatus> {
        self.changes.subscribe()
    }

    /// Invokes `callback` once per reported change, in order.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(NetworkStatus) + Send + 'static,
    {
        let mut receiver = self.changes.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(status) => callback(status),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Connectivity subscriber missed {} change(s)", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }

    /// Checks that the API is actually reachable, not just that a link is up.
    pub async fn probe_reachability(&self) -> bool {
        if !self.current_status().connected {
            tracing::debug!("Reachability probe skipped: no network link");
            return false;
        }
        self.probe_urls().await
    }

    /// GETs every probe URL concurrently; any 2xx answer counts.
    async fn probe_urls(&self) -> bool {
        if self.probe_urls.is_empty() {
            return false;
        }

        let checks = self.probe_urls.iter().map(|url| async move {
            match self.client.get(url).send().await {
                Ok(response) => response.status().is_success(),
                Err(e) => {
                    tracing::debug!("Probe of {} failed: {}", url, e);
                    false
                }
            }
        });
        let results = join_all(checks).await;
        let successes = results.iter().filter(|ok| **ok).count();
        tracing::debug!("Probe results: {}/{} successful", successes, results.len());
        successes > 0
    }

    /// Probes the API and reports the result as the link state.
    ///
    /// For hosts without a platform connectivity event source.
    pub async fn refresh(&self) -> NetworkStatus {
        let up = self.probe_urls().await;
        let status = NetworkStatus {
            connected: up,
            reachable: up,
        };
        self.report(status);
        status
    }

    /// Calls [`refresh`](Self::refresh) on a fixed period.
    pub fn spawn_poller(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let observer = Arc::clone(self);
        let every = every.max(MIN_POLL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                observer.refresh().await;
            }
        })
    }
}
