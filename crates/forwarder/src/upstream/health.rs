//! Active and passive health checking.

use super::host::UpstreamHost;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// How long an exchange failure counts against a host before the passive
/// decrement takes it back.
const FAIL_TIMEOUT: Duration = Duration::from_secs(2);

/// Every n-th passive failure also fires an immediate probe.
const FAILURE_CHECK: i32 = 3;

/// One worker per zone that probes every host each tick.
pub struct HealthChecker {
    interval: Duration,
    hosts: Vec<Arc<UpstreamHost>>,
    stop_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HealthChecker {
    pub fn new(interval: Duration, hosts: Vec<Arc<UpstreamHost>>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            interval,
            hosts,
            stop_tx,
            worker: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts the periodic worker; a zero interval disables checking.
    pub fn start(&self) {
        if self.interval.is_zero() {
            return;
        }

        let hosts = self.hosts.clone();
        let interval = self.interval;
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            // The first round fires immediately.
            check_round(&hosts);

            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = ticker.tick() => check_round(&hosts),
                }
            }
        });
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// One probe task per host; rounds never block each other.
fn check_round(hosts: &[Arc<UpstreamHost>]) {
    debug!(hosts = hosts.len(), "health check round");
    for host in hosts {
        let host = Arc::clone(host);
        tokio::spawn(async move {
            let _ = host.check().await;
        });
    }
}

/// Passive health action taken by the dispatcher when an exchange fails:
/// count the failure now, take it back after the fail timeout, and probe on
/// every third one. This bounds the effect of a transient outage while
/// keeping the counter from climbing unbounded.
pub fn on_exchange_failure(host: &Arc<UpstreamHost>, check_interval: Duration) {
    if check_interval.is_zero() || host.max_fails() == 0 {
        return;
    }

    let fails = host.add_fail();
    let host = Arc::clone(host);
    tokio::spawn(async move {
        tokio::time::sleep(FAIL_TIMEOUT).await;
        host.dec_fail();
        if fails % FAILURE_CHECK == 0 {
            let _ = host.check().await;
        }
    });
}
