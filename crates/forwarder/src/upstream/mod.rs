//! Upstream host pools and selection.

pub mod health;
pub mod host;
pub mod policy;

pub use health::{on_exchange_failure, HealthChecker};
pub use host::UpstreamHost;
pub use policy::Policy;

use crate::metrics::MetricsSink;
use std::sync::Arc;
use tracing::debug;

/// The hosts of one zone plus its selection behavior.
pub struct HostPool {
    hosts: Vec<Arc<UpstreamHost>>,
    policy: Policy,
    spray: bool,
    label: String,
    metrics: Arc<dyn MetricsSink>,
}

impl HostPool {
    pub fn new(
        hosts: Vec<Arc<UpstreamHost>>,
        policy: Policy,
        spray: bool,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let label = hosts
            .iter()
            .map(|h| h.name())
            .collect::<Vec<_>>()
            .join(",");
        Self {
            hosts,
            policy,
            spray,
            label,
            metrics,
        }
    }

    pub fn hosts(&self) -> &[Arc<UpstreamHost>] {
        &self.hosts
    }

    /// Picks a host for the next exchange, or `None` when nothing is
    /// usable.
    pub fn select(&self) -> Option<Arc<UpstreamHost>> {
        if self.hosts.len() == 1 {
            let host = &self.hosts[0];
            if host.is_down() && !self.spray {
                self.metrics.health_check_all_down(&self.label);
                return None;
            }
            return Some(Arc::clone(host));
        }

        if self.hosts.iter().all(|h| h.is_down()) {
            self.metrics.health_check_all_down(&self.label);
            if !self.spray {
                return None;
            }
            return Some(policy::spray(&self.hosts));
        }

        if let Some(host) = self.policy.select(&self.hosts) {
            debug!(host = %host.name(), "host selected");
            return Some(host);
        }

        if self.spray {
            return Some(policy::spray(&self.hosts));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use crate::transport::{Transport, TransportSettings};
    use dnsteer_domain::SelectionPolicy;
    use std::time::Duration;

    fn hosts(n: usize, max_fails: i32) -> Vec<Arc<UpstreamHost>> {
        (0..n)
            .map(|i| {
                let endpoint = format!("dns://10.1.0.{}:53", i + 1).parse().unwrap();
                let settings = TransportSettings {
                    expire: Duration::from_secs(15),
                    recursion_desired: true,
                    force_tcp: false,
                    prefer_udp: true,
                    no_ipv6: false,
                    tls: None,
                };
                Arc::new(UpstreamHost::new(
                    endpoint,
                    Transport::new(settings),
                    None,
                    max_fails,
                    Arc::new(NoopMetrics),
                ))
            })
            .collect()
    }

    fn pool(hosts: Vec<Arc<UpstreamHost>>, spray: bool) -> HostPool {
        HostPool::new(
            hosts,
            Policy::from(SelectionPolicy::Sequential),
            spray,
            Arc::new(NoopMetrics),
        )
    }

    #[test]
    fn single_host_returned_even_without_health() {
        let p = pool(hosts(1, 1), false);
        assert!(p.select().is_some());
    }

    #[test]
    fn single_down_host_without_spray_yields_none() {
        let hs = hosts(1, 1);
        hs[0].add_fail();
        let p = pool(hs, false);
        assert!(p.select().is_none());
    }

    #[test]
    fn single_down_host_with_spray_is_still_used() {
        let hs = hosts(1, 1);
        hs[0].add_fail();
        let p = pool(hs, true);
        assert!(p.select().is_some());
    }

    #[test]
    fn all_down_spray_fallback() {
        let hs = hosts(3, 1);
        for h in &hs {
            h.add_fail();
        }
        let without_spray = pool(hs.clone(), false);
        assert!(without_spray.select().is_none());

        let with_spray = pool(hs, true);
        assert!(with_spray.select().is_some());
    }

    #[test]
    fn healthy_pool_uses_policy() {
        let hs = hosts(3, 1);
        let p = pool(hs.clone(), false);
        let picked = p.select().unwrap();
        assert!(Arc::ptr_eq(&picked, &hs[0]));
    }
}
