//! Host selection policies.

use super::host::UpstreamHost;
use dnsteer_domain::SelectionPolicy;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::warn;

pub enum Policy {
    /// Uniform over non-down hosts, via a reservoir pick so a single pass
    /// never favors a down host.
    Random,
    RoundRobin(AtomicU32),
    /// First non-down host in declaration order.
    Sequential,
}

impl From<SelectionPolicy> for Policy {
    fn from(policy: SelectionPolicy) -> Self {
        match policy {
            SelectionPolicy::Random => Self::Random,
            SelectionPolicy::RoundRobin => Self::RoundRobin(AtomicU32::new(0)),
            SelectionPolicy::Sequential => Self::Sequential,
        }
    }
}

impl Policy {
    /// Returns `None` when every host is down, leaving the spray fallback
    /// to the pool.
    pub fn select(&self, pool: &[Arc<UpstreamHost>]) -> Option<Arc<UpstreamHost>> {
        match self {
            Self::Random => {
                let mut picked: Option<&Arc<UpstreamHost>> = None;
                let mut count = 0usize;
                for host in pool {
                    if host.is_down() {
                        continue;
                    }
                    count += 1;
                    if fastrand::usize(..count) == 0 {
                        picked = Some(host);
                    }
                }
                picked.cloned()
            }
            Self::RoundRobin(robin) => {
                let len = pool.len() as u32;
                let selection = robin.fetch_add(1, Ordering::Relaxed).wrapping_add(1) % len;
                let mut host = &pool[selection as usize];
                let mut step = 1;
                while host.is_down() && step < len {
                    host = &pool[((selection + step) % len) as usize];
                    step += 1;
                }
                if host.is_down() {
                    return None;
                }
                Some(Arc::clone(host))
            }
            Self::Sequential => pool.iter().find(|host| !host.is_down()).cloned(),
        }
    }
}

/// Last-ditch pick over all hosts regardless of liveness, so that some
/// traffic still flows when health checking has marked everything down.
pub fn spray(pool: &[Arc<UpstreamHost>]) -> Arc<UpstreamHost> {
    let host = &pool[fastrand::usize(..pool.len())];
    warn!(host = %host.name(), "all hosts reported down, spraying");
    Arc::clone(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use crate::transport::{Transport, TransportSettings};
    use std::collections::HashSet;
    use std::time::Duration;

    fn pool(n: usize) -> Vec<Arc<UpstreamHost>> {
        (0..n)
            .map(|i| {
                let endpoint = format!("dns://10.0.0.{}:53", i + 1).parse().unwrap();
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
                    1,
                    Arc::new(NoopMetrics),
                ))
            })
            .collect()
    }

    #[test]
    fn round_robin_covers_all_hosts() {
        let hosts = pool(3);
        let policy = Policy::from(SelectionPolicy::RoundRobin);

        let mut seen = HashSet::new();
        let mut counts = [0usize; 3];
        for _ in 0..9 {
            let host = policy.select(&hosts).unwrap();
            let idx = hosts.iter().position(|h| Arc::ptr_eq(h, &host)).unwrap();
            counts[idx] += 1;
            seen.insert(idx);
        }
        assert_eq!(seen.len(), 3);
        // 9 selections over 3 hosts: each contacted at least floor(9/3).
        assert!(counts.iter().all(|&c| c >= 3));
    }

    #[test]
    fn round_robin_skips_down_hosts() {
        let hosts = pool(3);
        hosts[1].add_fail();
        let policy = Policy::from(SelectionPolicy::RoundRobin);

        for _ in 0..6 {
            let host = policy.select(&hosts).unwrap();
            assert!(!Arc::ptr_eq(&host, &hosts[1]));
        }
    }

    #[test]
    fn sequential_prefers_declaration_order() {
        let hosts = pool(3);
        let policy = Policy::from(SelectionPolicy::Sequential);
        assert!(Arc::ptr_eq(&policy.select(&hosts).unwrap(), &hosts[0]));

        hosts[0].add_fail();
        assert!(Arc::ptr_eq(&policy.select(&hosts).unwrap(), &hosts[1]));
    }

    #[test]
    fn policies_return_none_when_all_down() {
        let hosts = pool(2);
        hosts[0].add_fail();
        hosts[1].add_fail();

        for policy in [
            Policy::Random,
            Policy::from(SelectionPolicy::RoundRobin),
            Policy::Sequential,
        ] {
            assert!(policy.select(&hosts).is_none());
        }
    }

    #[test]
    fn random_only_picks_up_hosts() {
        let hosts = pool(4);
        hosts[2].add_fail();
        let policy = Policy::Random;

        for _ in 0..50 {
            let host = policy.select(&hosts).unwrap();
            assert!(!Arc::ptr_eq(&host, &hosts[2]));
        }
    }

    #[test]
    fn spray_picks_even_when_down() {
        let hosts = pool(2);
        hosts[0].add_fail();
        hosts[1].add_fail();
        let host = spray(&hosts);
        assert!(hosts.iter().any(|h| Arc::ptr_eq(h, &host)));
    }
}
