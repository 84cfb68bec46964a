//! A zone: one `from`/`to` binding with everything it owns.

use crate::doh::DohClient;
use crate::firewall::{FirewallHandle, FirewallTables, NoopFilter, PacketFilter};
use crate::matcher::{DomainSet, NameIndex};
use crate::metrics::MetricsSink;
use crate::transport::{tls, Transport, TransportSettings, TlsContext};
use crate::upstream::{HealthChecker, HostPool, Policy, UpstreamHost};
use dnsteer_domain::{Endpoint, ForwardError, ZoneConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Zone {
    match_any: bool,
    name_index: NameIndex,
    inline: DomainSet,
    except: DomainSet,
    pool: HostPool,
    hosts: Vec<Arc<UpstreamHost>>,
    health: HealthChecker,
    check_interval: Duration,
    max_retry: i32,
    bootstrap: Vec<SocketAddr>,
    no_ipv6: bool,
    firewall: Option<FirewallHandle>,
}

impl Zone {
    pub fn from_config(
        config: &ZoneConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ForwardError> {
        Self::build(config, metrics, Arc::new(NoopFilter))
    }

    /// Like [`Zone::from_config`] with a real kernel backend for the
    /// `ipset`/`pf` tables.
    pub fn with_firewall_backend(
        config: &ZoneConfig,
        metrics: Arc<dyn MetricsSink>,
        backend: Arc<dyn PacketFilter>,
    ) -> Result<Self, ForwardError> {
        Self::build(config, metrics, backend)
    }

    fn build(
        config: &ZoneConfig,
        metrics: Arc<dyn MetricsSink>,
        firewall_backend: Arc<dyn PacketFilter>,
    ) -> Result<Self, ForwardError> {
        config.validate()?;

        let match_any = config.match_any();
        let bootstrap = config.bootstrap_addrs()?;

        let mut inline = DomainSet::new();
        for name in &config.inline {
            if !inline.add(name) {
                return Err(ForwardError::InvalidDomainName(name.clone()));
            }
        }
        let mut except = DomainSet::new();
        for name in &config.except {
            if !except.add(name) {
                warn!(name = %name, "except: not a domain name, ignored");
            }
        }

        let (patterns, sources) = if match_any {
            (Vec::new(), Vec::new())
        } else {
            classify_from(&config.from)
        };
        for pattern in &patterns {
            if !inline.add(pattern) {
                return Err(ForwardError::InvalidDomainName(pattern.clone()));
            }
        }
        if !inline.is_empty() {
            info!(inline = %inline, "inline names");
        }

        let name_index = NameIndex::from_sources(
            &sources,
            config.path_reload(),
            config.url_reload(),
            config.url_read_timeout(),
        );

        let tls_config = match (&config.tls, &config.tls_servername) {
            (None, None) => None,
            _ => Some(tls::build_client_config(config.tls.as_ref())?),
        };

        let endpoints = config.endpoints()?;
        let mut hosts = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let host = build_host(endpoint, config, tls_config.as_ref(), &bootstrap, &metrics)?;
            info!(host = %host.name(), "upstream configured");
            hosts.push(Arc::new(host));
        }

        let health = HealthChecker::new(config.health_check(), hosts.clone());
        let pool = HostPool::new(
            hosts.clone(),
            Policy::from(config.policy),
            config.spray,
            Arc::clone(&metrics),
        );

        let tables = FirewallTables::from_config(&config.ipset, &config.pf)?;
        let firewall = if tables.is_empty() {
            None
        } else {
            Some(FirewallHandle::new(tables, firewall_backend))
        };

        Ok(Self {
            match_any,
            name_index,
            inline,
            except,
            pool,
            hosts,
            health,
            check_interval: config.health_check(),
            max_retry: config.max_retry,
            bootstrap,
            no_ipv6: config.no_ipv6,
            firewall,
        })
    }

    /// Whether this zone claims `name`. `name` is lower case without a
    /// trailing dot (except the root).
    pub fn matches(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }

        if self.match_any {
            let ignored = name != "." && self.except.matches(name);
            if ignored {
                debug!(name, "skipped, name is excepted");
            }
            return !ignored;
        }

        if !self.name_index.matches(name) && !self.inline.matches(name) {
            return false;
        }
        if self.except.matches(name) {
            debug!(name, "skipped, name is excepted");
            return false;
        }
        true
    }

    pub fn select(&self) -> Option<Arc<UpstreamHost>> {
        self.pool.select()
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn max_retry(&self) -> i32 {
        self.max_retry
    }

    pub fn firewall(&self) -> Option<&FirewallHandle> {
        self.firewall.as_ref()
    }

    pub fn hosts(&self) -> &[Arc<UpstreamHost>] {
        &self.hosts
    }

    pub async fn start(&self) -> Result<(), ForwardError> {
        self.name_index.start(&self.bootstrap, self.no_ipv6).await?;
        for host in &self.hosts {
            host.start();
        }
        self.health.start();
        if let Some(firewall) = &self.firewall {
            firewall.setup()?;
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ForwardError> {
        self.name_index.stop().await;
        self.health.stop().await;
        for host in &self.hosts {
            host.stop().await;
        }
        if let Some(firewall) = &self.firewall {
            firewall.shutdown()?;
        }
        Ok(())
    }
}

/// Splits `from` entries into inline patterns and reloadable sources. URLs
/// carry a scheme; paths are anything path-shaped; a bare valid domain
/// name is a pattern.
fn classify_from(from: &[String]) -> (Vec<String>, Vec<String>) {
    let mut patterns = Vec::new();
    let mut sources = Vec::new();
    for entry in from {
        if entry.contains("://") {
            sources.push(entry.clone());
        } else if !entry.contains('/')
            && !entry.starts_with('.')
            && !entry.starts_with('~')
            && dnsteer_domain::name::string_to_domain(entry).is_some()
        {
            patterns.push(entry.clone());
        } else {
            if !std::path::Path::new(entry).is_file() {
                warn!(path = %entry, "name list file does not exist");
            }
            sources.push(entry.clone());
        }
    }
    (patterns, sources)
}

fn build_host(
    endpoint: Endpoint,
    config: &ZoneConfig,
    tls_config: Option<&Arc<rustls::ClientConfig>>,
    bootstrap: &[SocketAddr],
    metrics: &Arc<dyn MetricsSink>,
) -> Result<UpstreamHost, ForwardError> {
    let mut doh = None;
    let mut tls_context = None;

    match &endpoint {
        Endpoint::Doh { url, flavor } => {
            doh = Some(DohClient::new(
                Arc::clone(url),
                *flavor,
                config.tls.as_ref(),
                bootstrap,
                config.no_ipv6,
            )?);
        }
        Endpoint::Tls { addr, server_name } => {
            let client_config = match tls_config {
                Some(shared) => Arc::clone(shared),
                None => tls::build_client_config(None)?,
            };
            // The per-endpoint name takes precedence over the zone-wide
            // tls_servername.
            let sni = server_name
                .as_deref()
                .or(config.tls_servername.as_deref());
            tls_context = Some(TlsContext {
                config: client_config,
                server_name: tls::server_name_for(sni, *addr)?,
            });
        }
        Endpoint::Udp { .. } | Endpoint::Tcp { .. } => {}
    }

    let settings = TransportSettings {
        expire: config.expire(),
        recursion_desired: !config.no_rec,
        force_tcp: matches!(endpoint, Endpoint::Tcp { .. }),
        prefer_udp: matches!(endpoint, Endpoint::Udp { .. }),
        no_ipv6: config.no_ipv6,
        tls: tls_context,
    };

    Ok(UpstreamHost::new(
        endpoint,
        Transport::new(settings),
        doh,
        config.max_fails,
        Arc::clone(metrics),
    ))
}
