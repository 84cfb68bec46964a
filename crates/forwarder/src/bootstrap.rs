//! Bootstrap resolution for DoH and name-list URLs.
//!
//! DoH endpoints and https name-list sources are addressed by hostname, and
//! resolving those hostnames through the forwarder itself would be
//! circular. When a zone configures `bootstrap` servers, hostname lookups
//! for its HTTP clients go through one of those servers instead, picked at
//! random per lookup; without bootstrap the system resolver is used.

use dnsteer_domain::ForwardError;
use hickory_proto::xfer::Protocol;
use hickory_resolver::config::{NameServerConfig, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{Resolver, TokioResolver};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

pub struct BootstrapResolver {
    resolvers: Vec<TokioResolver>,
    servers: Vec<SocketAddr>,
    no_ipv6: bool,
}

impl BootstrapResolver {
    pub fn new(servers: &[SocketAddr], no_ipv6: bool) -> Result<Arc<Self>, ForwardError> {
        if servers.is_empty() {
            return Err(ForwardError::Config(
                "bootstrap resolver requires at least one server".into(),
            ));
        }

        let resolvers = servers
            .iter()
            .map(|&addr| {
                let mut config = ResolverConfig::new();
                config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
                Resolver::builder_with_config(config, TokioConnectionProvider::default()).build()
            })
            .collect();

        Ok(Arc::new(Self {
            resolvers,
            servers: servers.to_vec(),
            no_ipv6,
        }))
    }
}

impl Resolve for BootstrapResolver {
    fn resolve(&self, name: Name) -> Resolving {
        // Rotate among bootstrap servers with a random pick per lookup.
        let pick = fastrand::usize(..self.resolvers.len());
        let resolver = self.resolvers[pick].clone();
        let no_ipv6 = self.no_ipv6;
        debug!(host = %name.as_str(), bootstrap = %self.servers[pick], "bootstrap lookup");

        Box::pin(async move {
            let lookup = resolver.lookup_ip(name.as_str()).await?;
            let addrs: Addrs = Box::new(
                lookup
                    .into_iter()
                    .filter(move |ip| !no_ipv6 || ip.is_ipv4())
                    // The port is overwritten by the HTTP client.
                    .map(|ip| SocketAddr::new(ip, 0)),
            );
            Ok(addrs)
        })
    }
}
