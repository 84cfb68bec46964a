//! DNS-over-HTTPS adapters.
//!
//! Two content types are spoken: the RFC 8484 wire format and the JSON
//! variant popularized by Google/Cloudflare. A host configured with the
//! `doh://` scheme flips a coin per exchange.

pub mod ietf;
pub mod json;

use crate::bootstrap::BootstrapResolver;
use dnsteer_domain::{DohFlavor, ForwardError, TlsConfig};
use hickory_proto::op::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const MIME_JSON: &str = "application/json";
pub const MIME_DNS_JSON: &str = "application/dns-json";
pub const MIME_DNS_MESSAGE: &str = "application/dns-message";
pub const MIME_DNS_UDP_WIRE: &str = "application/dns-udpwireformat";

/// Every media type we can consume, for the wire request's Accept header.
pub const HEADER_ACCEPT: &str =
    "application/dns-message, application/dns-json, application/dns-udpwireformat, application/json";

const USER_AGENT: &str = concat!("dnsteer/", env!("CARGO_PKG_VERSION"));

const CONNECT_TIMEOUT: Duration = Duration::from_secs(8);
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_IDLE_PER_HOST: usize = 5;

/// A DoH upstream endpoint with its long-lived HTTP client.
pub struct DohClient {
    url: Arc<str>,
    flavor: DohFlavor,
    http: reqwest::Client,
}

impl DohClient {
    pub fn new(
        url: Arc<str>,
        flavor: DohFlavor,
        tls: Option<&TlsConfig>,
        bootstrap: &[SocketAddr],
        no_ipv6: bool,
    ) -> Result<Self, ForwardError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT);

        builder = match tls {
            Some(tls_config) => {
                let config = crate::transport::tls::build_client_config(Some(tls_config))?;
                builder.use_preconfigured_tls(rustls::ClientConfig::clone(&config))
            }
            None => builder.use_rustls_tls(),
        };

        if no_ipv6 {
            builder = builder.local_address(Some(std::net::Ipv4Addr::UNSPECIFIED.into()));
        }
        if !bootstrap.is_empty() {
            builder = builder.dns_resolver(BootstrapResolver::new(bootstrap, no_ipv6)?);
        }

        let http = builder
            .build()
            .map_err(|e| ForwardError::Config(format!("doh client for {}: {}", url, e)))?;

        Ok(Self { url, flavor, http })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn exchange(&self, req: &Message) -> Result<Message, ForwardError> {
        let flavor = match self.flavor {
            DohFlavor::Any => {
                if fastrand::bool() {
                    DohFlavor::Wire
                } else {
                    DohFlavor::Json
                }
            }
            fixed => fixed,
        };
        debug!(url = %self.url, flavor = ?flavor, "doh exchange");

        match flavor {
            DohFlavor::Wire => ietf::exchange(&self.http, &self.url, req).await,
            DohFlavor::Json => json::exchange(&self.http, &self.url, req).await,
            DohFlavor::Any => unreachable!("flavor resolved above"),
        }
    }
}
