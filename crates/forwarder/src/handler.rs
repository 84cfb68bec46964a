//! The plugin handler: match, select, exchange, retry.

use crate::metrics::MetricsSink;
use crate::request::{error_reply, RequestState, ResponseWriter};
use crate::upstream::{on_exchange_failure, UpstreamHost};
use crate::zone::Zone;
use async_trait::async_trait;
use dnsteer_domain::ForwardError;
use hickory_proto::op::{Message, ResponseCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Hard bound on one query's total time in the dispatcher, retries
/// included; the listener is never blocked longer than this.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(15);

/// One handler in the host server's chain.
#[async_trait]
pub trait DnsHandler: Send + Sync {
    /// Handles one query: writes a reply and returns the rcode the host
    /// server should account, or delegates down the chain.
    async fn serve(
        &self,
        state: &RequestState,
        writer: &mut dyn ResponseWriter,
    ) -> Result<ResponseCode, ForwardError>;
}

pub struct Dnsteer {
    zones: Vec<Arc<Zone>>,
    next: Option<Arc<dyn DnsHandler>>,
    metrics: Arc<dyn MetricsSink>,
}

impl Dnsteer {
    pub fn new(
        zones: Vec<Arc<Zone>>,
        next: Option<Arc<dyn DnsHandler>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            zones,
            next,
            metrics,
        }
    }

    pub async fn on_startup(&self) -> Result<(), ForwardError> {
        for zone in &self.zones {
            zone.start().await?;
        }
        Ok(())
    }

    pub async fn on_shutdown(&self) -> Result<(), ForwardError> {
        for zone in &self.zones {
            zone.stop().await?;
        }
        Ok(())
    }

    /// First matching zone wins; unlike longest-suffix schemes the scan
    /// stops at the first hit for throughput.
    fn match_zone(&self, server: &str, name: &str) -> Option<&Arc<Zone>> {
        let started = Instant::now();
        let found = self.zones.iter().find(|zone| zone.matches(name));
        self.metrics
            .name_lookup_duration(server, found.is_some(), started.elapsed());
        found
    }

    /// Exchange against one host, retrying immediately when a cached
    /// connection turns out to be dead. Bounded by the zone's retry cap
    /// and the outer deadline.
    async fn exchange_with_retry(
        &self,
        zone: &Zone,
        host: &Arc<UpstreamHost>,
        state: &RequestState,
        deadline: Instant,
    ) -> Result<Message, ForwardError> {
        let mut retries = 0;
        loop {
            let attempt_started = Instant::now();
            let result = host.exchange(state).await;
            debug!(host = %host.name(), rtt = ?attempt_started.elapsed(), "exchange finished");

            match result {
                Err(ForwardError::CachedConnClosed)
                    if retries < zone.max_retry() && Instant::now() < deadline =>
                {
                    // The peer closed a pooled connection; grab another.
                    debug!(host = %host.name(), retries, "cached connection was closed, retrying");
                    retries += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl DnsHandler for Dnsteer {
    async fn serve(
        &self,
        state: &RequestState,
        writer: &mut dyn ResponseWriter,
    ) -> Result<ResponseCode, ForwardError> {
        let name = state.qname();
        let server = state.server().to_string();

        let Some(zone) = self.match_zone(&server, &name) else {
            debug!(name = %name, "not in any zone, delegating");
            return match &self.next {
                Some(next) => next.serve(state, writer).await,
                None => Err(ForwardError::NoNextHandler),
            };
        };
        debug!(name = %name, "zone matched");

        let deadline = Instant::now() + DISPATCH_TIMEOUT;
        let mut last_err: Option<ForwardError> = None;

        while Instant::now() < deadline {
            let started = Instant::now();

            let Some(host) = zone.select() else {
                debug!("no healthy upstream host");
                return Err(ForwardError::NoHealthyUpstream);
            };

            let reply = match self
                .exchange_with_retry(zone, &host, state, deadline)
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    // An exhausted cached-conn retry is recovered locally;
                    // it says nothing about the host's health.
                    let cached_closed = matches!(e, ForwardError::CachedConnClosed);
                    if !cached_closed && host.max_fails() != 0 {
                        warn!(host = %host.name(), error = %e, "exchange failed");
                        on_exchange_failure(&host, zone.check_interval());
                    }
                    last_err = Some(e);
                    continue;
                }
            };

            if !state.matches_reply(&reply) {
                warn!(
                    host = %host.name(),
                    id = reply.id(),
                    "wrong reply, answering FORMERR"
                );
                let formerr = error_reply(state.msg(), ResponseCode::FormErr);
                writer.write_msg(&formerr).await?;
                return Ok(ResponseCode::NoError);
            }

            writer.write_msg(&reply).await?;
            if let Some(firewall) = zone.firewall() {
                firewall.add_ips(&reply);
            }

            self.metrics
                .request_duration(&server, host.name(), started.elapsed());
            self.metrics.request_count(&server, host.name());
            self.metrics
                .response_rcode(&server, host.name(), &rcode_label(reply.response_code()));
            return Ok(ResponseCode::NoError);
        }

        Err(last_err.unwrap_or(ForwardError::NoHealthyUpstream))
    }
}

fn rcode_label(rcode: ResponseCode) -> String {
    match rcode {
        ResponseCode::NoError => "NOERROR".to_string(),
        ResponseCode::FormErr => "FORMERR".to_string(),
        ResponseCode::ServFail => "SERVFAIL".to_string(),
        ResponseCode::NXDomain => "NXDOMAIN".to_string(),
        ResponseCode::NotImp => "NOTIMP".to_string(),
        ResponseCode::Refused => "REFUSED".to_string(),
        other => format!("{}", u16::from(other)),
    }
}
