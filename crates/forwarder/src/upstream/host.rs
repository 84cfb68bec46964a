//! A single upstream resolver endpoint.

use crate::doh::DohClient;
use crate::metrics::MetricsSink;
use crate::request::RequestState;
use crate::transport::{is_remote_close, PersistConn, Transport};
use dnsteer_domain::{Endpoint, ForwardError, WireKind};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Read and write deadlines for one exchange leg.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Health probes get a more generous budget than exchange legs.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub type DownPredicate = Box<dyn Fn(&UpstreamHost) -> bool + Send + Sync>;

pub struct UpstreamHost {
    endpoint: Endpoint,
    label: String,
    fails: AtomicI32,
    max_fails: i32,
    transport: Transport,
    doh: Option<DohClient>,
    down_predicate: Option<DownPredicate>,
    metrics: Arc<dyn MetricsSink>,
}

impl UpstreamHost {
    pub fn new(
        endpoint: Endpoint,
        transport: Transport,
        doh: Option<DohClient>,
        max_fails: i32,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let label = endpoint.to_string();
        Self {
            endpoint,
            label,
            fails: AtomicI32::new(0),
            max_fails,
            transport,
            doh,
            down_predicate: None,
            metrics,
        }
    }

    /// Replaces the default liveness rule (`fails >= max_fails` with
    /// `max_fails > 0`).
    pub fn with_down_predicate(mut self, predicate: DownPredicate) -> Self {
        self.down_predicate = Some(predicate);
        self
    }

    pub fn name(&self) -> &str {
        &self.label
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn fails(&self) -> i32 {
        self.fails.load(Ordering::Acquire)
    }

    pub fn max_fails(&self) -> i32 {
        self.max_fails
    }

    pub fn add_fail(&self) -> i32 {
        self.fails.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Saturating decrement: the counter never goes below zero even when
    /// scheduled decrements race with a probe reset.
    pub fn dec_fail(&self) {
        let _ = self
            .fails
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
                (f > 0).then(|| f - 1)
            });
    }

    pub fn is_down(&self) -> bool {
        let down = match &self.down_predicate {
            Some(predicate) => predicate(self),
            None => self.max_fails > 0 && self.fails() >= self.max_fails,
        };
        if down {
            debug!(host = %self.label, fails = self.fails(), "host considered down");
        }
        down
    }

    pub fn start(&self) {
        self.transport.start();
    }

    pub async fn stop(&self) {
        self.transport.stop().await;
    }

    /// Sends one user query to this host and returns its reply.
    pub async fn exchange(&self, state: &RequestState) -> Result<Message, ForwardError> {
        if let Some(doh) = &self.doh {
            return doh.exchange(state.msg()).await;
        }

        let addr = self.socket_addr()?;
        let (pc, cached) = self
            .transport
            .acquire(addr, state.client_protocol().wire_kind())
            .await?;
        if cached {
            debug!(host = %self.label, "cached connection used");
        }

        self.exchange_on_conn(pc, cached, addr, state).await
    }

    async fn exchange_on_conn(
        &self,
        mut pc: PersistConn,
        cached: bool,
        addr: SocketAddr,
        state: &RequestState,
    ) -> Result<Message, ForwardError> {
        let req_bytes = crate::request::serialize_message(state.msg())?;

        match tokio::time::timeout(EXCHANGE_TIMEOUT, pc.conn.send_msg(&req_bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // Dropping the connection closes it.
                drop(pc);
                if cached && is_remote_close(&e) {
                    return Err(ForwardError::CachedConnClosed);
                }
                return Err(ForwardError::transport(addr.to_string(), e));
            }
            Err(_) => {
                drop(pc);
                return Err(ForwardError::transport(addr.to_string(), "write deadline exceeded"));
            }
        }

        let udp_size = state.udp_size();
        let reply_bytes = match tokio::time::timeout(EXCHANGE_TIMEOUT, pc.conn.recv_msg(udp_size)).await
        {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                drop(pc);
                if cached && is_remote_close(&e) {
                    return Err(ForwardError::CachedConnClosed);
                }
                return Err(ForwardError::transport(addr.to_string(), e));
            }
            Err(_) => {
                drop(pc);
                return Err(ForwardError::transport(addr.to_string(), "read deadline exceeded"));
            }
        };

        let reply = match Message::from_vec(&reply_bytes) {
            Ok(reply) => reply,
            Err(e) => {
                drop(pc);
                return Err(ForwardError::transport(addr.to_string(), e));
            }
        };

        if reply.id() != state.id() {
            // No reordering tolerance: drop the connection and fail this
            // host so the dispatcher has time to try another one.
            drop(pc);
            return Err(ForwardError::OutOfOrder {
                server: self.label.clone(),
                expected: state.id(),
                got: reply.id(),
            });
        }

        self.transport.yield_conn(pc).await;
        Ok(reply)
    }

    fn socket_addr(&self) -> Result<SocketAddr, ForwardError> {
        self.endpoint
            .socket_addr()
            .ok_or_else(|| ForwardError::Config(format!("{} has no socket address", self.label)))
    }

    /// Health probe: `. IN NS` at the probe timeout. An error bumps the
    /// failure counter, success resets it.
    pub async fn check(&self) -> Result<(), ForwardError> {
        match tokio::time::timeout(PROBE_TIMEOUT, self.probe()).await {
            Ok(Ok(())) => {
                self.fails.store(0, Ordering::Release);
                Ok(())
            }
            Ok(Err(e)) => {
                self.fails.fetch_add(1, Ordering::AcqRel);
                self.metrics.health_check_failure(&self.label);
                warn!(host = %self.label, error = %e, "health check failed");
                Err(e)
            }
            Err(_) => {
                self.fails.fetch_add(1, Ordering::AcqRel);
                self.metrics.health_check_failure(&self.label);
                warn!(host = %self.label, "health check timed out");
                Err(ForwardError::transport(self.label.clone(), "probe timeout"))
            }
        }
    }

    async fn probe(&self) -> Result<(), ForwardError> {
        let mut query = Query::new();
        query.set_name(Name::root());
        query.set_query_type(RecordType::NS);
        query.set_query_class(DNSClass::IN);

        let mut ping = Message::new();
        ping.set_id(fastrand::u16(..));
        ping.set_message_type(MessageType::Query);
        ping.set_op_code(OpCode::Query);
        ping.set_recursion_desired(self.transport.recursion_desired());
        ping.add_query(query);

        if let Some(doh) = &self.doh {
            doh.exchange(&ping).await?;
            return Ok(());
        }

        let addr = self.socket_addr()?;
        let kind = self.transport.wire_kind_for(WireKind::Udp);
        let mut pc = self.transport.dial_fresh(addr, kind).await?;

        let ping_bytes = crate::request::serialize_message(&ping)?;
        pc.conn
            .send_msg(&ping_bytes)
            .await
            .map_err(|e| ForwardError::transport(addr.to_string(), e))?;
        let reply_bytes = pc
            .conn
            .recv_msg(crate::request::MIN_MSG_SIZE)
            .await
            .map_err(|e| ForwardError::transport(addr.to_string(), e))?;

        // Anything that reads back at all means the host is reachable, even
        // when the payload is odd.
        if Message::from_vec(&reply_bytes).is_err() {
            warn!(host = %self.label, "probe got a malformed but present response");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use crate::transport::TransportSettings;

    fn host(max_fails: i32) -> UpstreamHost {
        let endpoint: Endpoint = "dns://127.0.0.1:53".parse().unwrap();
        let settings = TransportSettings {
            expire: Duration::from_secs(15),
            recursion_desired: true,
            force_tcp: false,
            prefer_udp: true,
            no_ipv6: false,
            tls: None,
        };
        UpstreamHost::new(
            endpoint,
            Transport::new(settings),
            None,
            max_fails,
            Arc::new(NoopMetrics),
        )
    }

    #[test]
    fn default_down_rule() {
        let h = host(2);
        assert!(!h.is_down());
        h.add_fail();
        assert!(!h.is_down());
        h.add_fail();
        assert!(h.is_down());
    }

    #[test]
    fn zero_max_fails_never_down() {
        let h = host(0);
        for _ in 0..10 {
            h.add_fail();
        }
        assert!(!h.is_down());
    }

    #[test]
    fn dec_fail_saturates_at_zero() {
        let h = host(3);
        h.add_fail();
        h.dec_fail();
        h.dec_fail();
        h.dec_fail();
        assert_eq!(h.fails(), 0);
    }

    #[test]
    fn custom_down_predicate_wins() {
        let h = host(1).with_down_predicate(Box::new(|_| false));
        h.add_fail();
        h.add_fail();
        assert!(!h.is_down());
    }
}
