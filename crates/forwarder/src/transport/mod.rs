//! Per-host connection management.
//!
//! Each upstream host owns a [`Transport`]: a set of idle-connection
//! buckets (one per wire protocol) managed by a single actor task, plus the
//! dialing logic for cache misses. All bucket state is owned by the actor
//! loop; other tasks talk to it over the dial/yield channels and never
//! touch a bucket directly.

pub mod conn;
pub mod tls;

pub use conn::{is_remote_close, DnsConn, PersistConn};

use dnsteer_domain::{ForwardError, WireKind};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// Bounds for the adaptive dial timeout.
const MIN_DIAL_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Returning a connection is an optimization; blocking the query path on a
/// busy manager is worse than losing a cached socket.
const YIELD_TIMEOUT: Duration = Duration::from_millis(25);

struct DialRequest {
    kind: WireKind,
    reply: oneshot::Sender<Option<PersistConn>>,
}

#[derive(Clone)]
pub struct TlsContext {
    pub config: Arc<rustls::ClientConfig>,
    pub server_name: ServerName<'static>,
}

/// Settings shared by all hosts of a zone; each host gets its own copy.
#[derive(Clone)]
pub struct TransportSettings {
    pub expire: Duration,
    pub recursion_desired: bool,
    pub force_tcp: bool,
    pub prefer_udp: bool,
    pub no_ipv6: bool,
    pub tls: Option<TlsContext>,
}

pub struct Transport {
    settings: TransportSettings,
    /// Cumulative moving average of observed dial time, in microseconds.
    avg_dial_micros: AtomicU64,
    dial_tx: mpsc::Sender<DialRequest>,
    yield_tx: mpsc::Sender<PersistConn>,
    stop_tx: watch::Sender<bool>,
    inbox: Mutex<Option<(mpsc::Receiver<DialRequest>, mpsc::Receiver<PersistConn>)>>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(settings: TransportSettings) -> Self {
        let (dial_tx, dial_rx) = mpsc::channel(1);
        let (yield_tx, yield_rx) = mpsc::channel(1);
        let (stop_tx, _) = watch::channel(false);
        Self {
            settings,
            avg_dial_micros: AtomicU64::new(0),
            dial_tx,
            yield_tx,
            stop_tx,
            inbox: Mutex::new(Some((dial_rx, yield_rx))),
            manager: Mutex::new(None),
        }
    }

    pub fn recursion_desired(&self) -> bool {
        self.settings.recursion_desired
    }

    /// Protocol promotion: TLS wins, then forced TCP, then preferred UDP,
    /// and only then the client's own protocol.
    pub fn wire_kind_for(&self, client: WireKind) -> WireKind {
        if self.settings.tls.is_some() {
            WireKind::Tls
        } else if self.settings.force_tcp {
            WireKind::Tcp
        } else if self.settings.prefer_udp {
            WireKind::Udp
        } else {
            client
        }
    }

    /// Starts the connection manager actor.
    pub fn start(&self) {
        let Some((dial_rx, yield_rx)) = self
            .inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };

        let expire = self.settings.expire;
        let stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(conn_manager(expire, dial_rx, yield_rx, stop_rx));
        *self.manager.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.manager.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Acquires a connection for `kind`: a cached one when the manager has
    /// a fresh entry, a newly dialed one otherwise. The boolean is true for
    /// cache hits.
    pub async fn acquire(
        &self,
        addr: SocketAddr,
        client: WireKind,
    ) -> Result<(PersistConn, bool), ForwardError> {
        let kind = self.wire_kind_for(client);

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = DialRequest {
            kind,
            reply: reply_tx,
        };
        if self.dial_tx.send(request).await.is_ok() {
            if let Ok(Some(pc)) = reply_rx.await {
                return Ok((pc, true));
            }
        }

        let pc = self.dial_new(addr, kind).await?;
        Ok((pc, false))
    }

    /// Returns a connection for reuse. Strictly non-blocking: when the
    /// manager cannot take it within the yield timeout, the connection is
    /// dropped instead.
    pub async fn yield_conn(&self, mut pc: PersistConn) {
        pc.used = Instant::now();
        if let Err(e) = self.yield_tx.send_timeout(pc, YIELD_TIMEOUT).await {
            debug!(error = %e, "yield timed out, dropping connection");
        }
    }

    /// Dials outside the cache; health probes use their own connections.
    pub async fn dial_fresh(
        &self,
        addr: SocketAddr,
        kind: WireKind,
    ) -> Result<PersistConn, ForwardError> {
        self.dial_new(addr, kind).await
    }

    fn dial_timeout(&self) -> Duration {
        let avg = Duration::from_micros(self.avg_dial_micros.load(Ordering::Relaxed));
        (avg * 2).clamp(MIN_DIAL_TIMEOUT, MAX_DIAL_TIMEOUT)
    }

    fn observe_dial(&self, elapsed: Duration) {
        let observed = elapsed.as_micros() as u64;
        // Cumulative moving average with weight 1/4.
        let _ = self
            .avg_dial_micros
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |avg| {
                Some(avg - avg / 4 + observed / 4)
            });
    }

    async fn dial_new(&self, addr: SocketAddr, kind: WireKind) -> Result<PersistConn, ForwardError> {
        if self.settings.no_ipv6 && addr.is_ipv6() {
            return Err(ForwardError::transport(
                addr.to_string(),
                "IPv6 dialing disabled",
            ));
        }

        let timeout = self.dial_timeout();
        let started = Instant::now();
        let conn = tokio::time::timeout(timeout, self.dial_conn(addr, kind))
            .await
            .map_err(|_| {
                ForwardError::transport(addr.to_string(), format!("dial timeout after {:?}", timeout))
            })??;
        self.observe_dial(started.elapsed());

        debug!(server = %addr, proto = kind.name(), "new connection established");
        Ok(PersistConn::new(conn))
    }

    async fn dial_conn(&self, addr: SocketAddr, kind: WireKind) -> Result<DnsConn, ForwardError> {
        match kind {
            WireKind::Udp => {
                let bind: SocketAddr = if addr.is_ipv4() {
                    (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
                } else {
                    (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = UdpSocket::bind(bind)
                    .await
                    .map_err(|e| ForwardError::transport(addr.to_string(), e))?;
                socket
                    .connect(addr)
                    .await
                    .map_err(|e| ForwardError::transport(addr.to_string(), e))?;
                Ok(DnsConn::Udp(socket))
            }
            WireKind::Tcp => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| ForwardError::transport(addr.to_string(), e))?;
                Ok(DnsConn::Tcp(stream))
            }
            WireKind::Tls => {
                let tls = self.settings.tls.as_ref().ok_or_else(|| {
                    ForwardError::Config(format!("no TLS material for tls upstream {}", addr))
                })?;
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| ForwardError::transport(addr.to_string(), e))?;
                let connector = tokio_rustls::TlsConnector::from(Arc::clone(&tls.config));
                let stream = connector
                    .connect(tls.server_name.clone(), stream)
                    .await
                    .map_err(|e| ForwardError::transport(addr.to_string(), e))?;
                Ok(DnsConn::Tls(Box::new(stream)))
            }
        }
    }
}

/// The owner loop: all bucket mutation happens here, one event at a time.
async fn conn_manager(
    expire: Duration,
    mut dial_rx: mpsc::Receiver<DialRequest>,
    mut yield_rx: mpsc::Receiver<PersistConn>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut buckets: [Vec<PersistConn>; WireKind::COUNT] = Default::default();
    let pooling = !expire.is_zero();
    let tick_period = if pooling {
        expire
    } else {
        Duration::from_secs(3600)
    };
    let mut ticker = tokio::time::interval(tick_period);
    ticker.tick().await;

    loop {
        tokio::select! {
            request = dial_rx.recv() => {
                let Some(DialRequest { kind, reply }) = request else { break };
                let _ = reply.send(take_fresh(&mut buckets[kind.index()], expire));
            }

            yielded = yield_rx.recv() => {
                let Some(pc) = yielded else { break };
                if pooling {
                    buckets[pc.conn.kind().index()].push(pc);
                }
                // Without pooling the connection is simply dropped.
            }

            _ = ticker.tick() => {
                if pooling {
                    sweep(&mut buckets, expire);
                }
            }

            _ = stop_rx.changed() => break,
        }
    }

    for bucket in &mut buckets {
        close_conns(std::mem::take(bucket));
    }
}

/// Pops the most recently used connection when it is still fresh. A stale
/// top entry means the whole bucket is stale (entries are in non-decreasing
/// `used` order), so the bucket is emptied wholesale.
fn take_fresh(bucket: &mut Vec<PersistConn>, expire: Duration) -> Option<PersistConn> {
    let last = bucket.last()?;
    if !expire.is_zero() && last.used.elapsed() < expire {
        return bucket.pop();
    }
    close_conns(std::mem::take(bucket));
    None
}

fn sweep(buckets: &mut [Vec<PersistConn>; WireKind::COUNT], expire: Duration) {
    for bucket in buckets.iter_mut() {
        let Some(first) = bucket.first() else { continue };
        if first.used.elapsed() < expire {
            continue;
        }
        // Entries are sorted by `used`; find the first still-fresh one.
        let stale = bucket.partition_point(|pc| pc.used.elapsed() >= expire);
        debug!(count = stale, "closing expired connections");
        close_conns(bucket.drain(..stale).collect());
    }
}

/// Closing may flush TLS shutdown frames; keep it off the manager loop.
fn close_conns(conns: Vec<PersistConn>) {
    if conns.is_empty() {
        return;
    }
    tokio::spawn(async move {
        drop(conns);
    });
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Ok(Some(handle)) = self.manager.lock().map(|mut m| m.take()) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings(expire: Duration) -> TransportSettings {
        TransportSettings {
            expire,
            recursion_desired: true,
            force_tcp: false,
            prefer_udp: true,
            no_ipv6: false,
            tls: None,
        }
    }

    #[test]
    fn promotion_order() {
        let mut settings = test_settings(Duration::from_secs(15));
        let t = Transport::new(settings.clone());
        assert_eq!(t.wire_kind_for(WireKind::Tcp), WireKind::Udp);

        settings.prefer_udp = false;
        settings.force_tcp = true;
        let t = Transport::new(settings);
        assert_eq!(t.wire_kind_for(WireKind::Udp), WireKind::Tcp);
    }

    #[test]
    fn dial_timeout_is_clamped() {
        let t = Transport::new(test_settings(Duration::from_secs(15)));
        assert_eq!(t.dial_timeout(), MIN_DIAL_TIMEOUT);

        t.avg_dial_micros.store(10_000_000, Ordering::Relaxed);
        assert_eq!(t.dial_timeout(), MAX_DIAL_TIMEOUT);

        t.avg_dial_micros.store(1_500_000, Ordering::Relaxed);
        assert_eq!(t.dial_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn moving_average_converges() {
        let t = Transport::new(test_settings(Duration::from_secs(15)));
        for _ in 0..32 {
            t.observe_dial(Duration::from_millis(100));
        }
        let avg = t.avg_dial_micros.load(Ordering::Relaxed);
        assert!((75_000..=100_000).contains(&avg), "avg was {}", avg);
    }

    #[tokio::test]
    async fn yield_then_dial_returns_cached_conn() {
        let t = Transport::new(test_settings(Duration::from_secs(15)));
        t.start();

        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        t.yield_conn(PersistConn::new(DnsConn::Udp(sock))).await;
        // Let the manager drain the yield before the dial request races it.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (reply_tx, reply_rx) = oneshot::channel();
        t.dial_tx
            .send(DialRequest {
                kind: WireKind::Udp,
                reply: reply_tx,
            })
            .await
            .unwrap();
        let cached = reply_rx.await.unwrap();
        assert!(cached.is_some());

        t.stop().await;
    }

    #[tokio::test]
    async fn expired_conns_are_not_returned() {
        let t = Transport::new(test_settings(Duration::from_millis(50)));
        t.start();

        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        t.yield_conn(PersistConn::new(DnsConn::Udp(sock))).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let (reply_tx, reply_rx) = oneshot::channel();
        t.dial_tx
            .send(DialRequest {
                kind: WireKind::Udp,
                reply: reply_tx,
            })
            .await
            .unwrap();
        assert!(reply_rx.await.unwrap().is_none());

        t.stop().await;
    }
}
