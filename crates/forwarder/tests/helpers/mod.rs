//! Mock upstream servers and capture plumbing shared by the integration
//! tests.

use async_trait::async_trait;
use dnsteer_forwarder::{ForwardError, MetricsSink, RequestState, ResponseWriter};
use dnsteer_forwarder::handler::DnsHandler;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::{Name, RData, Record};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

/// Builds a NOERROR reply answering the request with one A record.
pub fn a_reply(request: &Message, ip: Ipv4Addr) -> Message {
    let mut reply = Message::new();
    reply.set_id(request.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(request.op_code());
    reply.set_response_code(ResponseCode::NoError);
    reply.set_recursion_available(true);
    let name = match request.queries().first() {
        Some(q) => {
            reply.add_query(q.clone());
            q.name().clone()
        }
        None => Name::root(),
    };
    reply.add_answer(Record::from_rdata(name, 300, RData::A(ip.into())));
    reply
}

/// Spawns a UDP upstream whose behavior is a function of the request and
/// the zero-based request counter. Returning `None` swallows the request.
pub async fn spawn_udp_upstream<F>(mut behavior: F) -> SocketAddr
where
    F: FnMut(&Message, usize) -> Option<Message> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        let mut count = 0;
        loop {
            let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(request) = Message::from_vec(&buf[..n]) else {
                continue;
            };
            if let Some(reply) = behavior(&request, count) {
                let bytes = dnsteer_forwarder::request::serialize_message(&reply).unwrap();
                let _ = socket.send_to(&bytes, peer).await;
            }
            count += 1;
        }
    });

    addr
}

/// Spawns a TCP upstream that answers one query per connection and then
/// closes it, so a pooled connection goes stale after each exchange.
pub async fn spawn_oneshot_tcp_upstream(ip: Ipv4Addr) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut len_buf = [0u8; 2];
                if stream.read_exact(&mut len_buf).await.is_err() {
                    return;
                }
                let len = u16::from_be_bytes(len_buf) as usize;
                let mut buf = vec![0u8; len];
                if stream.read_exact(&mut buf).await.is_err() {
                    return;
                }
                let Ok(request) = Message::from_vec(&buf) else {
                    return;
                };
                let reply =
                    dnsteer_forwarder::request::serialize_message(&a_reply(&request, ip)).unwrap();
                let _ = stream
                    .write_all(&(reply.len() as u16).to_be_bytes())
                    .await;
                let _ = stream.write_all(&reply).await;
                let _ = stream.flush().await;
                // Linger briefly so the client can yield the connection
                // before we close it.
                tokio::time::sleep(Duration::from_millis(50)).await;
            });
        }
    });

    addr
}

/// Captures everything the dispatcher writes back to the client.
#[derive(Default)]
pub struct CaptureWriter {
    pub replies: Vec<Message>,
}

#[async_trait]
impl ResponseWriter for CaptureWriter {
    async fn write_msg(&mut self, reply: &Message) -> Result<(), ForwardError> {
        self.replies.push(reply.clone());
        Ok(())
    }
}

/// Chain terminator that records delegations.
#[derive(Default)]
pub struct NextCounter {
    pub hits: AtomicUsize,
}

#[async_trait]
impl DnsHandler for NextCounter {
    async fn serve(
        &self,
        _state: &RequestState,
        _writer: &mut dyn ResponseWriter,
    ) -> Result<ResponseCode, ForwardError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        Ok(ResponseCode::NoError)
    }
}

/// Counting metrics sink for assertions.
#[derive(Default)]
pub struct CountingMetrics {
    pub requests: Mutex<Vec<(String, String)>>,
    pub hc_failures: AtomicUsize,
    pub lookups: AtomicUsize,
}

impl MetricsSink for CountingMetrics {
    fn request_count(&self, server: &str, to: &str) {
        self.requests
            .lock()
            .unwrap()
            .push((server.to_string(), to.to_string()));
    }

    fn health_check_failure(&self, _to: &str) {
        self.hc_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn name_lookup_duration(&self, _server: &str, _matched: bool, _elapsed: Duration) {
        self.lookups.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn counting_metrics() -> Arc<CountingMetrics> {
    Arc::new(CountingMetrics::default())
}
