//! Per-query request state and the reply channel back to the client.

use async_trait::async_trait;
use dnsteer_domain::name::normalize_query_name;
use dnsteer_domain::{ForwardError, WireKind};
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};

/// Messages below this size are always acceptable over UDP.
pub const MIN_MSG_SIZE: u16 = 512;

/// How the client reached the host server; decides the preferred upstream
/// wire protocol unless the endpoint forces one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientProtocol {
    Udp,
    Tcp,
}

impl ClientProtocol {
    pub fn wire_kind(self) -> WireKind {
        match self {
            Self::Udp => WireKind::Udp,
            Self::Tcp => WireKind::Tcp,
        }
    }
}

/// One incoming query, as handed over by the host server.
pub struct RequestState {
    msg: Message,
    client_protocol: ClientProtocol,
    /// Listener label used for metrics, e.g. `"dns://:53"`.
    server: String,
}

impl RequestState {
    pub fn new(msg: Message, client_protocol: ClientProtocol, server: impl Into<String>) -> Self {
        Self {
            msg,
            client_protocol,
            server: server.into(),
        }
    }

    pub fn msg(&self) -> &Message {
        &self.msg
    }

    pub fn id(&self) -> u16 {
        self.msg.id()
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn client_protocol(&self) -> ClientProtocol {
        self.client_protocol
    }

    pub fn query(&self) -> Option<&Query> {
        self.msg.queries().first()
    }

    /// Question name, lower case, trailing dot stripped except for the root.
    pub fn qname(&self) -> String {
        match self.query() {
            Some(q) => normalize_query_name(&q.name().to_string()),
            None => String::new(),
        }
    }

    /// Advertised UDP payload size, floored at the classic 512 bytes.
    pub fn udp_size(&self) -> u16 {
        let advertised = self
            .msg
            .extensions()
            .as_ref()
            .map(|edns| edns.max_payload())
            .unwrap_or(0);
        advertised.max(MIN_MSG_SIZE)
    }

    /// Whether the reply answers this request: id and question must agree.
    pub fn matches_reply(&self, reply: &Message) -> bool {
        if reply.id() != self.msg.id() {
            return false;
        }
        match (self.query(), reply.queries().first()) {
            (Some(q), Some(r)) => {
                q.query_type() == r.query_type()
                    && q.query_class() == r.query_class()
                    && normalize_query_name(&q.name().to_string())
                        == normalize_query_name(&r.name().to_string())
            }
            (None, None) => true,
            _ => false,
        }
    }
}

/// Serializes a message to wire bytes.
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>, ForwardError> {
    let mut buf = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut buf);
    msg.emit(&mut encoder)
        .map_err(|e| ForwardError::Proto(e.to_string()))?;
    Ok(buf)
}

/// Builds an error reply for the original request.
pub fn error_reply(req: &Message, rcode: ResponseCode) -> Message {
    let mut reply = Message::new();
    reply.set_id(req.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(req.op_code());
    reply.set_response_code(rcode);
    reply.set_recursion_desired(req.recursion_desired());
    for query in req.queries() {
        reply.add_query(query.clone());
    }
    reply
}

/// The host server's write half for one query.
#[async_trait]
pub trait ResponseWriter: Send {
    async fn write_msg(&mut self, reply: &Message) -> Result<(), ForwardError>;
}
