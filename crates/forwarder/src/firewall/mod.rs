//! Kernel packet-filter hooks.
//!
//! After a successful exchange the dispatcher can feed the answered
//! addresses into kernel tables (Linux ipset, macOS/BSD PF) so that packet
//! filter rules pick them up. The kernel side lives behind the
//! [`PacketFilter`] trait; this crate ships the address extraction, the
//! table bookkeeping, and a no-op backend, so the engine compiles and runs
//! unchanged on platforms without a backend.

use dnsteer_domain::ForwardError;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RData;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::debug;

/// A PF table reference, `name[:anchor]` in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PfTable {
    pub name: String,
    pub anchor: Option<String>,
}

impl PfTable {
    pub fn parse(spec: &str) -> Result<Self, ForwardError> {
        let (name, anchor) = match spec.split_once(':') {
            Some((name, anchor)) if !anchor.is_empty() => (name, Some(anchor.to_string())),
            Some((name, _)) => (name, None),
            None => (spec, None),
        };
        if name.is_empty() {
            return Err(ForwardError::Config(format!("pf: empty table name in {:?}", spec)));
        }
        Ok(Self {
            name: name.to_string(),
            anchor,
        })
    }
}

/// The tables a zone feeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirewallTables {
    pub ipset: Vec<String>,
    pub pf: Vec<PfTable>,
}

impl FirewallTables {
    pub fn from_config(ipset: &[String], pf: &[String]) -> Result<Self, ForwardError> {
        for name in ipset {
            if name.is_empty() {
                return Err(ForwardError::Config("ipset: empty set name".into()));
            }
        }
        Ok(Self {
            ipset: ipset.to_vec(),
            pf: pf.iter().map(|s| PfTable::parse(s)).collect::<Result<_, _>>()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.ipset.is_empty() && self.pf.is_empty()
    }
}

/// Platform backend contract. `add_ips` must be idempotent and must never
/// block the caller beyond a best-effort syscall; IPv4 addresses go to v4
/// tables and IPv6 to v6.
pub trait PacketFilter: Send + Sync {
    fn setup(&self, tables: &FirewallTables) -> Result<(), ForwardError>;
    fn add_ips(&self, tables: &FirewallTables, v4: &[Ipv4Addr], v6: &[Ipv6Addr]);
    fn shutdown(&self, tables: &FirewallTables) -> Result<(), ForwardError>;
}

/// Backend used when the platform has none. Keeps the call sites honest
/// and makes the hook observable in logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFilter;

impl PacketFilter for NoopFilter {
    fn setup(&self, tables: &FirewallTables) -> Result<(), ForwardError> {
        debug!(ipset = tables.ipset.len(), pf = tables.pf.len(), "firewall hooks are no-ops on this platform");
        Ok(())
    }

    fn add_ips(&self, _tables: &FirewallTables, _v4: &[Ipv4Addr], _v6: &[Ipv6Addr]) {}

    fn shutdown(&self, _tables: &FirewallTables) -> Result<(), ForwardError> {
        Ok(())
    }
}

/// A zone's firewall binding: its tables plus the backend feeding them.
pub struct FirewallHandle {
    tables: FirewallTables,
    backend: Arc<dyn PacketFilter>,
}

impl FirewallHandle {
    pub fn new(tables: FirewallTables, backend: Arc<dyn PacketFilter>) -> Self {
        Self { tables, backend }
    }

    pub fn setup(&self) -> Result<(), ForwardError> {
        self.backend.setup(&self.tables)
    }

    pub fn shutdown(&self) -> Result<(), ForwardError> {
        self.backend.shutdown(&self.tables)
    }

    /// Feeds the reply's A/AAAA answers to the backend. Non-success
    /// replies and non-address records are skipped.
    pub fn add_ips(&self, reply: &Message) {
        if reply.response_code() != ResponseCode::NoError {
            return;
        }
        let (v4, v6) = collect_answer_ips(reply);
        if v4.is_empty() && v6.is_empty() {
            return;
        }
        debug!(v4 = v4.len(), v6 = v6.len(), "feeding answered addresses to packet filter");
        self.backend.add_ips(&self.tables, &v4, &v6);
    }
}

/// Extracts the A/AAAA answer addresses from a reply.
pub fn collect_answer_ips(reply: &Message) -> (Vec<Ipv4Addr>, Vec<Ipv6Addr>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for record in reply.answers() {
        match record.data() {
            RData::A(a) => v4.push(a.0),
            RData::AAAA(aaaa) => v6.push(aaaa.0),
            _ => {}
        }
    }
    (v4, v6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode};
    use hickory_proto::rr::rdata;
    use hickory_proto::rr::{Name, Record};
    use std::str::FromStr;

    fn reply_with_answers(rcode: ResponseCode) -> Message {
        let mut msg = Message::new();
        msg.set_id(1);
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(OpCode::Query);
        msg.set_response_code(rcode);
        let name = Name::from_str("example.com.").unwrap();
        msg.add_answer(Record::from_rdata(
            name.clone(),
            60,
            RData::A(rdata::A::new(1, 2, 3, 4)),
        ));
        msg.add_answer(Record::from_rdata(
            name.clone(),
            60,
            RData::AAAA(rdata::AAAA::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
        ));
        msg.add_answer(Record::from_rdata(
            name.clone(),
            60,
            RData::CNAME(rdata::CNAME(Name::from_str("alias.example.com.").unwrap())),
        ));
        msg
    }

    #[test]
    fn collects_only_address_records() {
        let (v4, v6) = collect_answer_ips(&reply_with_answers(ResponseCode::NoError));
        assert_eq!(v4, vec![Ipv4Addr::new(1, 2, 3, 4)]);
        assert_eq!(v6.len(), 1);
    }

    #[test]
    fn pf_table_parsing() {
        assert_eq!(
            PfTable::parse("bypass").unwrap(),
            PfTable {
                name: "bypass".into(),
                anchor: None
            }
        );
        assert_eq!(
            PfTable::parse("bypass:dnsteer").unwrap(),
            PfTable {
                name: "bypass".into(),
                anchor: Some("dnsteer".into())
            }
        );
        assert!(PfTable::parse(":anchor").is_err());
    }

    struct CountingFilter(std::sync::atomic::AtomicUsize);

    impl PacketFilter for CountingFilter {
        fn setup(&self, _tables: &FirewallTables) -> Result<(), ForwardError> {
            Ok(())
        }
        fn add_ips(&self, _tables: &FirewallTables, v4: &[Ipv4Addr], v6: &[Ipv6Addr]) {
            self.0
                .fetch_add(v4.len() + v6.len(), std::sync::atomic::Ordering::Relaxed);
        }
        fn shutdown(&self, _tables: &FirewallTables) -> Result<(), ForwardError> {
            Ok(())
        }
    }

    #[test]
    fn non_success_replies_are_skipped() {
        let backend = Arc::new(CountingFilter(std::sync::atomic::AtomicUsize::new(0)));
        let handle = FirewallHandle::new(
            FirewallTables::from_config(&["t".into()], &[]).unwrap(),
            backend.clone(),
        );

        handle.add_ips(&reply_with_answers(ResponseCode::ServFail));
        assert_eq!(backend.0.load(std::sync::atomic::Ordering::Relaxed), 0);

        handle.add_ips(&reply_with_answers(ResponseCode::NoError));
        assert_eq!(backend.0.load(std::sync::atomic::Ordering::Relaxed), 2);
    }
}
