//! dnsteer: a policy-driven DNS forwarder meant to be embedded in a host
//! DNS server's handler chain.
//!
//! For every incoming query the [`handler::Dnsteer`] handler decides
//! whether the name belongs to one of its configured [`zone::Zone`]s,
//! forwards matching queries to one of that zone's upstreams (UDP, TCP,
//! TCP-TLS or DoH) under a selection policy with health tracking, and
//! optionally feeds answered addresses into kernel packet-filter tables.
//! Everything else is delegated to the next handler in the chain.

pub mod bootstrap;
pub mod doh;
pub mod firewall;
pub mod handler;
pub mod matcher;
pub mod metrics;
pub mod request;
pub mod transport;
pub mod upstream;
pub mod zone;

pub use handler::{DnsHandler, Dnsteer};
pub use metrics::{MetricsSink, NoopMetrics};
pub use request::{ClientProtocol, RequestState, ResponseWriter};
pub use zone::Zone;

pub use dnsteer_domain::{
    DohFlavor, Endpoint, ForwardError, SelectionPolicy, TlsConfig, WireKind, ZoneConfig,
};
