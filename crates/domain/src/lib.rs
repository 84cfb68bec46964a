pub mod config;
pub mod endpoint;
pub mod errors;
pub mod name;

pub use config::{SelectionPolicy, TlsConfig, ZoneConfig};
pub use endpoint::{DohFlavor, Endpoint, WireKind};
pub use errors::ForwardError;
