use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ForwardError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid domain name: {0}")]
    InvalidDomainName(String),

    #[error("no healthy upstream host")]
    NoHealthyUpstream,

    #[error("no next handler in chain")]
    NoNextHandler,

    #[error("cached connection was closed by peer")]
    CachedConnClosed,

    #[error("out-of-order response from {server}: sent id {expected}, got id {got}")]
    OutOfOrder {
        server: String,
        expected: u16,
        got: u16,
    },

    #[error("reply question does not match request question")]
    FormatMismatch,

    #[error("transport error for {server}: {reason}")]
    Transport { server: String, reason: String },

    #[error("upstream {server} bad status: {status}, content type: {content_type}")]
    UpstreamStatus {
        server: String,
        status: u16,
        content_type: String,
    },

    #[error("DNS message error: {0}")]
    Proto(String),
}

impl ForwardError {
    pub fn transport(server: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Transport {
            server: server.into(),
            reason: reason.to_string(),
        }
    }

    /// True for failures that should count against a host's health.
    /// `CachedConnClosed` and question mismatches are handled by the
    /// dispatcher directly and carry no signal about host reachability.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::UpstreamStatus { .. } | Self::OutOfOrder { .. }
        )
    }
}
