//! Metrics sink interface.
//!
//! Exposition is the host server's concern; the engine only reports. The
//! trait methods default to no-ops so a sink implements just what it
//! exports.

use std::time::Duration;

pub trait MetricsSink: Send + Sync {
    /// Histogram `name_lookup_duration_ms`, labelled by server and whether
    /// a zone matched.
    fn name_lookup_duration(&self, server: &str, matched: bool, elapsed: Duration) {
        let _ = (server, matched, elapsed);
    }

    /// Histogram `request_duration_ms`, labelled by server and upstream.
    fn request_duration(&self, server: &str, to: &str, elapsed: Duration) {
        let _ = (server, to, elapsed);
    }

    /// Counter `request_count_total`, labelled by server and upstream.
    fn request_count(&self, server: &str, to: &str) {
        let _ = (server, to);
    }

    /// Counter `response_rcode_count_total`, labelled by server, upstream
    /// and rcode.
    fn response_rcode(&self, server: &str, to: &str, rcode: &str) {
        let _ = (server, to, rcode);
    }

    /// Counter `hc_failure_count_total`, labelled by upstream.
    fn health_check_failure(&self, to: &str) {
        let _ = to;
    }

    /// Counter `hc_all_down_count_total`, labelled by upstream pool.
    fn health_check_all_down(&self, to: &str) {
        let _ = to;
    }
}

/// Sink used when the host wires no metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}
