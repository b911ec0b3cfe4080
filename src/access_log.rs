//! Access log.
//!
//! One [`AccessEntry`] per completed request. Requests whose request line
//! never parsed, and connections that idled out, produce no entry.

use std::net::SocketAddr;
use std::time::Duration;

use http::{Method, StatusCode, Version};

/// Everything the common and referer log formats need about one request.
#[derive(Debug, Clone)]
pub struct AccessEntry {
    pub peer_addr: SocketAddr,
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub status: StatusCode,
    /// Body bytes written to the client.
    pub bytes_sent: usize,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub elapsed: Duration,
}

/// Sink invoked once per completed request.
pub trait AccessLog: Send + Sync + 'static {
    fn record(&self, entry: &AccessEntry);
}

/// Default sink: one `info` event per request on the `wicket::access` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAccessLog;

impl AccessLog for TracingAccessLog {
    fn record(&self, entry: &AccessEntry) {
        tracing::info!(
            target: "wicket::access",
            peer = %entry.peer_addr.ip(),
            method = %entry.method,
            target_uri = %entry.target,
            version = ?entry.version,
            status = entry.status.as_u16(),
            bytes = entry.bytes_sent,
            referer = entry.referer.as_deref().unwrap_or("-"),
            user_agent = entry.user_agent.as_deref().unwrap_or("-"),
            elapsed_ms = entry.elapsed.as_millis() as u64,
            "request completed"
        );
    }
}
