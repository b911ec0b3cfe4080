//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use wicket::{AccessEntry, AccessLog, Server, ServerConfig};

pub fn peer() -> SocketAddr {
    "192.0.2.7:51000".parse().unwrap()
}

pub fn local() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

/// Defaults with a short idle deadline so keep-alive tests finish quickly.
pub fn test_config() -> ServerConfig {
    ServerConfig { request_timeout_ms: 2_000, poll_interval_ms: 50, ..ServerConfig::default() }
}

/// Access log that keeps every entry for later assertions.
#[derive(Clone, Default)]
pub struct RecordingAccessLog {
    entries: Arc<Mutex<Vec<AccessEntry>>>,
}

impl RecordingAccessLog {
    pub fn entries(&self) -> Vec<AccessEntry> {
        self.entries.lock().clone()
    }
}

impl AccessLog for RecordingAccessLog {
    fn record(&self, entry: &AccessEntry) {
        self.entries.lock().push(entry.clone());
    }
}

/// A server wired to a recording access log.
pub fn recording_server(config: ServerConfig) -> (Server, RecordingAccessLog) {
    let server = Server::new(config).unwrap();
    let log = RecordingAccessLog::default();
    server.set_access_log(log.clone());
    (server, log)
}

/// Writes `raw` to a fresh in-memory connection and returns everything the
/// server sent back before closing it.
pub async fn exchange(server: &Server, raw: &[u8]) -> String {
    exchange_on(server, raw, local()).await
}

pub async fn exchange_on(server: &Server, raw: &[u8], local: SocketAddr) -> String {
    let (mut client, io) = tokio::io::duplex(64 * 1024);
    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve_connection(io, peer(), local).await }
    });

    client.write_all(raw).await.unwrap();
    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    serving.await.unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

/// One response as seen on the wire.
#[derive(Debug)]
pub struct Reply {
    pub status_line: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Reply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers_named(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// Splits a byte stream of responses using their `content-length`.
pub fn replies(mut text: &str) -> Vec<Reply> {
    let mut out = Vec::new();
    while let Some(end) = text.find("\r\n\r\n") {
        let mut lines = text[..end].split("\r\n");
        let status_line = lines.next().unwrap_or_default().to_owned();
        let status = status_line
            .split(' ')
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let headers: Vec<(String, String)> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(n, v)| (n.trim().to_ascii_lowercase(), v.trim().to_owned()))
            .collect();
        let length = headers
            .iter()
            .find(|(n, _)| n == "content-length")
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(0);

        let rest = &text[end + 4..];
        let length = length.min(rest.len());
        out.push(Reply { status_line, status, headers, body: rest[..length].to_owned() });
        text = &rest[length..];
    }
    out
}

/// Exactly one response, or a panic describing what arrived instead.
pub fn single(text: &str) -> Reply {
    let mut all = replies(text);
    assert_eq!(all.len(), 1, "expected one response, got: {text:?}");
    all.remove(0)
}
