//! One accepted connection, request after request.
//!
//! ```text
//! AwaitRequest ──bytes──▶ Dispatch ──▶ Respond ──keep-alive──▶ AwaitRequest
//!      │                     │                    └─otherwise──▶ Close
//!      └─idle / eof / stop──▶ Close
//!                            ├─parse error──▶ error page ──▶ Close
//!                            └─stalled after the request line──▶ 408 ──▶ Close
//! ```
//!
//! The idle wait is a series of short reads, one per poll interval, against
//! a deadline. The server's stop flag is checked on every tick.

use std::net::SocketAddr;

use bytes::BytesMut;
use http::header::{REFERER, USER_AGENT};
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::access_log::AccessEntry;
use crate::error::ParseError;
use crate::request::{self, ParseLimits, RequestLine};
use crate::response::{Framing, Response};
use crate::server::Shared;

const INITIAL_BUFFER: usize = 4 * 1024;

/// Why the idle wait ended without a request.
#[derive(Debug, PartialEq, Eq)]
enum Idle {
    Ready,
    Closed,
    TimedOut,
    Stopping,
}

pub(crate) async fn serve<S>(shared: &Shared, mut io: S, peer: SocketAddr, local: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = &shared.config;
    let server_version = config.version();
    let limits = ParseLimits {
        max_header_bytes: config.max_header_bytes,
        max_body_bytes: config.max_body_bytes,
        default_host: &config.server_name,
    };
    let mut buf = BytesMut::with_capacity(INITIAL_BUFFER);

    debug!(%peer, "connection opened");
    loop {
        match await_request(shared, &mut io, &mut buf).await {
            Ok(Idle::Ready) => {}
            Ok(idle) => {
                debug!(%peer, reason = ?idle, "closing connection");
                break;
            }
            Err(e) => {
                debug!(%peer, error = %e, "read failed while idle");
                break;
            }
        }

        let started = Instant::now();
        let deadline = started + config.request_timeout();
        let parsed = time::timeout_at(deadline, request::read_request(&mut io, &mut buf, &limits, peer, local)).await;
        let req = match parsed {
            Ok(Ok(req)) => req,
            Ok(Err(e)) => {
                reject(shared, &mut io, e, peer, local).await;
                break;
            }
            Err(_) => {
                match request::request_line(&buf) {
                    Some(line) => time_out(shared, &mut io, line, peer, local, started).await,
                    None => debug!(%peer, "request line did not arrive before the deadline"),
                }
                break;
            }
        };

        let method = req.method().clone();
        let target = req.target().to_owned();
        let version = req.version();
        let referer = req.header(REFERER.as_str()).map(str::to_owned);
        let user_agent = req.header(USER_AGENT.as_str()).map(str::to_owned);
        let wants_keep_alive = req.keep_alive();

        let res = shared.dispatcher.dispatch(req).await;

        let keep_alive = server_version == Version::HTTP_11
            && version == Version::HTTP_11
            && config.keep_alive
            && wants_keep_alive
            && res.keep_alive();
        let framing = Framing {
            version: server_version,
            keep_alive,
            head_only: method == Method::HEAD,
            server_software: &config.server_software,
        };
        let written = res.write_to(&mut io, &framing).await;

        shared.access_log().record(&AccessEntry {
            peer_addr: peer,
            method,
            target,
            version,
            status: res.status_code(),
            bytes_sent: written.as_ref().copied().unwrap_or(0),
            referer,
            user_agent,
            elapsed: started.elapsed(),
        });

        if let Err(e) = written {
            debug!(%peer, error = %e, "failed to write response");
            break;
        }
        if !keep_alive {
            break;
        }
    }

    if let Err(e) = io.shutdown().await {
        debug!(%peer, error = %e, "shutdown failed");
    }
}

/// Waits until at least one byte of the next request is buffered.
async fn await_request<S>(shared: &Shared, io: &mut S, buf: &mut BytesMut) -> std::io::Result<Idle>
where
    S: AsyncRead + Unpin,
{
    if !buf.is_empty() {
        return Ok(Idle::Ready);
    }

    let deadline = Instant::now() + shared.config.request_timeout();
    let tick = shared.config.poll_interval();
    loop {
        let wait = tick.min(deadline.saturating_duration_since(Instant::now()));
        match time::timeout(wait, io.read_buf(buf)).await {
            Ok(Ok(0)) => return Ok(Idle::Closed),
            Ok(Ok(_)) => return Ok(Idle::Ready),
            Ok(Err(e)) => return Err(e),
            Err(_) if shared.is_stopping() => return Ok(Idle::Stopping),
            Err(_) if Instant::now() >= deadline => return Ok(Idle::TimedOut),
            Err(_) => {}
        }
    }
}

/// Answers a request that never parsed. No access-log entry is written.
async fn reject<S>(shared: &Shared, io: &mut S, error: ParseError, peer: SocketAddr, local: SocketAddr)
where
    S: AsyncWrite + Unpin,
{
    if let ParseError::Io(e) = &error {
        debug!(%peer, error = %e, "read failed mid-request");
        return;
    }
    warn!(%peer, error = %error, "rejecting request");

    let config = &shared.config;
    let address = shared.dispatcher.address(&config.server_name, local.port());
    let res = Response::error_page(error.status(), Some(&error.to_string()), &address);
    let framing = Framing {
        version: config.version(),
        keep_alive: false,
        head_only: false,
        server_software: &config.server_software,
    };
    if let Err(e) = res.write_to(io, &framing).await {
        debug!(%peer, error = %e, "failed to write error response");
    }
}

/// Answers a request whose line arrived but whose head or body stalled.
async fn time_out<S>(
    shared: &Shared,
    io: &mut S,
    line: RequestLine,
    peer: SocketAddr,
    local: SocketAddr,
    started: Instant,
) where
    S: AsyncWrite + Unpin,
{
    warn!(%peer, method = %line.method, target = %line.target, "request timed out");

    let config = &shared.config;
    let address = shared.dispatcher.address(&config.server_name, local.port());
    let res = Response::error_page(StatusCode::REQUEST_TIMEOUT, None, &address);
    let framing = Framing {
        version: config.version(),
        keep_alive: false,
        head_only: line.method == Method::HEAD,
        server_software: &config.server_software,
    };
    let written = res.write_to(io, &framing).await;
    if let Err(e) = &written {
        debug!(%peer, error = %e, "failed to write timeout response");
    }

    shared.access_log().record(&AccessEntry {
        peer_addr: peer,
        method: line.method,
        target: line.target,
        version: line.version,
        status: res.status_code(),
        bytes_sent: written.unwrap_or(0),
        referer: None,
        user_agent: None,
        elapsed: started.elapsed(),
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::ServerConfig;

    fn shared() -> Shared {
        let config = ServerConfig { request_timeout_ms: 1_000, poll_interval_ms: 100, ..ServerConfig::default() };
        Shared::new(config)
    }

    #[tokio::test(start_paused = true)]
    async fn idle_wait_times_out_at_the_deadline() {
        let shared = shared();
        let (_client, mut server) = tokio::io::duplex(64);
        let mut buf = BytesMut::new();

        let started = Instant::now();
        let idle = await_request(&shared, &mut server, &mut buf).await.unwrap();
        assert_eq!(idle, Idle::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flag_ends_the_wait_at_the_next_tick() {
        let shared = shared();
        shared.stop();
        let (_client, mut server) = tokio::io::duplex(64);
        let mut buf = BytesMut::new();

        let started = Instant::now();
        let idle = await_request(&shared, &mut server, &mut buf).await.unwrap();
        assert_eq!(idle, Idle::Stopping);
        assert!(started.elapsed() < Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn buffered_bytes_skip_the_wait() {
        let shared = shared();
        let (_client, mut server) = tokio::io::duplex(64);
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);

        assert_eq!(await_request(&shared, &mut server, &mut buf).await.unwrap(), Idle::Ready);
    }

    #[tokio::test]
    async fn eof_closes_quietly() {
        let shared = shared();
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let mut buf = BytesMut::new();

        assert_eq!(await_request(&shared, &mut server, &mut buf).await.unwrap(), Idle::Closed);
    }
}
