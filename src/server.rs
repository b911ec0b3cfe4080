//! HTTP server, administrative entry points and graceful shutdown.
//!
//! # Graceful shutdown
//!
//! On SIGTERM, Ctrl-C or [`Server::shutdown`] the server:
//! 1. Stops `listener.accept()` immediately; no new connections are made.
//! 2. Raises the stop flag. Connections waiting for their next request see
//!    it at the next poll tick and close; requests already being served
//!    (CGI subprocesses included) run to completion.
//! 3. Returns from [`Server::serve`] once every connection task is done.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::access_log::{AccessLog, TracingAccessLog};
use crate::config::ServerConfig;
use crate::connection;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::handler::{Handler, Signal};
use crate::mount::MountOptions;
use crate::request::Request;
use crate::vhost::{HostDescriptor, HostPattern, VirtualHost};

/// State every connection task reads.
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) dispatcher: Dispatcher,
    access_log: RwLock<Arc<dyn AccessLog>>,
    stop: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn new(config: ServerConfig) -> Self {
        let primary = VirtualHost::new(primary_descriptor(&config));
        let dispatcher = Dispatcher::new(primary, config.server_software.clone(), config.expose_error_detail);
        let access_log: Arc<dyn AccessLog> = Arc::new(TracingAccessLog);
        Self {
            config,
            dispatcher,
            access_log: RwLock::new(access_log),
            stop: watch::Sender::new(false),
        }
    }

    pub(crate) fn access_log(&self) -> Arc<dyn AccessLog> {
        Arc::clone(&*self.access_log.read())
    }

    pub(crate) fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    pub(crate) fn stop(&self) {
        self.stop.send_replace(true);
    }
}

fn primary_descriptor(config: &ServerConfig) -> HostDescriptor {
    let mut descriptor = HostDescriptor::named(config.server_name.clone()).port(config.port);
    if !config.bind_address.is_unspecified() {
        descriptor = descriptor.bind_address(config.bind_address);
    }
    for alias in &config.server_aliases {
        match HostPattern::parse(alias) {
            Ok(pattern) => descriptor = descriptor.alias(pattern),
            Err(e) => warn!(alias, error = %e, "ignoring unusable server alias"),
        }
    }
    descriptor
}

/// The HTTP server.
///
/// Cheap to clone; every clone drives the same tables, so mounts and
/// virtual hosts can be changed while [`serve`](Server::serve) runs.
///
/// ```rust,no_run
/// use wicket::{Request, Server, ServerConfig};
///
/// # async fn run() -> Result<(), wicket::Error> {
/// let server = Server::new(ServerConfig::default())?;
/// server.mount("/hello", |_req: Request| async { "hello" });
/// server.serve().await
/// # }
/// ```
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    /// Validates `config` and builds a server whose primary virtual host is
    /// described by it.
    pub fn new(config: ServerConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self { shared: Arc::new(Shared::new(config)) })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Mounts `handler` at `prefix` on the primary host.
    pub fn mount(&self, prefix: &str, handler: impl Handler) {
        self.shared.dispatcher.primary().mount(prefix, handler);
    }

    /// Like [`mount`](Server::mount), with options the handler reads back
    /// through [`Request::options`](crate::Request::options).
    pub fn mount_with(&self, prefix: &str, handler: impl Handler, options: MountOptions) {
        self.shared.dispatcher.primary().mount_with(prefix, handler, options);
    }

    /// Removes the primary host's mount at `prefix`. Returns whether one
    /// existed.
    pub fn unmount(&self, prefix: &str) -> bool {
        self.shared.dispatcher.primary().unmount(prefix)
    }

    /// Registers a virtual host and returns a handle for mounting on it.
    pub fn add_virtual_host(&self, host: VirtualHost) -> Arc<VirtualHost> {
        let host = Arc::new(host);
        debug!(host = %host.descriptor(), "adding virtual host");
        self.shared.dispatcher.hosts().add(Arc::clone(&host));
        host
    }

    /// Replaces the access-log sink. Connections pick it up on their next
    /// request.
    pub fn set_access_log(&self, log: impl AccessLog) {
        *self.shared.access_log.write() = Arc::new(log);
    }

    /// Installs a callback that sees every parsed request before routing,
    /// replacing any earlier one. Returning a [`Signal`] answers the request
    /// with it.
    pub fn on_request<F>(&self, hook: F)
    where
        F: Fn(&mut Request) -> Result<(), Signal> + Send + Sync + 'static,
    {
        self.shared.dispatcher.set_hook(Arc::new(hook));
    }

    /// Stops accepting connections and lets idle ones close.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shared.stop();
    }

    /// Binds `bind_address:port` and serves until shutdown.
    pub async fn serve(&self) -> Result<(), Error> {
        let addr = SocketAddr::new(self.shared.config.bind_address, self.shared.config.port);
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    /// Serves connections from an already-bound listener until shutdown.
    ///
    /// Returns only after every in-flight connection has finished.
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), Error> {
        let local = listener.local_addr()?;
        info!(addr = %local, "wicket listening");

        // JoinSet tracks every spawned connection task so we can wait for
        // them all to finish during graceful shutdown.
        let mut tasks = tokio::task::JoinSet::new();

        let signal = shutdown_signal();
        tokio::pin!(signal);
        let stopped = stopped(self.shared.stop.subscribe());
        tokio::pin!(stopped);

        loop {
            tokio::select! {
                // Shutdown arms first, so a stop wins over queued connections.
                biased;

                () = &mut signal => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    self.shared.stop();
                    break;
                }

                () = &mut stopped => {
                    info!(in_flight = tasks.len(), "draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };
                    let local = match stream.local_addr() {
                        Ok(addr) => addr,
                        Err(e) => {
                            error!(%peer, "cannot read local address: {e}");
                            continue;
                        }
                    };

                    let shared = Arc::clone(&self.shared);
                    tasks.spawn(async move {
                        connection::serve(&shared, stream, peer, local).await;
                    });
                }

                // Reap finished connection tasks so the JoinSet does not grow
                // without bound on long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("wicket stopped");
        Ok(())
    }

    /// Drives one connection over any duplex byte stream until it closes.
    ///
    /// `peer` and `local` stand in for the socket addresses: `local` takes
    /// part in virtual-host selection.
    pub async fn serve_connection<S>(&self, io: S, peer: SocketAddr, local: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        connection::serve(&self.shared, io, peer, local).await;
    }
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    if stop.wait_for(|stopping| *stopping).await.is_err() {
        std::future::pending::<()>().await;
    }
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// SIGTERM and SIGINT (Ctrl-C) on Unix; only Ctrl-C elsewhere. A signal
/// that cannot be listened for never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    // `pending()` is a future that never resolves, so on non-Unix platforms
    // the SIGTERM arm is effectively disabled.
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_host_is_described_by_the_config() {
        let config = ServerConfig {
            server_name: "example.com".to_owned(),
            server_aliases: vec!["*.example.com".to_owned()],
            ..ServerConfig::default()
        };
        let descriptor = primary_descriptor(&config);

        assert_eq!(descriptor.server_name.as_deref(), Some("example.com"));
        assert_eq!(descriptor.port, Some(8080));
        assert!(descriptor.bind_address.is_none());
        assert!(descriptor.matches("10.0.0.1".parse().unwrap(), 8080, "www.example.com"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ServerConfig { http_version: "2".to_owned(), ..ServerConfig::default() };
        assert!(matches!(Server::new(config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn shutdown_ends_serve_listener() {
        let server = Server::new(ServerConfig::default()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.serve_listener(listener).await }
        });
        server.shutdown();

        serving.await.unwrap().unwrap();
        assert!(server.shared.is_stopping());
    }
}
