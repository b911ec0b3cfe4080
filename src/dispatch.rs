//! Request dispatch: virtual host, mount resolution, handler invocation,
//! and translation of the handler's [`Outcome`] into one response.

use std::sync::Arc;

use http::header::{ALLOW, LOCATION};
use http::{HeaderValue, Method, StatusCode};
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::error::Fault;
use crate::handler::{Outcome, Signal};
use crate::request::Request;
use crate::response::Response;
use crate::vhost::{self, VirtualHost, VirtualHosts};

/// Methods advertised for `OPTIONS *`.
const ALLOWED_METHODS: &str = "GET,HEAD,POST,OPTIONS";

/// Runs on every parsed request before routing. An `Err` answers the
/// request without consulting any mount.
pub type RequestHook = Arc<dyn Fn(&mut Request) -> Result<(), Signal> + Send + Sync>;

pub(crate) struct Dispatcher {
    primary: Arc<VirtualHost>,
    hosts: VirtualHosts,
    hook: RwLock<Option<RequestHook>>,
    server_software: String,
    expose_error_detail: bool,
}

impl Dispatcher {
    pub(crate) fn new(primary: VirtualHost, server_software: String, expose_error_detail: bool) -> Self {
        Self {
            primary: Arc::new(primary),
            hosts: VirtualHosts::new(),
            hook: RwLock::new(None),
            server_software,
            expose_error_detail,
        }
    }

    pub(crate) fn primary(&self) -> &Arc<VirtualHost> {
        &self.primary
    }

    pub(crate) fn hosts(&self) -> &VirtualHosts {
        &self.hosts
    }

    pub(crate) fn set_hook(&self, hook: RequestHook) {
        *self.hook.write() = Some(hook);
    }

    /// Footer line of synthesized error pages.
    pub(crate) fn address(&self, host: &str, port: u16) -> String {
        format!("{} at {host}:{port}", self.server_software)
    }

    /// Produces exactly one response for `req`.
    pub(crate) async fn dispatch(&self, mut req: Request) -> Response {
        let address = self.address(req.host(), req.local_addr().port());

        let hook = self.hook.read().clone();
        if let Some(hook) = hook {
            if let Err(signal) = hook(&mut req) {
                return self.translate(Outcome::Signal(signal), &address);
            }
        }

        if req.path() == "*" {
            if *req.method() == Method::OPTIONS {
                return Response::builder().header(ALLOW.as_str(), ALLOWED_METHODS).no_body();
            }
            return self.translate(Outcome::Signal(Signal::not_found("`*` not found.")), &address);
        }

        let hosts = self.hosts.snapshot();
        let host = vhost::select(&hosts, &self.primary, req.local_addr(), req.host());

        let Some(resolution) = host.mounts().resolve(req.path()) else {
            let message = format!("`{}` not found.", req.path());
            return self.translate(Outcome::Signal(Signal::not_found(message)), &address);
        };

        debug!(
            host = %host.descriptor(),
            script_name = %resolution.script_name,
            path_info = %resolution.path_info,
            "invoking handler"
        );
        req.script_name = resolution.script_name;
        req.path_info = resolution.path_info;
        req.options = resolution.options;

        // A panicking handler only takes its own task down.
        let handler = resolution.handler;
        let outcome = match tokio::spawn(async move { handler.call(req).await }).await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Fault(Fault::with_source("handler task failed", e)),
        };

        self.translate(outcome, &address)
    }

    fn translate(&self, outcome: Outcome, address: &str) -> Response {
        match outcome {
            Outcome::Respond(res) => res,
            Outcome::Signal(signal) => signal_response(&signal, address),
            Outcome::Fault(fault) => {
                error!(error = %fault, "handler fault");
                let detail = self.expose_error_detail.then(|| fault.to_string());
                Response::error_page(StatusCode::INTERNAL_SERVER_ERROR, detail.as_deref(), address)
            }
        }
    }
}

fn signal_response(signal: &Signal, address: &str) -> Response {
    let status = signal.status();
    let mut res = if status.is_client_error() || status.is_server_error() {
        Response::error_page(status, signal.message(), address)
    } else {
        let mut res = Response::status(status);
        if let Some(message) = signal.message() {
            res = Response::text(message.to_owned());
            res.set_status(status);
        }
        res
    };

    if let Some(location) = signal.location() {
        match HeaderValue::from_str(location) {
            Ok(value) => {
                res.headers_mut().insert(LOCATION, value);
            }
            Err(_) => tracing::warn!(location, "dropping invalid redirect location"),
        }
    }
    res
}
