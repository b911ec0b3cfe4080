//! # wicket
//!
//! An embeddable HTTP/1.x request-serving engine.
//!
//! ## The pieces
//!
//! - **Mount table**: URL path prefixes → handlers, resolved longest prefix
//!   first and only on path-segment boundaries (`/foo` never claims
//!   `/foo-bar`).
//! - **Virtual hosts**: bind address, port, server name and aliases pick
//!   which mount table serves a request; the most specific host wins and
//!   the server's own configuration is the fallback.
//! - **Connection loop**: one task per connection, keep-alive, an idle
//!   deadline polled in small ticks so shutdown interrupts waiting.
//! - **CGI delegation**: [`cgi::CgiHandler`] runs a script through the
//!   `wicket-cgi-runner` binary and turns its output into a response.
//!
//! Mounts and hosts can change while the server runs. Readers always see a
//! complete snapshot.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use http::StatusCode;
//! use wicket::{Request, Response, Server, ServerConfig, Signal};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), wicket::Error> {
//!     let server = Server::new(ServerConfig::default())?;
//!     server.mount("/users", get_user);
//!     server.serve().await
//! }
//!
//! async fn get_user(req: Request) -> Result<Response, Signal> {
//!     // mounted at /users, so GET /users/42 sees path_info "/42"
//!     let id = req.path_info().trim_start_matches('/');
//!     if id.is_empty() {
//!         return Err(Signal::new(StatusCode::BAD_REQUEST).with_message("missing id"));
//!     }
//!     Ok(Response::json(format!(r#"{{"id":"{id}"}}"#)))
//! }
//! ```

mod access_log;
mod config;
mod connection;
mod dispatch;
mod error;
mod handler;
mod mount;
mod request;
mod response;
mod server;
mod vhost;

pub mod cgi;

pub use access_log::{AccessEntry, AccessLog, TracingAccessLog};
pub use config::{CgiConfig, ConfigError, ServerConfig};
pub use dispatch::RequestHook;
pub use error::{Error, Fault, ParseError};
pub use handler::{BoxFuture, BoxedHandler, Handler, IntoOutcome, Outcome, Service, Signal};
pub use mount::{MountOptions, MountTable, Resolution};
pub use request::Request;
pub use response::{Cookie, IntoResponse, Response, ResponseBuilder};
pub use server::Server;
pub use vhost::{HostDescriptor, HostPattern, VirtualHost, VirtualHosts, select};
