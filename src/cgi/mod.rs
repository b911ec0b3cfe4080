//! CGI delegation.
//!
//! The server never runs a script itself. Each request spawns the
//! `wicket-cgi-runner` binary, which receives a framed preamble on stdin
//! (two sink paths and the script's environment), execs the script with its
//! output redirected into the sinks, and exits. The server then parses the
//! stdout sink as a CGI response.

mod handler;
pub mod protocol;

pub use handler::CgiHandler;
pub use protocol::ProtocolError;
