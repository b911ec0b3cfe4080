//! Minimal wicket example: procedure handlers, a virtual host, and a CGI
//! script.
//!
//! Run with:
//!   RUST_LOG=info,wicket=debug cargo run --example basic [wicket.toml]
//!
//! Try:
//!   curl http://localhost:8080/users/42
//!   curl -i http://localhost:8080/old
//!   curl -H 'Host: api.test' http://localhost:8080/
//!   curl -X OPTIONS --request-target '*' http://localhost:8080
//!
//! The CGI mount needs the runner on PATH (`cargo install --path .`) and a
//! script at ./demos/hello.cgi.

use std::path::Path;

use http::StatusCode;
use tracing_subscriber::EnvFilter;
use wicket::cgi::CgiHandler;
use wicket::{HostDescriptor, Request, Response, Server, ServerConfig, Signal, VirtualHost};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::load(Path::new(&path))?,
        None => ServerConfig::default(),
    };

    let server = Server::new(config.clone())?;
    server.mount("/users", get_user);
    server.mount("/old", |_req: Request| async {
        Signal::redirect(StatusCode::MOVED_PERMANENTLY, "/users/1")
    });
    server.mount("/cgi-bin/hello", CgiHandler::new(&config, "./demos/hello.cgi"));

    let api = server.add_virtual_host(VirtualHost::new(HostDescriptor::named("api.test")));
    api.mount("/", |req: Request| async move {
        Response::json(format!(r#"{{"host":"{}","path":"{}"}}"#, req.host(), req.path()))
    });

    server.serve().await?;
    Ok(())
}

// GET /users/:id
async fn get_user(req: Request) -> Result<Response, Signal> {
    let id = req.path_info().trim_start_matches('/');
    if id.is_empty() || id.contains('/') {
        return Err(Signal::not_found(format!("no user at `{}`", req.path())));
    }
    Ok(Response::json(format!(r#"{{"id":"{id}","name":"alice"}}"#)))
}
