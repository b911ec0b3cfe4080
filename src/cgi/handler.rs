//! The CGI delegate: one runner subprocess per request.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{Method, StatusCode, Version};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

use crate::cgi::protocol;
use crate::config::ServerConfig;
use crate::error::Fault;
use crate::handler::{BoxFuture, BoxedHandler, Handler, Outcome, Service, Signal};
use crate::request::Request;
use crate::response::Response;

struct Settings {
    script: PathBuf,
    command: Vec<String>,
    path_env: String,
    temp_dir: PathBuf,
    server_software: String,
    server_protocol: &'static str,
}

/// Runs an external script for every request it serves.
///
/// The runner command line from [`CgiConfig`](crate::config::CgiConfig) is
/// spawned per request, fed the framed preamble and the request body, and
/// the response is rebuilt from what the script printed.
#[derive(Clone)]
pub struct CgiHandler {
    settings: Arc<Settings>,
}

impl CgiHandler {
    pub fn new(config: &ServerConfig, script: impl Into<PathBuf>) -> Self {
        let mut command = config.cgi.runner.clone();
        command.extend(config.cgi.interpreter.clone());

        Self {
            settings: Arc::new(Settings {
                script: script.into(),
                command,
                path_env: config.cgi.path_env.clone(),
                temp_dir: config.temp_dir(),
                server_software: config.server_software.clone(),
                server_protocol: match config.version() {
                    Version::HTTP_10 => "HTTP/1.0",
                    _ => "HTTP/1.1",
                },
            }),
        }
    }

    pub fn script(&self) -> &Path {
        &self.settings.script
    }

    /// The environment handed to the script.
    pub fn meta_vars(&self, req: &Request) -> BTreeMap<String, String> {
        let settings = &self.settings;
        let mut meta = BTreeMap::new();
        let mut set = |key: &str, value: String| {
            meta.insert(key.to_owned(), value);
        };

        set("GATEWAY_INTERFACE", "CGI/1.1".to_owned());
        set("SERVER_SOFTWARE", settings.server_software.clone());
        set("SERVER_PROTOCOL", settings.server_protocol.to_owned());
        set("SERVER_NAME", req.host().to_owned());
        set("SERVER_PORT", req.port().unwrap_or(req.local_addr().port()).to_string());
        set("REMOTE_ADDR", req.peer_addr().ip().to_string());
        set("REMOTE_PORT", req.peer_addr().port().to_string());
        set("REQUEST_METHOD", req.method().to_string());
        set("REQUEST_URI", req.target().to_owned());
        set("SCRIPT_NAME", req.script_name().to_owned());
        set("PATH_INFO", req.path_info().to_owned());
        set("QUERY_STRING", req.query().unwrap_or_default().to_owned());
        set("SCRIPT_FILENAME", settings.script.display().to_string());
        set("PATH", settings.path_env.clone());

        if !req.body().is_empty() || req.headers().contains_key(CONTENT_LENGTH) {
            set("CONTENT_LENGTH", req.body().len().to_string());
        }
        if let Some(content_type) = req.header(CONTENT_TYPE.as_str()) {
            set("CONTENT_TYPE", content_type.to_owned());
        }

        for name in req.headers().keys() {
            // No HTTP_PROXY (httpoxy).
            if name == CONTENT_TYPE || name == CONTENT_LENGTH || name.as_str() == "proxy" {
                continue;
            }
            let values: Vec<String> = req
                .headers()
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect();
            let key = format!("HTTP_{}", name.as_str().to_ascii_uppercase().replace('-', "_"));
            set(&key, values.join(", "));
        }

        meta
    }

    async fn run(self, req: Request) -> Result<Response, Fault> {
        let settings = &self.settings;
        let script = settings.script.display().to_string();

        // Both sinks are deleted when they drop, on every path out of here.
        let stdout_sink = sink(&settings.temp_dir, "wicket.cgiout.")?;
        let stderr_sink = sink(&settings.temp_dir, "wicket.cgierr.")?;

        let metadata = serde_json::to_vec(&self.meta_vars(&req))
            .map_err(|e| Fault::with_source("serializing cgi metadata", e))?;
        let preamble = protocol::encode_preamble(
            &sink_path(&stdout_sink)?,
            &sink_path(&stderr_sink)?,
            &metadata,
        )
        .map_err(|e| Fault::with_source("framing cgi preamble", e))?;

        let (program, args) = settings
            .command
            .split_first()
            .ok_or_else(|| Fault::new("cgi runner command is empty"))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_sink.reopen()?))
            .spawn()
            .map_err(|e| Fault::with_source(format!("spawning cgi runner `{program}`"), e))?;

        debug!(script = %script, pid = child.id(), "cgi runner started");

        if let Some(mut stdin) = child.stdin.take() {
            let fed = async {
                stdin.write_all(&preamble).await?;
                if !req.body().is_empty() {
                    stdin.write_all(req.body()).await?;
                }
                stdin.shutdown().await
            }
            .await;
            if let Err(e) = fed {
                debug!(script = %script, error = %e, "cgi runner stopped reading its input");
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Fault::with_source("waiting for cgi runner", e))?;
        if !status.success() {
            error!(script = %script, status = %status, "cgi script exited unsuccessfully");
        }

        let output = tokio::fs::read(stdout_sink.path()).await?;
        let errors = tokio::fs::read(stderr_sink.path()).await?;
        if !errors.is_empty() {
            error!(script = %script, stderr = %String::from_utf8_lossy(&errors), "cgi script wrote to stderr");
        }

        protocol::parse_output(&output).map_err(|e| Fault::with_source(format!("cgi script `{script}`"), e))
    }
}

impl Service for CgiHandler {
    fn call(&self, req: Request) -> BoxFuture {
        if !matches!(*req.method(), Method::GET | Method::HEAD | Method::POST) {
            let signal = Signal::new(StatusCode::METHOD_NOT_ALLOWED)
                .with_message(format!("unsupported method `{}`.", req.method()));
            return Box::pin(async move { Outcome::Signal(signal) });
        }

        let this = self.clone();
        Box::pin(async move {
            match this.run(req).await {
                Ok(res) => Outcome::Respond(res),
                Err(fault) => Outcome::Fault(fault),
            }
        })
    }
}

impl Handler for CgiHandler {
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(self)
    }
}

fn sink(dir: &Path, prefix: &str) -> Result<NamedTempFile, Fault> {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempfile_in(dir)
        .map_err(|e| Fault::with_source(format!("creating sink in {}", dir.display()), e))
}

fn sink_path(sink: &NamedTempFile) -> Result<String, Fault> {
    sink.path()
        .to_str()
        .map(str::to_owned)
        .ok_or_else(|| Fault::new(format!("sink path {} is not UTF-8", sink.path().display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::parse_for_test;

    #[tokio::test]
    async fn meta_vars_describe_the_request() {
        let handler = CgiHandler::new(&ServerConfig::default(), "/srv/cgi/app.sh");
        let mut req = parse_for_test(
            b"POST /app/extra?x=1 HTTP/1.1\r\nHost: site.test\r\nContent-Type: text/plain\r\n\
              Content-Length: 3\r\nX-Trace-Id: abc\r\nAccept: a\r\nAccept: b\r\n\r\nhey",
        )
        .await
        .unwrap();
        req.script_name = "/app".to_owned();
        req.path_info = "/extra".to_owned();

        let meta = handler.meta_vars(&req);
        let get = |k: &str| meta.get(k).map(String::as_str);

        assert_eq!(get("GATEWAY_INTERFACE"), Some("CGI/1.1"));
        assert_eq!(get("REQUEST_METHOD"), Some("POST"));
        assert_eq!(get("REQUEST_URI"), Some("/app/extra?x=1"));
        assert_eq!(get("SCRIPT_NAME"), Some("/app"));
        assert_eq!(get("PATH_INFO"), Some("/extra"));
        assert_eq!(get("QUERY_STRING"), Some("x=1"));
        assert_eq!(get("SERVER_NAME"), Some("site.test"));
        assert_eq!(get("SERVER_PORT"), Some("8080"));
        assert_eq!(get("REMOTE_ADDR"), Some("10.0.0.9"));
        assert_eq!(get("CONTENT_LENGTH"), Some("3"));
        assert_eq!(get("CONTENT_TYPE"), Some("text/plain"));
        assert_eq!(get("HTTP_X_TRACE_ID"), Some("abc"));
        assert_eq!(get("HTTP_ACCEPT"), Some("a, b"));
        assert_eq!(get("SCRIPT_FILENAME"), Some("/srv/cgi/app.sh"));
        assert!(get("HTTP_CONTENT_TYPE").is_none());
    }

    #[tokio::test]
    async fn proxy_header_is_not_exported() {
        let handler = CgiHandler::new(&ServerConfig::default(), "/srv/cgi/app.sh");
        let req = parse_for_test(b"GET /app HTTP/1.1\r\nProxy: http://attacker.test:1\r\nX-Real: yes\r\n\r\n")
            .await
            .unwrap();

        let meta = handler.meta_vars(&req);
        assert!(!meta.contains_key("HTTP_PROXY"));
        assert_eq!(meta.get("HTTP_X_REAL").map(String::as_str), Some("yes"));
    }

    #[tokio::test]
    async fn only_get_head_and_post_reach_the_script() {
        let handler = CgiHandler::new(&ServerConfig::default(), "/srv/cgi/app.sh");
        let req = parse_for_test(b"DELETE /app HTTP/1.1\r\n\r\n").await.unwrap();

        match handler.call(req).await {
            Outcome::Signal(signal) => assert_eq!(signal.status(), StatusCode::METHOD_NOT_ALLOWED),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_runner_is_a_fault() {
        let mut config = ServerConfig::default();
        config.cgi.runner = vec!["/nonexistent/wicket-runner".to_owned()];
        let handler = CgiHandler::new(&config, "/srv/cgi/app.sh");
        let req = parse_for_test(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        match handler.call(req).await {
            Outcome::Fault(fault) => assert!(fault.to_string().contains("spawning cgi runner")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
