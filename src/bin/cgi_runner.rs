//! `wicket-cgi-runner [interpreter...]`
//!
//! Reads the framed preamble from stdin (stdout sink path, stderr sink path,
//! JSON environment), then runs `SCRIPT_FILENAME` with exactly that
//! environment, its stdout and stderr appended to the sinks and the rest of
//! stdin as its input. Exits with the script's status.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Command, ExitCode, Stdio};

use wicket::cgi::protocol;

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("wicket-cgi-runner: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let interpreter: Vec<String> = std::env::args().skip(1).collect();

    let mut stdin = io::stdin().lock();
    let stdout_path = String::from_utf8(protocol::read_field(&mut stdin)?)?;
    let stderr_path = String::from_utf8(protocol::read_field(&mut stdin)?)?;
    let meta = protocol::decode_metadata(&protocol::read_field(&mut stdin)?)?;
    let mut body = Vec::new();
    stdin.read_to_end(&mut body)?;

    let script = meta
        .get("SCRIPT_FILENAME")
        .ok_or("metadata carries no SCRIPT_FILENAME")?;

    let mut command = match interpreter.split_first() {
        Some((program, args)) => {
            let mut command = Command::new(program);
            command.args(args).arg(script);
            command
        }
        None => Command::new(script),
    };
    if let Some(dir) = Path::new(script).parent().filter(|d| !d.as_os_str().is_empty()) {
        command.current_dir(dir);
    }

    let mut child = command
        .env_clear()
        .envs(&meta)
        .stdin(Stdio::piped())
        .stdout(append(&stdout_path)?)
        .stderr(append(&stderr_path)?)
        .spawn()
        .map_err(|e| format!("cannot execute {script}: {e}"))?;

    if let Some(mut input) = child.stdin.take() {
        // Scripts that ignore their input may exit before reading it.
        match input.write_all(&body) {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
            other => other?,
        }
    }

    let status = child.wait()?;
    Ok(match status.code() {
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        None => ExitCode::FAILURE,
    })
}

fn append(path: &str) -> io::Result<File> {
    OpenOptions::new().append(true).open(path)
}
