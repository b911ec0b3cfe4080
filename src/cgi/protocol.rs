//! Wire formats between the server and the runner process.
//!
//! # Request framing (server → runner stdin)
//!
//! ```text
//! 00000025/tmp/wicket.cgiout.AbC123 00000025/tmp/wicket.cgierr.XyZ789 00000412{"REQUEST_METHOD":…} <body…>
//! └len─┘└stdout-sink path──────┘ └len─┘└stderr-sink path──────┘ └len─┘└metadata──────────┘ └raw─┘
//! ```
//!
//! (spaces added for readability; there are no separators on the wire.)
//! Each field is preceded by its length as 8 zero-padded ASCII digits.
//!
//! # CGI response (script stdout → server)
//!
//! A header block, the first line made of nothing but line-ending bytes,
//! then the body. `Status:` sets the status, `Location:` without a 3xx
//! status forces 302, each `Set-Cookie:` becomes its own cookie.

use std::collections::BTreeMap;
use std::io::Read;

use bytes::Bytes;
use http::header::{CONNECTION, LOCATION};
use http::{HeaderName, HeaderValue, StatusCode};

use crate::response::{Cookie, Response};

/// Width of the decimal length prefix in front of every field.
pub const LENGTH_WIDTH: usize = 8;

const MAX_FIELD_LEN: usize = 99_999_999;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("premature end of script headers")]
    PrematureEnd,

    #[error("malformed header line `{0}`")]
    MalformedHeader(String),

    #[error("invalid status `{0}`")]
    InvalidStatus(String),

    #[error("field of {0} bytes does not fit an 8-digit length")]
    FieldTooLong(usize),

    #[error("invalid length prefix `{0}`")]
    InvalidLength(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Appends `field` to `out` behind its 8-digit length.
pub fn write_field(out: &mut Vec<u8>, field: &[u8]) -> Result<(), ProtocolError> {
    if field.len() > MAX_FIELD_LEN {
        return Err(ProtocolError::FieldTooLong(field.len()));
    }
    out.extend_from_slice(format!("{:0width$}", field.len(), width = LENGTH_WIDTH).as_bytes());
    out.extend_from_slice(field);
    Ok(())
}

/// The three framed fields that precede the request body.
pub fn encode_preamble(stdout_path: &str, stderr_path: &str, metadata: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(3 * LENGTH_WIDTH + stdout_path.len() + stderr_path.len() + metadata.len());
    write_field(&mut out, stdout_path.as_bytes())?;
    write_field(&mut out, stderr_path.as_bytes())?;
    write_field(&mut out, metadata)?;
    Ok(out)
}

/// Reads one length-prefixed field. Space padding is accepted as well as
/// zero padding.
pub fn read_field<R: Read>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut prefix = [0u8; LENGTH_WIDTH];
    reader.read_exact(&mut prefix)?;
    let text = String::from_utf8_lossy(&prefix);
    let len: usize = text
        .trim()
        .parse()
        .map_err(|_| ProtocolError::InvalidLength(text.to_string()))?;

    let mut field = vec![0u8; len];
    reader.read_exact(&mut field)?;
    Ok(field)
}

/// Decodes the metadata field into the environment handed to the script.
pub fn decode_metadata(field: &[u8]) -> Result<BTreeMap<String, String>, serde_json::Error> {
    serde_json::from_slice(field)
}

// ── CGI response ──────────────────────────────────────────────────────────────

/// Splits script output on the first blank line.
///
/// The blank line itself (one `\r\n`, `\n` or `\r`) belongs to neither part.
pub fn split_output(data: &[u8]) -> Result<(&[u8], &[u8]), ProtocolError> {
    let mut line_start = 0;
    while line_start < data.len() {
        match data[line_start] {
            b'\r' if data.get(line_start + 1) == Some(&b'\n') => {
                return Ok((&data[..line_start], &data[line_start + 2..]));
            }
            b'\r' | b'\n' => return Ok((&data[..line_start], &data[line_start + 1..])),
            _ => {}
        }
        match data[line_start..].iter().position(|&b| b == b'\n') {
            Some(offset) => line_start += offset + 1,
            None => break,
        }
    }
    Err(ProtocolError::PrematureEnd)
}

/// Parses a header block into lowercase names with every value in order.
/// Lines starting with whitespace continue the previous value.
pub fn parse_header_block(block: &[u8]) -> Result<Vec<(String, Vec<String>)>, ProtocolError> {
    let text = String::from_utf8_lossy(block);
    let mut fields: Vec<(String, Vec<String>)> = Vec::new();

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        if line.starts_with([' ', '\t']) {
            let value = fields
                .last_mut()
                .and_then(|(_, values)| values.last_mut())
                .ok_or_else(|| ProtocolError::MalformedHeader(line.to_owned()))?;
            value.push(' ');
            value.push_str(line.trim());
            continue;
        }

        let (name, value) = line
            .split_once(':')
            .filter(|(name, _)| !name.is_empty() && !name.contains([' ', '\t']))
            .ok_or_else(|| ProtocolError::MalformedHeader(line.to_owned()))?;
        let name = name.to_ascii_lowercase();
        let value = value.trim().to_owned();

        match fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, values)) => values.push(value),
            None => fields.push((name, vec![value])),
        }
    }
    Ok(fields)
}

/// Builds the HTTP response a script's stdout describes.
pub fn parse_output(data: &[u8]) -> Result<Response, ProtocolError> {
    let (block, body) = split_output(data)?;
    let mut fields = parse_header_block(block)?;
    let mut res = Response::status(StatusCode::OK);

    if let Some(index) = fields.iter().position(|(name, _)| name == "status") {
        let raw = &fields[index].1[0];
        let digits: String = raw.chars().take_while(char::is_ascii_digit).collect();
        if !digits.is_empty() {
            let status = digits
                .parse::<u16>()
                .ok()
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| ProtocolError::InvalidStatus(raw.clone()))?;
            res.set_status(status);
            fields.remove(index);
        }
    }

    if fields.iter().any(|(name, _)| name == LOCATION.as_str()) && !res.status_code().is_redirection() {
        res.set_status(StatusCode::FOUND);
    }

    let wants_close = fields
        .iter()
        .filter(|(name, _)| name == CONNECTION.as_str())
        .flat_map(|(_, values)| values.iter().flat_map(|v| v.split(',')))
        .any(|token| token.trim().eq_ignore_ascii_case("close"));
    if wants_close {
        res.close_connection();
    }

    if let Some(index) = fields.iter().position(|(name, _)| name == "set-cookie") {
        for raw in fields.remove(index).1 {
            match Cookie::parse_set_cookie(&raw) {
                Some(cookie) => res.add_cookie(cookie),
                None => tracing::warn!(cookie = %raw, "dropping unparsable set-cookie from script"),
            }
        }
    }

    for (name, values) in fields {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ProtocolError::MalformedHeader(name.clone()))?;
        let value = HeaderValue::from_str(&values.join(", "))
            .map_err(|_| ProtocolError::MalformedHeader(format!("{name}: {}", values.join(", "))))?;
        res.headers_mut().insert(header, value);
    }

    res.set_body(Bytes::copy_from_slice(body));
    Ok(res)
}
