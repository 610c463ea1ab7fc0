use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

const MAX_LINE_BYTES: usize = 8 * 1024;
const MAX_HEADER_LINES: usize = 100;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("connection closed before the request head was complete")]
    Closed,
    #[error("failed to read request: {0}")]
    Io(#[from] io::Error),
    #[error("malformed request line {0:?}")]
    MalformedRequestLine(String),
    #[error("request head exceeds size limits")]
    TooLarge,
}

impl ParseError {
    /// Whether the peer deserves a `400` before the connection is closed.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::MalformedRequestLine(_) | Self::TooLarge)
    }
}

/// One parsed request head. The body, if any, is still unread on the stream
/// the head came from.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub peer: SocketAddr,
}

impl Request {
    /// Path without the query suffix.
    pub fn route(&self) -> &str {
        match self.path.split_once('?') {
            Some((route, _)) => route,
            None => &self.path,
        }
    }

    pub fn query(&self) -> HashMap<String, String> {
        match self.path.split_once('?') {
            Some((_, query)) => parse_query(query),
            None => HashMap::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .or_else(|| {
                self.headers
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|(_, value)| value)
            })
            .map(String::as_str)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length")?.parse().ok()
    }
}

pub async fn parse_request<R>(reader: &mut R, peer: SocketAddr) -> Result<Request, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?;
    let parts: Vec<&str> = line.trim().split(' ').collect();
    if parts.len() < 3 {
        return Err(ParseError::MalformedRequestLine(line.trim().to_string()));
    }

    let mut request = Request {
        method: parts[0].to_string(),
        path: parts[1].to_string(),
        version: parts[2].to_string(),
        headers: HashMap::new(),
        peer,
    };

    for _ in 0..MAX_HEADER_LINES {
        let line = read_line(reader).await?;
        let line = line.trim();
        if line.is_empty() {
            return Ok(request);
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        request
            .headers
            .insert(name.trim().to_string(), value.trim().to_string());
    }

    Err(ParseError::TooLarge)
}

async fn read_line<R>(reader: &mut R) -> Result<String, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = reader
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if read == 0 {
        return Err(ParseError::Closed);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > MAX_LINE_BYTES {
            return Err(ParseError::TooLarge);
        }
        return Err(ParseError::Closed);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Parse a query string into `key=value` pairs. Segments without exactly one
/// `=` are dropped; keys and values are trimmed.
pub fn parse_query(input: &str) -> HashMap<String, String> {
    decode_pairs(input)
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

/// Parse an url-encoded form body. Values are kept exactly as decoded so
/// passwords with surrounding spaces survive.
pub fn parse_form(input: &str) -> HashMap<String, String> {
    decode_pairs(input)
        .map(|(key, value)| (key.trim().to_string(), value))
        .collect()
}

fn decode_pairs(input: &str) -> impl Iterator<Item = (String, String)> + '_ {
    input.split('&').filter_map(|segment| {
        let mut parts = segment.split('=');
        let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
            return None;
        };
        Some((decode_component(key)?, decode_component(value)?))
    })
}

fn decode_component(raw: &str) -> Option<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced).ok().map(|value| value.into_owned())
}

pub fn cookie_value<'a>(cookie_header: &'a str, name: &str) -> Option<&'a str> {
    for part in cookie_header.split(';') {
        let trimmed = part.trim();
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        if key == name {
            return Some(value);
        }
    }
    None
}
