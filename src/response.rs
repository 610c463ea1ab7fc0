use std::future::Future;
use std::io;
use std::time::Duration;

use http::StatusCode;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::sandbox::SandboxError;
use crate::storage::ByteStream;

pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    Stream { reader: ByteStream, len: u64 },
}

/// Everything a handler wants sent back. Only the connection worker turns it
/// into bytes.
pub struct Response {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "text/plain; charset=utf-8".into())],
            body: Body::Empty,
        }
    }

    pub fn text(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            body: Body::Bytes(message.into().into_bytes()),
            ..Self::new(status)
        }
    }

    pub fn html(status: StatusCode, page: String) -> Self {
        Self::text(status, page).with_content_type("text/html; charset=utf-8")
    }

    pub fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(bytes) => Self {
                body: Body::Bytes(bytes),
                ..Self::new(status)
            }
            .with_content_type("application/json"),
            Err(_) => Self::text(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode response"),
        }
    }

    pub fn stream(reader: ByteStream, len: u64) -> Self {
        Self {
            body: Body::Stream { reader, len },
            ..Self::new(StatusCode::OK)
        }
        .with_content_type("application/octet-stream")
    }

    pub fn redirect(location: &str) -> Self {
        Self::new(StatusCode::FOUND).with_header("Location", location)
    }

    pub fn with_content_type(self, value: &str) -> Self {
        self.with_header("Content-Type", value)
    }

    /// Set a header, replacing any earlier value with the same name.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn content_length(&self) -> u64 {
        match &self.body {
            Body::Empty => 0,
            Body::Bytes(bytes) => bytes.len() as u64,
            Body::Stream { len, .. } => *len,
        }
    }

    fn head(&self) -> String {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("")
        );
        for (name, value) in &self.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str(&format!("Content-Length: {}\r\n", self.content_length()));
        head.push_str("Connection: close\r\n\r\n");
        head
    }

    /// Write the whole response. Every individual write must make progress
    /// within `idle`, so a peer that stops reading cannot pin the worker.
    pub async fn write_to<W>(self, writer: &mut W, idle: Duration) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        within(idle, writer.write_all(self.head().as_bytes())).await?;
        let sent = match self.body {
            Body::Empty => 0,
            Body::Bytes(bytes) => {
                within(idle, writer.write_all(&bytes)).await?;
                bytes.len() as u64
            }
            Body::Stream { reader, len } => {
                let mut reader = reader.take(len);
                let mut buf = vec![0u8; 64 * 1024];
                let mut copied = 0u64;
                loop {
                    let read = reader.read(&mut buf).await?;
                    if read == 0 {
                        break;
                    }
                    within(idle, writer.write_all(&buf[..read])).await?;
                    copied += read as u64;
                }
                if copied != len {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("body ended after {copied} of {len} bytes"),
                    ));
                }
                copied
            }
        };
        within(idle, writer.flush()).await?;
        Ok(sent)
    }
}

async fn within<F, T>(idle: Duration, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    timeout(idle, fut)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "peer stopped reading"))?
}

impl From<SandboxError> for Response {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::BadPath(reason) => {
                Self::text(StatusCode::BAD_REQUEST, format!("invalid path: {reason}"))
            }
            SandboxError::NotFound => Self::text(StatusCode::NOT_FOUND, "not found"),
            SandboxError::Conflict => Self::text(StatusCode::CONFLICT, "already exists"),
            SandboxError::Malformed(reason) => {
                Self::text(StatusCode::BAD_REQUEST, format!("malformed upload: {reason}"))
            }
            SandboxError::Io(_) => Self::text(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Unable to process your request. Please try again later.",
            ),
        }
    }
}

/// Quote a file name for a `Content-Disposition` header, replacing anything
/// outside printable ASCII.
pub fn attachment_header(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|ch| {
            if matches!(ch, ' '..='~') && ch != '"' && ch != '\\' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let fallback = if fallback.is_empty() {
        "download.bin".to_string()
    } else {
        fallback
    };
    format!("attachment; filename=\"{fallback}\"")
}
