//! HTTP/1.x Framing
//!
//! One request per connection. The request head is parsed with `httparse`;
//! bodies are framed by `Content-Length` or `Transfer-Encoding: chunked`.
//! Responses always close the connection.

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on request line plus headers, and on any chunk framing line.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Most headers accepted on one request.
pub const MAX_HEADERS: usize = 64;

/// Media type of run documents.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// HTTP framing errors.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Peer closed the connection before sending a request line.
    #[error("Connection closed before request")]
    Closed,

    /// Request head is not valid HTTP/1.x (bad request line, missing
    /// target, non-`HTTP/` protocol token, malformed header).
    #[error("Malformed request head: {0}")]
    Parse(#[from] httparse::Error),

    /// Method token has invalid characters.
    #[error("Invalid method: {0}")]
    Method(#[from] http::method::InvalidMethod),

    /// Header name or value not representable.
    #[error("Malformed header: {0:?}")]
    BadHeader(String),

    /// Request line and headers are too long.
    #[error("Request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    /// `Content-Length` is not a number.
    #[error("Invalid Content-Length")]
    BadContentLength,

    /// Chunk size line or chunk terminator is malformed.
    #[error("Malformed chunked body")]
    BadChunk,

    /// Transfer coding other than `chunked`.
    #[error("Unsupported transfer coding {coding:?}")]
    UnsupportedTransferEncoding {
        /// Protocol token of the rejected request.
        protocol: String,
        /// The codings as sent.
        coding: String,
    },

    /// Body exceeds the configured limit.
    #[error("Body of {size} bytes exceeds limit of {limit}")]
    BodyTooLarge {
        /// Protocol token of the rejected request.
        protocol: String,
        /// Declared (or accumulated, when chunked) body size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Request was not received in time.
    #[error("Timed out reading request")]
    Timeout,

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HttpError {
    /// Status and protocol token to answer with, for errors that get a
    /// response. Everything else drops the connection silently.
    pub fn rejection(&self) -> Option<(StatusCode, String)> {
        match self {
            Self::BodyTooLarge { protocol, .. } => {
                Some((StatusCode::PAYLOAD_TOO_LARGE, protocol.clone()))
            }
            Self::UnsupportedTransferEncoding { protocol, .. } => {
                Some((StatusCode::NOT_IMPLEMENTED, protocol.clone()))
            }
            _ => None,
        }
    }
}

/// A decoded request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Raw request target, as sent.
    pub target: String,
    /// Protocol token, e.g. `HTTP/1.1`.
    pub protocol: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Vec<u8>,
}

impl Request {
    /// True when `Content-Type` names JSON. Parameters such as `charset`
    /// are ignored.
    pub fn is_json(&self) -> bool {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|media| media.trim().eq_ignore_ascii_case(JSON_CONTENT_TYPE))
            .unwrap_or(false)
    }
}

/// A response ready to be written.
#[derive(Debug, Clone)]
pub struct Response {
    /// Status code.
    pub status: StatusCode,
    /// Response headers. `Content-Length` and `Connection` are added on write.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Vec<u8>,
}

impl Response {
    /// An empty response with the given status.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: &'static str) -> Self {
        self.headers.append(name, HeaderValue::from_static(value));
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Serialize onto the wire using the request's protocol token.
    pub fn encode(&self, protocol: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!(
                "{} {} {}\r\n",
                protocol,
                self.status.as_u16(),
                self.status.canonical_reason().unwrap_or("")
            )
            .as_bytes(),
        );

        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("content-length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(b"connection: close\r\n\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// How the request body is framed.
enum BodyFraming {
    Length(usize),
    Chunked,
}

fn eof() -> HttpError {
    HttpError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed mid-request",
    ))
}

fn is_blank(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

/// Append one `\n` terminated line to `buf`, allowing at most `limit` bytes
/// in `buf` overall. Returns the line length.
async fn read_line_bounded<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> Result<usize, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let room = limit.saturating_sub(buf.len());
    let n = (&mut *reader).take(room as u64 + 1).read_until(b'\n', buf).await?;
    if buf.len() > limit {
        return Err(HttpError::HeadTooLarge(limit));
    }
    Ok(n)
}

/// Read the raw head up to and including the blank line that ends it.
async fn read_head<R>(reader: &mut R) -> Result<Vec<u8>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::new();
    loop {
        let n = read_line_bounded(reader, &mut head, MAX_HEAD_BYTES).await?;
        if n == 0 {
            return Err(if head.is_empty() { HttpError::Closed } else { eof() });
        }
        // Stray blank lines before the request line are skipped by the parser.
        if is_blank(&head[head.len() - n..]) && head.iter().any(|b| !b.is_ascii_whitespace()) {
            return Ok(head);
        }
    }
}

fn body_framing(headers: &HeaderMap, protocol: &str) -> Result<BodyFraming, HttpError> {
    let codings: Vec<String> = headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|c| c.trim().to_ascii_lowercase())
        .filter(|c| !c.is_empty())
        .collect();

    match codings.as_slice() {
        [] => {}
        [only] if only == "chunked" => return Ok(BodyFraming::Chunked),
        _ => {
            return Err(HttpError::UnsupportedTransferEncoding {
                protocol: protocol.to_string(),
                coding: codings.join(", "),
            })
        }
    }

    let size = match headers.get(header::CONTENT_LENGTH) {
        None => 0,
        Some(v) => v
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .ok_or(HttpError::BadContentLength)?,
    };
    Ok(BodyFraming::Length(size))
}

/// Decode a chunked body. Trailer fields are read and discarded.
async fn read_chunked<R>(reader: &mut R, protocol: &str, max_body_bytes: usize) -> Result<Vec<u8>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        if read_line_bounded(reader, &mut line, MAX_HEAD_BYTES).await? == 0 {
            return Err(eof());
        }
        let size = match httparse::parse_chunk_size(&line) {
            Ok(httparse::Status::Complete((_, size))) => {
                usize::try_from(size).map_err(|_| HttpError::BadChunk)?
            }
            _ => return Err(HttpError::BadChunk),
        };
        if size == 0 {
            break;
        }

        let total = body.len().saturating_add(size);
        if total > max_body_bytes {
            return Err(HttpError::BodyTooLarge {
                protocol: protocol.to_string(),
                size: total,
                limit: max_body_bytes,
            });
        }
        let start = body.len();
        body.resize(total, 0);
        reader.read_exact(&mut body[start..]).await?;

        line.clear();
        read_line_bounded(reader, &mut line, MAX_HEAD_BYTES).await?;
        if !is_blank(&line) {
            return Err(HttpError::BadChunk);
        }
    }

    loop {
        line.clear();
        if read_line_bounded(reader, &mut line, MAX_HEAD_BYTES).await? == 0 {
            return Err(eof());
        }
        if is_blank(&line) {
            return Ok(body);
        }
    }
}

/// Decode one request from the stream.
///
/// Only `HTTP/1.0` and `HTTP/1.1` heads are accepted; anything else fails
/// to parse and the caller drops the connection.
pub async fn read_request<R>(reader: &mut R, max_body_bytes: usize) -> Result<Request, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let head = read_head(reader).await?;

    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut slots);
    if parsed.parse(&head)?.is_partial() {
        return Err(eof());
    }

    let method = Method::from_bytes(parsed.method.unwrap_or_default().as_bytes())?;
    let target = parsed.path.unwrap_or_default().to_string();
    let protocol = format!("HTTP/1.{}", parsed.version.unwrap_or(1));

    let mut headers = HeaderMap::new();
    for h in parsed.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| HttpError::BadHeader(h.name.to_string()))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| HttpError::BadHeader(h.name.to_string()))?;
        headers.append(name, value);
    }

    let body = match body_framing(&headers, &protocol)? {
        BodyFraming::Chunked => read_chunked(reader, &protocol, max_body_bytes).await?,
        BodyFraming::Length(size) if size > max_body_bytes => {
            return Err(HttpError::BodyTooLarge {
                protocol,
                size,
                limit: max_body_bytes,
            });
        }
        BodyFraming::Length(size) => {
            let mut body = vec![0u8; size];
            reader.read_exact(&mut body).await?;
            body
        }
    };

    Ok(Request {
        method,
        target,
        protocol,
        headers,
        body,
    })
}

/// Write a response and flush it.
pub async fn write_response<W>(writer: &mut W, response: &Response, protocol: &str) -> Result<(), HttpError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&response.encode(protocol)).await?;
    writer.flush().await?;
    Ok(())
}
