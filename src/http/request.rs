use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::time::Instant;

use bytes::Bytes;
use percent_encoding::percent_decode_str;

use crate::buffer::{Buffer, BufferError};
use crate::http::parser::{Framing, HeadInfo, ParserHandler, Reject, Verdict, has_token};
use crate::http::response::StatusCode;

/// Longest request target accepted.
pub const LIMIT_URI: usize = 8 * 1024;
/// Longest single header name or value accepted.
pub const LIMIT_FIELD_SIZE: usize = 8 * 1024;
/// Most header fields accepted in one request.
pub const LIMIT_FIELDS: usize = 128;

/// HTTP request methods.
///
/// The common verbs plus the WebDAV and version-control extensions that
/// HTTP/1.1 servers are expected to pass through to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// CONNECT - Tunnel to the target
    CONNECT,
    /// TRACE - Loop-back test
    TRACE,
    COPY,
    LOCK,
    MKCOL,
    MOVE,
    PROPFIND,
    PROPPATCH,
    UNLOCK,
    REPORT,
    MKACTIVITY,
    CHECKOUT,
    MERGE,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// # Arguments
    ///
    /// * `s` - String representation of the method (case-sensitive, uppercase)
    ///
    /// # Returns
    ///
    /// `Some(Method)` if the string matches a known method, `None` otherwise.
    ///
    /// # Example
    ///
    /// ```
    /// # use hearth::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        let method = match s {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            "HEAD" => Method::HEAD,
            "OPTIONS" => Method::OPTIONS,
            "PATCH" => Method::PATCH,
            "CONNECT" => Method::CONNECT,
            "TRACE" => Method::TRACE,
            "COPY" => Method::COPY,
            "LOCK" => Method::LOCK,
            "MKCOL" => Method::MKCOL,
            "MOVE" => Method::MOVE,
            "PROPFIND" => Method::PROPFIND,
            "PROPPATCH" => Method::PROPPATCH,
            "UNLOCK" => Method::UNLOCK,
            "REPORT" => Method::REPORT,
            "MKACTIVITY" => Method::MKACTIVITY,
            "CHECKOUT" => Method::CHECKOUT,
            "MERGE" => Method::MERGE,
            _ => return None,
        };
        Some(method)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::CONNECT => "CONNECT",
            Method::TRACE => "TRACE",
            Method::COPY => "COPY",
            Method::LOCK => "LOCK",
            Method::MKCOL => "MKCOL",
            Method::MOVE => "MOVE",
            Method::PROPFIND => "PROPFIND",
            Method::PROPPATCH => "PROPPATCH",
            Method::UNLOCK => "UNLOCK",
            Method::REPORT => "REPORT",
            Method::MKACTIVITY => "MKACTIVITY",
            Method::CHECKOUT => "CHECKOUT",
            Method::MERGE => "MERGE",
        }
    }

    /// Methods whose requests carry a body and so must declare its length.
    pub fn requires_length(&self) -> bool {
        matches!(self, Method::POST | Method::PUT | Method::PATCH)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// Request body storage: memory for small bodies, a temporary file for
/// large ones.
#[derive(Debug)]
pub enum Body {
    Memory(Buffer),
    Spooled { file: File, len: u64 },
}

impl Body {
    /// Picks the storage for a body of `declared` length.
    pub fn for_length(declared: Option<u64>, spool_threshold: u64, limit: u64) -> io::Result<Self> {
        match declared {
            Some(len) if len > spool_threshold => Ok(Body::Spooled {
                file: tempfile::tempfile()?,
                len: 0,
            }),
            Some(len) => Ok(Body::Memory(Buffer::new(len as usize, limit as usize))),
            None => Ok(Body::Memory(Buffer::new(8 * 1024, limit as usize))),
        }
    }

    /// Appends a fragment, moving to a temporary file once the in-memory
    /// copy would pass `spool_threshold`.
    pub fn write(&mut self, data: &[u8], spool_threshold: u64) -> io::Result<()> {
        if let Body::Memory(buf) = self {
            if (buf.len() + data.len()) as u64 > spool_threshold {
                let mut file = tempfile::tempfile()?;
                file.write_all(buf.as_slice())?;
                let len = buf.len() as u64;
                *self = Body::Spooled { file, len };
            }
        }

        match self {
            Body::Memory(buf) => buf.write(data).map_err(|BufferError::LimitOver { .. }| {
                io::Error::new(io::ErrorKind::OutOfMemory, "request body over limit")
            }),
            Body::Spooled { file, len } => {
                file.write_all(data)?;
                *len += data.len() as u64;
                Ok(())
            }
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            Body::Memory(buf) => buf.len() as u64,
            Body::Spooled { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_spooled(&self) -> bool {
        matches!(self, Body::Spooled { .. })
    }

    pub fn into_input(self) -> io::Result<Input> {
        match self {
            Body::Memory(buf) => Ok(Input::from_bytes(buf.freeze())),
            Body::Spooled { mut file, len } => {
                file.seek(SeekFrom::Start(0))?;
                Ok(Input {
                    source: Source::File(BufReader::new(file)),
                    len,
                })
            }
        }
    }
}

#[derive(Debug)]
enum Source {
    Memory(Cursor<Bytes>),
    File(BufReader<File>),
}

/// Request body as seen by the application.
#[derive(Debug)]
pub struct Input {
    source: Source,
    len: u64,
}

impl Input {
    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        let len = bytes.len() as u64;
        Self {
            source: Source::Memory(Cursor::new(bytes)),
            len,
        }
    }

    /// Total body length.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the remaining body into memory.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len as usize);
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.source {
            Source::Memory(cursor) => cursor.read(buf),
            Source::File(reader) => reader.read(buf),
        }
    }
}

impl BufRead for Input {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match &mut self.source {
            Source::Memory(cursor) => cursor.fill_buf(),
            Source::File(reader) => reader.fill_buf(),
        }
    }

    fn consume(&mut self, amt: usize) {
        match &mut self.source {
            Source::Memory(cursor) => cursor.consume(amt),
            Source::File(reader) => reader.consume(amt),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Element {
    None,
    Field,
    Value,
}

/// One HTTP message on a connection, built up as the parser reports it.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    /// Target exactly as sent.
    pub target: String,
    /// Percent-decoded path.
    pub path: String,
    /// Raw query string without the `?`.
    pub query: String,
    pub version: Version,
    /// Header fields in arrival order, names as sent.
    pub headers: Vec<(String, String)>,
    pub body: Option<Body>,
    pub keep_alive: bool,
    pub upgrade: bool,
    /// A `100 Continue` is owed before the body can arrive.
    pub expect_continue: bool,
    /// Deferred error; answered instead of calling the application.
    pub bad_request: Option<StatusCode>,
    pub complete: bool,
    pub received_at: Instant,
    declared_length: Option<u64>,
    url: Buffer,
    field: Buffer,
    value: Buffer,
    last: Element,
}

impl Request {
    pub fn new() -> Self {
        Self {
            method: Method::GET,
            target: String::new(),
            path: String::new(),
            query: String::new(),
            version: Version::Http11,
            headers: Vec::new(),
            body: None,
            keep_alive: false,
            upgrade: false,
            expect_continue: false,
            bad_request: None,
            complete: false,
            received_at: Instant::now(),
            declared_length: None,
            url: Buffer::new(256, LIMIT_URI),
            field: Buffer::new(64, LIMIT_FIELD_SIZE),
            value: Buffer::new(128, LIMIT_FIELD_SIZE),
            last: Element::None,
        }
    }

    /// A request that exists only to carry an error status.
    pub fn failed(status: StatusCode) -> Self {
        let mut req = Self::new();
        req.bad_request = Some(status);
        req.complete = true;
        req
    }

    /// Case-insensitive header lookup; the first match wins.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Declared Content-Length, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.declared_length
    }

    /// Ready to be answered: fully received, or failed.
    pub fn is_ready(&self) -> bool {
        self.complete || self.bad_request.is_some()
    }

    fn finish_header(&mut self) -> Verdict {
        if self.last == Element::Value {
            if self.headers.len() >= LIMIT_FIELDS {
                return Err(Reject(StatusCode::BadRequest));
            }
            let name = String::from_utf8_lossy(self.field.as_slice()).into_owned();
            let value = String::from_utf8_lossy(self.value.as_slice()).into_owned();
            self.headers.push((name, value));
            self.field.clear();
            self.value.clear();
        }
        Ok(())
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

/// Requests of one connection in arrival order.
#[derive(Debug, Default)]
pub struct RequestQueue {
    items: VecDeque<Request>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, req: Request) {
        self.items.push_back(req);
    }

    pub fn front(&self) -> Option<&Request> {
        self.items.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut Request> {
        self.items.front_mut()
    }

    pub fn pop_front(&mut self) -> Option<Request> {
        self.items.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.items.iter()
    }

    /// The request currently being received, if any.
    pub fn in_progress(&mut self) -> Option<&mut Request> {
        self.items.back_mut().filter(|r| !r.is_ready())
    }

    /// True when the front request can be answered.
    pub fn front_ready(&self) -> bool {
        self.items.front().is_some_and(Request::is_ready)
    }

    /// Attaches `status` to the request being received. A finished request
    /// is never touched; a placeholder is queued instead.
    pub fn record_error(&mut self, status: StatusCode) {
        match self.in_progress() {
            Some(req) => {
                req.bad_request = Some(status);
                req.complete = true;
            }
            None => self.items.push_back(Request::failed(status)),
        }
    }
}

/// Limits and switches that shape request assembly.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_content_length: u64,
    pub spool_threshold: u64,
    pub keepalive: bool,
}

/// Parser callbacks that build requests into a [`RequestQueue`].
pub struct Assembler<'a> {
    queue: &'a mut RequestQueue,
    limits: &'a Limits,
}

impl<'a> Assembler<'a> {
    pub fn new(queue: &'a mut RequestQueue, limits: &'a Limits) -> Self {
        Self { queue, limits }
    }

    fn current(&mut self) -> Result<&mut Request, Reject> {
        self.queue
            .items
            .back_mut()
            .ok_or(Reject(StatusCode::InternalServerError))
    }
}

impl ParserHandler for Assembler<'_> {
    fn on_message_begin(&mut self) -> Verdict {
        self.queue.push(Request::new());
        Ok(())
    }

    fn on_url(&mut self, fragment: &[u8]) -> Verdict {
        let req = self.current()?;
        req.url
            .write(fragment)
            .map_err(|_| Reject(StatusCode::BadRequest))
    }

    fn on_header_field(&mut self, fragment: &[u8]) -> Verdict {
        let req = self.current()?;
        req.finish_header()?;
        req.last = Element::Field;
        req.field
            .write(fragment)
            .map_err(|_| Reject(StatusCode::BadRequest))
    }

    fn on_header_value(&mut self, fragment: &[u8]) -> Verdict {
        let req = self.current()?;
        if req.last == Element::None {
            return Err(Reject(StatusCode::BadRequest));
        }
        req.last = Element::Value;
        req.value
            .write(fragment)
            .map_err(|_| Reject(StatusCode::BadRequest))
    }

    fn on_headers_complete(&mut self, head: &HeadInfo<'_>) -> Verdict {
        let limits = self.limits;
        let req = self.current()?;
        req.finish_header()?;

        req.method = Method::from_str(head.method).ok_or(Reject(StatusCode::BadRequest))?;
        req.version = head.version;
        req.upgrade = head.upgrade;
        req.target = String::from_utf8_lossy(req.url.as_slice()).into_owned();
        let (path, query) = split_target(&req.target);
        req.path = percent_decode(path);
        req.query = query.to_string();

        let connection = req.header("connection").unwrap_or_default().as_bytes();
        let keep_alive = limits.keepalive
            && !head.upgrade
            && match head.version {
                Version::Http11 => !has_token(connection, b"close"),
                Version::Http10 => has_token(connection, b"keep-alive"),
            };
        req.keep_alive = keep_alive;

        if head.upgrade {
            check_websocket(req)?;
        }

        if head.version == Version::Http11 {
            if let Some(expect) = req.header("expect") {
                if !expect.eq_ignore_ascii_case("100-continue") {
                    return Err(Reject(StatusCode::ExpectationFailed));
                }
                req.expect_continue = true;
            }
        }

        match head.framing {
            Framing::Length(len) => {
                if len > limits.max_content_length {
                    return Err(Reject(StatusCode::PayloadTooLarge));
                }
                req.declared_length = Some(len);
                if len > 0 {
                    req.body = Some(
                        Body::for_length(Some(len), limits.spool_threshold, limits.max_content_length)
                            .map_err(|_| Reject(StatusCode::InternalServerError))?,
                    );
                }
            }
            Framing::None if req.method.requires_length() && !head.upgrade => {
                return Err(Reject(StatusCode::LengthRequired));
            }
            Framing::None | Framing::Chunked => {}
        }
        Ok(())
    }

    fn on_body(&mut self, fragment: &[u8]) -> Verdict {
        if fragment.is_empty() {
            return Ok(());
        }
        let limits = self.limits;
        let req = self.current()?;
        req.expect_continue = false;

        let received = req.body.as_ref().map_or(0, Body::len);
        if received + fragment.len() as u64 > limits.max_content_length {
            return Err(Reject(StatusCode::PayloadTooLarge));
        }
        let body = match req.body.as_mut() {
            Some(body) => body,
            None => req.body.insert(
                Body::for_length(None, limits.spool_threshold, limits.max_content_length)
                    .map_err(|_| Reject(StatusCode::InternalServerError))?,
            ),
        };
        body.write(fragment, limits.spool_threshold)
            .map_err(|_| Reject(StatusCode::InternalServerError))
    }

    fn on_message_complete(&mut self) -> Verdict {
        let req = self.current()?;
        req.complete = true;
        Ok(())
    }
}

fn check_websocket(req: &Request) -> Verdict {
    let is_websocket = req
        .header("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !is_websocket {
        return Ok(());
    }
    let has_key = req.header("sec-websocket-key").is_some_and(|k| !k.is_empty());
    let version_ok = req.header("sec-websocket-version").map(str::trim) == Some("13");
    if has_key && version_ok {
        Ok(())
    } else {
        Err(Reject(StatusCode::BadRequest))
    }
}

/// Splits a request target into path and query, dropping any fragment
/// and the scheme/authority of an absolute-form target.
pub fn split_target(target: &str) -> (&str, &str) {
    let mut rest = target;
    if let Some(after_scheme) = rest
        .strip_prefix("http://")
        .or_else(|| rest.strip_prefix("https://"))
    {
        rest = after_scheme.find('/').map_or("/", |i| &after_scheme[i..]);
    }
    let rest = rest.split('#').next().unwrap_or_default();
    match rest.split_once('?') {
        Some((path, query)) => (path, query),
        None => (rest, ""),
    }
}

/// Decodes `%XX` escapes; malformed escapes are kept as-is.
pub fn percent_decode(input: &str) -> String {
    percent_decode_str(input).decode_utf8_lossy().into_owned()
}
