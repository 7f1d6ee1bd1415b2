use std::fs::File;
use std::io::{self, Seek, SeekFrom};

use bytes::Bytes;

use crate::error::AppError;

/// Status codes the server produces on its own.
///
/// Application responses carry their status line verbatim; this enum
/// covers the interim and error responses written without the
/// application:
/// - `Continue` (100): Interim response to `Expect: 100-continue`
/// - `BadRequest` (400): Malformed or oversized request
/// - `RequestTimeout` (408): Request not received in time
/// - `LengthRequired` (411): Body sent without a declared length
/// - `PayloadTooLarge` (413): Body over the configured maximum
/// - `ExpectationFailed` (417): Unsupported `Expect` value
/// - `InternalServerError` (500): Application or server failure
/// - `ServiceUnavailable` (503): Client went away mid-request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 100 Continue
    Continue,
    /// 200 OK
    Ok,
    /// 400 Bad Request
    BadRequest,
    /// 404 Not Found
    NotFound,
    /// 408 Request Timeout
    RequestTimeout,
    /// 411 Length Required
    LengthRequired,
    /// 413 Request Entity Too Large
    PayloadTooLarge,
    /// 417 Expectation Failed
    ExpectationFailed,
    /// 500 Internal Server Error
    InternalServerError,
    /// 503 Service Unavailable
    ServiceUnavailable,
}

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use hearth::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::LengthRequired.as_u16(), 411);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Continue => 100,
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::RequestTimeout => 408,
            StatusCode::LengthRequired => 411,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::ExpectationFailed => 417,
            StatusCode::InternalServerError => 500,
            StatusCode::ServiceUnavailable => 503,
        }
    }

    /// Returns the standard HTTP reason phrase for this status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use hearth::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.reason_phrase(), "OK");
    /// assert_eq!(StatusCode::PayloadTooLarge.reason_phrase(), "Request Entity Too Large");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Continue => "Continue",
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::RequestTimeout => "Request Timeout",
            StatusCode::LengthRequired => "Length Required",
            StatusCode::PayloadTooLarge => "Request Entity Too Large",
            StatusCode::ExpectationFailed => "Expectation Failed",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::ServiceUnavailable => "Service Unavailable",
        }
    }
}

/// Interim response sent for `Expect: 100-continue`.
pub const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Complete response written when a request fails before the
/// application produced anything.
pub fn error_page(status: StatusCode, server_name: &str) -> Bytes {
    let code = status.as_u16();
    let reason = status.reason_phrase();
    let body = if status == StatusCode::InternalServerError {
        format!(
            "<html><head><title>{code} {reason}</title></head><body><h1>{reason}</h1>\
             <p>The server encountered an internal error and was unable to complete your request.  \
             Either the server is overloaded or there is an error in the application.</p></body></html>\n"
        )
    } else {
        format!("<html><head><title>{reason}</title></head><body><p>{reason}.</p></body></html>\n")
    };
    Bytes::from(format!(
        "HTTP/1.0 {code} {reason}\r\nContent-Type: text/html\r\nServer: {server_name}\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    ))
}

/// Status and headers chosen by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Status line after the protocol, e.g. `200 OK`.
    pub status: String,
    pub code: u16,
    pub headers: Vec<(String, String)>,
    /// Parsed `Content-Length` header, when the application set one.
    pub content_length: Option<u64>,
    /// The application sent `Connection: close`.
    pub close: bool,
}

impl ResponseHead {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a body may follow for a request of the given method.
    pub fn allows_body(&self, head_request: bool) -> bool {
        !(head_request || (100..200).contains(&self.code) || self.code == 204 || self.code == 304)
    }

    /// A `101 Switching Protocols` answer; its `Connection` header is the
    /// application's.
    pub fn is_switching(&self) -> bool {
        self.code == 101
    }
}

/// The `start_response` callable handed to the application.
#[derive(Debug, Default)]
pub struct StartResponse {
    head: Option<ResponseHead>,
    headers_sent: bool,
}

impl StartResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the response status and headers.
    ///
    /// `status` is a full status line such as `"200 OK"`. A second call is
    /// an error unless `exc_info` is given: then the status is replaced if
    /// nothing was sent yet, otherwise `exc_info` is returned as the error.
    /// `Server` and `Date` headers are dropped; the server sets its own.
    #[track_caller]
    pub fn call(
        &mut self,
        status: &str,
        headers: Vec<(String, String)>,
        exc_info: Option<AppError>,
    ) -> Result<(), AppError> {
        match exc_info {
            Some(err) if self.headers_sent => return Err(err),
            Some(_) => {}
            None if self.head.is_some() => {
                return Err(AppError::new("start_response called a second time without exc_info"));
            }
            None => {}
        }
        self.head = Some(build_head(status, headers)?);
        Ok(())
    }

    /// Shorthand for `call(status, headers, None)`.
    #[track_caller]
    pub fn start(&mut self, status: &str, headers: Vec<(String, String)>) -> Result<(), AppError> {
        self.call(status, headers, None)
    }

    pub fn is_called(&self) -> bool {
        self.head.is_some()
    }

    /// The pending status and headers.
    pub fn head(&self) -> Option<&ResponseHead> {
        self.head.as_ref()
    }

    /// The status line and headers have been handed to the connection.
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub(crate) fn take_head(&mut self) -> Result<ResponseHead, AppError> {
        let head = self
            .head
            .clone()
            .ok_or_else(|| AppError::new("application returned without calling start_response"))?;
        self.headers_sent = true;
        Ok(head)
    }
}

#[track_caller]
fn build_head(status: &str, headers: Vec<(String, String)>) -> Result<ResponseHead, AppError> {
    let status = status.trim();
    let code = status
        .split_once(' ')
        .map_or(status, |(code, _)| code)
        .parse::<u16>()
        .ok()
        .filter(|c| (100..1000).contains(c))
        .ok_or_else(|| AppError::new(format!("invalid status line {status:?}")))?;
    if status.contains(['\r', '\n']) {
        return Err(AppError::new("status line contains a newline"));
    }

    let mut kept = Vec::with_capacity(headers.len());
    let mut content_length = None;
    let mut close = false;

    for (name, value) in headers {
        if name.is_empty() || name.contains([':', '\r', '\n']) {
            return Err(AppError::new(format!("illegal header name {name:?}")));
        }
        if value.contains(['\r', '\n']) {
            return Err(AppError::new(format!("illegal value for header {name}")));
        }

        if name.eq_ignore_ascii_case("server") || name.eq_ignore_ascii_case("date") {
            continue;
        }
        if name.eq_ignore_ascii_case("connection") && code != 101 {
            close |= value.trim().eq_ignore_ascii_case("close");
            continue;
        }
        if name.eq_ignore_ascii_case("content-length") {
            let len = value
                .trim()
                .parse::<u64>()
                .map_err(|_| AppError::new(format!("invalid Content-Length {value:?}")))?;
            content_length = Some(len);
        }
        kept.push((name, value));
    }

    Ok(ResponseHead {
        status: status.to_string(),
        code,
        headers: kept,
        content_length,
        close,
    })
}

/// File served with sendfile.
#[derive(Debug)]
pub struct FileBody {
    pub file: File,
    /// Bytes to send from the current position.
    pub len: u64,
}

impl FileBody {
    /// Serves `file` from its current position to the end.
    pub fn new(mut file: File) -> io::Result<Self> {
        let size = file.metadata()?.len();
        let pos = file.stream_position()?;
        Ok(Self {
            file,
            len: size.saturating_sub(pos),
        })
    }

    /// Serves `len` bytes starting at `offset`.
    pub fn range(mut file: File, offset: u64, len: u64) -> io::Result<Self> {
        file.seek(SeekFrom::Start(offset))?;
        Ok(Self { file, len })
    }
}

pub type ChunkStream = Box<dyn Iterator<Item = Result<Bytes, AppError>> + Send>;

/// What the application returns.
pub enum ResponseBody {
    Empty,
    Full(Bytes),
    /// Chunks pulled one at a time on the task's thread.
    Stream(ChunkStream),
    File(FileBody),
}

impl ResponseBody {
    pub fn stream<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Result<Bytes, AppError>>,
        I::IntoIter: Send + 'static,
    {
        ResponseBody::Stream(Box::new(iter.into_iter()))
    }

    pub fn file(file: File) -> io::Result<Self> {
        FileBody::new(file).map(ResponseBody::File)
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Full(b) => write!(f, "Full({} bytes)", b.len()),
            ResponseBody::Stream(_) => f.write_str("Stream"),
            ResponseBody::File(file) => write!(f, "File({} bytes)", file.len),
        }
    }
}

impl From<&'static str> for ResponseBody {
    fn from(s: &'static str) -> Self {
        ResponseBody::Full(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for ResponseBody {
    fn from(s: String) -> Self {
        ResponseBody::Full(Bytes::from(s))
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(v: Vec<u8>) -> Self {
        ResponseBody::Full(Bytes::from(v))
    }
}

impl From<Bytes> for ResponseBody {
    fn from(b: Bytes) -> Self {
        ResponseBody::Full(b)
    }
}

/// A list of chunks; a single element has a known length.
impl From<Vec<Bytes>> for ResponseBody {
    fn from(mut chunks: Vec<Bytes>) -> Self {
        match chunks.len() {
            0 => ResponseBody::Empty,
            1 => ResponseBody::Full(chunks.remove(0)),
            _ => ResponseBody::stream(chunks.into_iter().map(Ok)),
        }
    }
}

/// Declared size of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    Known(u64),
    Unknown,
}

/// What a request task hands to its connection.
#[derive(Debug)]
pub enum Emit {
    /// Status, headers and the first chunk of the body.
    Head {
        head: ResponseHead,
        first: Option<Bytes>,
        length: BodyLength,
    },
    /// Status and headers of a file response.
    File { head: ResponseHead, body: FileBody },
    /// A further body chunk.
    Chunk(Bytes),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn drops_server_and_date() {
        let mut start = StartResponse::new();
        start
            .start(
                "200 OK",
                headers(&[("Server", "evil"), ("Date", "yesterday"), ("X-Id", "1")]),
            )
            .unwrap();
        let head = start.take_head().unwrap();
        assert_eq!(head.code, 200);
        assert_eq!(head.headers, headers(&[("X-Id", "1")]));
    }

    #[test]
    fn exc_info_replaces_unsent_status() {
        let mut start = StartResponse::new();
        start.start("200 OK", vec![]).unwrap();
        start
            .call("500 Internal Server Error", vec![], Some(AppError::new("late failure")))
            .unwrap();
        assert_eq!(start.take_head().unwrap().code, 500);

        let err = start
            .call("500 Internal Server Error", vec![], Some(AppError::new("after send")))
            .unwrap_err();
        assert_eq!(err.message(), "after send");
    }

    #[test]
    fn rejects_bad_content_length() {
        let mut start = StartResponse::new();
        assert!(start.start("200 OK", headers(&[("Content-Length", "-1")])).is_err());
        assert!(start.start("200 OK", headers(&[("Content-Length", "ten")])).is_err());
        assert!(!start.is_called());
    }

    #[test]
    fn error_page_is_self_delimited() {
        let page = error_page(StatusCode::LengthRequired, "hearth");
        let text = std::str::from_utf8(&page).unwrap();
        assert!(text.starts_with("HTTP/1.0 411 Length Required\r\n"));
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        assert!(head.contains(&format!("Content-Length: {}", body.len())));
    }
}
