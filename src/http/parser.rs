//! Incremental HTTP/1.x request parser.
//!
//! Bytes are fed with [`Parser::execute`] in whatever pieces the socket
//! delivers. Events are reported to a [`ParserHandler`] in message order:
//!
//! ```text
//! on_message_begin
//! on_url*                       request target
//! (on_header_field on_header_value)*
//! on_headers_complete
//! on_body*                      de-chunked body bytes
//! on_message_complete
//! ```
//!
//! The request head is parsed with `httparse` once it is complete; body
//! framing (Content-Length or chunked) is tracked here so that a body may
//! arrive across any number of reads. After an upgrade every further byte
//! is delivered through `on_body` and no new message starts.

use thiserror::Error;

use crate::http::request::Version;
use crate::http::response::StatusCode;

/// Largest request head accepted.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Most header fields in one request.
pub const MAX_HEADERS: usize = 128;
const MAX_TRAILER_LINE: usize = 8 * 1024;

/// Returned by a handler callback to abandon the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reject(pub StatusCode);

pub type Verdict = Result<(), Reject>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("request rejected with status {}", .0.as_u16())]
    Rejected(StatusCode),
    #[error("malformed request: {0}")]
    Invalid(&'static str),
}

impl ParseError {
    /// Status to answer the offending request with.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::Rejected(status) => *status,
            ParseError::Invalid(_) => StatusCode::BadRequest,
        }
    }
}

impl From<Reject> for ParseError {
    fn from(reject: Reject) -> Self {
        ParseError::Rejected(reject.0)
    }
}

/// How the body of a message is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    None,
    Length(u64),
    Chunked,
}

/// Facts about a message known once its head is complete.
#[derive(Debug, Clone, Copy)]
pub struct HeadInfo<'a> {
    pub method: &'a str,
    pub version: Version,
    pub framing: Framing,
    pub upgrade: bool,
}

pub trait ParserHandler {
    fn on_message_begin(&mut self) -> Verdict;
    fn on_url(&mut self, fragment: &[u8]) -> Verdict;
    fn on_header_field(&mut self, fragment: &[u8]) -> Verdict;
    fn on_header_value(&mut self, fragment: &[u8]) -> Verdict;
    fn on_headers_complete(&mut self, head: &HeadInfo<'_>) -> Verdict;
    fn on_body(&mut self, fragment: &[u8]) -> Verdict;
    fn on_message_complete(&mut self) -> Verdict;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size { value: u64, digits: usize, extension: bool },
    SizeLf { value: u64 },
    Data(u64),
    DataCr,
    DataLf,
    Trailer { line: usize },
    TrailerLf { line: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Head,
    Body(u64),
    Chunked(Chunk),
    Upgraded,
    Failed,
}

pub struct Parser {
    state: State,
    head: Vec<u8>,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state: State::Start,
            head: Vec::with_capacity(1024),
        }
    }

    /// Forgets any partial message.
    pub fn reset(&mut self) {
        self.state = State::Start;
        self.head.clear();
    }

    /// True between messages.
    pub fn is_idle(&self) -> bool {
        self.state == State::Start
    }

    pub fn is_upgraded(&self) -> bool {
        self.state == State::Upgraded
    }

    /// Feeds `data`, returning how many bytes were consumed.
    ///
    /// Everything is consumed unless an error occurs; after an error the
    /// parser refuses further input until [`Parser::reset`].
    pub fn execute<H: ParserHandler>(
        &mut self,
        data: &[u8],
        handler: &mut H,
    ) -> Result<usize, ParseError> {
        match self.run(data, handler) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.state = State::Failed;
                self.head.clear();
                Err(e)
            }
        }
    }

    fn run<H: ParserHandler>(&mut self, data: &[u8], handler: &mut H) -> Result<usize, ParseError> {
        let mut pos = 0;

        while pos < data.len() {
            match self.state {
                State::Failed => return Err(ParseError::Invalid("parser is in a failed state")),
                State::Start => {
                    // tolerate stray line breaks between pipelined messages
                    if matches!(data[pos], b'\r' | b'\n') {
                        pos += 1;
                        continue;
                    }
                    handler.on_message_begin()?;
                    self.state = State::Head;
                }
                State::Head => {
                    let room = MAX_HEAD_SIZE - self.head.len();
                    let take = room.min(data.len() - pos);
                    let before = self.head.len();
                    self.head.extend_from_slice(&data[pos..pos + take]);

                    match parse_head(&self.head, handler)? {
                        Some((end, framing, upgrade)) => {
                            pos += end - before;
                            self.head.clear();
                            self.state = self.after_head(framing, upgrade, handler)?;
                        }
                        None if self.head.len() >= MAX_HEAD_SIZE => {
                            return Err(ParseError::Rejected(StatusCode::BadRequest));
                        }
                        None => pos += take,
                    }
                }
                State::Body(remaining) => {
                    let take = remaining.min((data.len() - pos) as u64) as usize;
                    handler.on_body(&data[pos..pos + take])?;
                    pos += take;
                    let left = remaining - take as u64;
                    if left == 0 {
                        handler.on_message_complete()?;
                        self.state = State::Start;
                    } else {
                        self.state = State::Body(left);
                    }
                }
                State::Chunked(chunk) => {
                    let (used, next) = self.chunk_step(chunk, &data[pos..], handler)?;
                    pos += used;
                    self.state = next;
                }
                State::Upgraded => {
                    handler.on_body(&data[pos..])?;
                    pos = data.len();
                }
            }
        }

        Ok(pos)
    }

    fn after_head<H: ParserHandler>(
        &self,
        framing: Framing,
        upgrade: bool,
        handler: &mut H,
    ) -> Result<State, ParseError> {
        if upgrade {
            handler.on_message_complete()?;
            return Ok(State::Upgraded);
        }
        match framing {
            Framing::Chunked => Ok(State::Chunked(Chunk::Size {
                value: 0,
                digits: 0,
                extension: false,
            })),
            Framing::Length(n) if n > 0 => Ok(State::Body(n)),
            _ => {
                handler.on_message_complete()?;
                Ok(State::Start)
            }
        }
    }

    /// Advances the chunked decoder over `data`, returning bytes used and
    /// the next state.
    fn chunk_step<H: ParserHandler>(
        &self,
        chunk: Chunk,
        data: &[u8],
        handler: &mut H,
    ) -> Result<(usize, State), ParseError> {
        if let Chunk::Data(remaining) = chunk {
            let take = remaining.min(data.len() as u64) as usize;
            handler.on_body(&data[..take])?;
            let left = remaining - take as u64;
            let next = if left == 0 { Chunk::DataCr } else { Chunk::Data(left) };
            return Ok((take, State::Chunked(next)));
        }

        let byte = data[0];
        let next = match chunk {
            Chunk::Size {
                value,
                digits,
                extension,
            } => match byte {
                b'\r' if digits > 0 => Chunk::SizeLf { value },
                _ if extension => chunk,
                b';' | b' ' | b'\t' if digits > 0 => Chunk::Size {
                    value,
                    digits,
                    extension: true,
                },
                _ => {
                    let digit = (byte as char)
                        .to_digit(16)
                        .ok_or(ParseError::Invalid("bad chunk size"))?;
                    if value > u64::MAX >> 4 {
                        return Err(ParseError::Invalid("chunk size overflow"));
                    }
                    Chunk::Size {
                        value: value << 4 | u64::from(digit),
                        digits: digits + 1,
                        extension: false,
                    }
                }
            },
            Chunk::SizeLf { value } => {
                expect(byte, b'\n')?;
                if value == 0 {
                    Chunk::Trailer { line: 0 }
                } else {
                    Chunk::Data(value)
                }
            }
            Chunk::DataCr => {
                expect(byte, b'\r')?;
                Chunk::DataLf
            }
            Chunk::DataLf => {
                expect(byte, b'\n')?;
                Chunk::Size {
                    value: 0,
                    digits: 0,
                    extension: false,
                }
            }
            Chunk::Trailer { line } => {
                if byte == b'\r' {
                    Chunk::TrailerLf { line }
                } else if line >= MAX_TRAILER_LINE {
                    return Err(ParseError::Rejected(StatusCode::BadRequest));
                } else {
                    Chunk::Trailer { line: line + 1 }
                }
            }
            Chunk::TrailerLf { line } => {
                expect(byte, b'\n')?;
                if line == 0 {
                    handler.on_message_complete()?;
                    return Ok((1, State::Start));
                }
                Chunk::Trailer { line: 0 }
            }
            Chunk::Data(_) => unreachable!("handled above"),
        };
        Ok((1, State::Chunked(next)))
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

fn expect(byte: u8, wanted: u8) -> Result<(), ParseError> {
    if byte == wanted {
        Ok(())
    } else {
        Err(ParseError::Invalid("bad chunk framing"))
    }
}

/// Parses a complete head out of `buf` and reports it to `handler`.
///
/// Returns `None` while the head is still incomplete, otherwise the head
/// length, body framing and whether the connection is being upgraded.
fn parse_head<H: ParserHandler>(
    buf: &[u8],
    handler: &mut H,
) -> Result<Option<(usize, Framing, bool)>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let end = match req.parse(buf) {
        Ok(httparse::Status::Complete(end)) => end,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => {
            return Err(ParseError::Rejected(StatusCode::BadRequest));
        }
        Err(httparse::Error::Version) => return Err(ParseError::Invalid("unsupported version")),
        Err(_) => return Err(ParseError::Invalid("bad request head")),
    };

    let method = req.method.ok_or(ParseError::Invalid("missing method"))?;
    let target = req.path.ok_or(ParseError::Invalid("missing target"))?;
    let version = match req.version {
        Some(0) => Version::Http10,
        Some(1) => Version::Http11,
        _ => return Err(ParseError::Invalid("unsupported version")),
    };

    handler.on_url(target.as_bytes())?;

    let mut content_length: Option<u64> = None;
    let mut chunked = false;
    let mut upgrade_requested = false;
    let mut connection_upgrade = false;

    for header in req.headers.iter() {
        handler.on_header_field(header.name.as_bytes())?;
        handler.on_header_value(header.value)?;

        if header.name.eq_ignore_ascii_case("content-length") {
            let len = parse_content_length(header.value)?;
            if content_length.is_some_and(|prev| prev != len) {
                return Err(ParseError::Invalid("conflicting content-length"));
            }
            content_length = Some(len);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = last_token(header.value).eq_ignore_ascii_case(b"chunked");
        } else if header.name.eq_ignore_ascii_case("upgrade") {
            upgrade_requested = true;
        } else if header.name.eq_ignore_ascii_case("connection") {
            connection_upgrade |= has_token(header.value, b"upgrade");
        }
    }

    let framing = if chunked {
        Framing::Chunked
    } else {
        content_length.map_or(Framing::None, Framing::Length)
    };
    let upgrade = (upgrade_requested && connection_upgrade) || method == "CONNECT";

    handler.on_headers_complete(&HeadInfo {
        method,
        version,
        framing,
        upgrade,
    })?;

    Ok(Some((end, framing, upgrade)))
}

fn parse_content_length(value: &[u8]) -> Result<u64, ParseError> {
    let value = value.trim_ascii();
    if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
        return Err(ParseError::Invalid("bad content-length"));
    }
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ParseError::Invalid("bad content-length"))
}

fn tokens(value: &[u8]) -> impl Iterator<Item = &[u8]> {
    value
        .split(|b| *b == b',')
        .map(<[u8]>::trim_ascii)
        .filter(|t| !t.is_empty())
}

fn last_token(value: &[u8]) -> &[u8] {
    tokens(value).last().unwrap_or_default()
}

/// Case-insensitive search of a comma separated header value.
pub fn has_token(value: &[u8], token: &[u8]) -> bool {
    tokens(value).any(|t| t.eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lists() {
        assert!(has_token(b"keep-alive, Upgrade", b"upgrade"));
        assert!(!has_token(b"close", b"upgrade"));
        assert_eq!(last_token(b"gzip, chunked"), b"chunked");
        assert_eq!(last_token(b""), b"");
    }

    #[test]
    fn content_length_must_be_digits() {
        assert_eq!(parse_content_length(b" 42 "), Ok(42));
        assert!(parse_content_length(b"-1").is_err());
        assert!(parse_content_length(b"4 2").is_err());
    }
}
