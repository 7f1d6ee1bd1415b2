use std::fs::File;
use std::io::{self, IoSlice, Seek};
use std::os::fd::AsRawFd;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::Interest;

use crate::http::request::Version;
use crate::http::response::{BodyLength, ResponseHead};
use crate::server::socket::Socket;

/// Most segments handed to one vectored write.
const MAX_IOVECS: usize = 64;

pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Ordered byte segments waiting to go out, with a cursor marking how
/// far they have been written.
///
/// Segments are never modified; a short write only moves the cursor.
#[derive(Debug, Default)]
pub struct OutputBucket {
    segments: Vec<Bytes>,
    index: usize,
    offset: usize,
    total: usize,
    sent: usize,
}

impl OutputBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.total += segment.len();
        self.segments.push(segment);
    }

    pub fn push_static(&mut self, segment: &'static [u8]) {
        self.push(Bytes::from_static(segment));
    }

    /// Adds `data` framed as one chunk of a chunked body.
    pub fn push_chunk(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let mut size = BytesMut::with_capacity(18);
        size.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
        self.push(size.freeze());
        self.push(data);
        self.push_static(b"\r\n");
    }

    pub fn total_len(&self) -> usize {
        self.total
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn remaining(&self) -> usize {
        self.total - self.sent
    }

    pub fn is_drained(&self) -> bool {
        self.sent == self.total
    }

    /// Unsent bytes as slices for one vectored write.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        let mut slices = Vec::with_capacity((self.segments.len() - self.index).min(MAX_IOVECS));
        for (i, segment) in self.segments[self.index..].iter().enumerate().take(MAX_IOVECS) {
            let start = if i == 0 { self.offset } else { 0 };
            slices.push(IoSlice::new(&segment[start..]));
        }
        slices
    }

    /// Moves the cursor past `n` written bytes.
    pub fn advance(&mut self, mut n: usize) {
        n = n.min(self.remaining());
        self.sent += n;
        while n > 0 {
            let left_in_segment = self.segments[self.index].len() - self.offset;
            if n < left_in_segment {
                self.offset += n;
                return;
            }
            n -= left_in_segment;
            self.index += 1;
            self.offset = 0;
        }
    }
}

/// Per-request facts that shape the header block.
#[derive(Debug, Clone, Copy)]
pub struct HeadContext<'a> {
    pub version: Version,
    pub head_request: bool,
    pub keep_alive: bool,
    pub server_name: &'a str,
    pub date: &'a [u8],
}

/// Body framing decided while assembling headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFraming {
    pub keep_alive: bool,
    pub chunked: bool,
    /// Body bytes to write, when bounded.
    pub content_length: Option<u64>,
    pub body_allowed: bool,
}

/// Serializes the status line and headers and decides body framing.
pub fn assemble_head(head: &ResponseHead, length: BodyLength, cx: &HeadContext<'_>) -> (Bytes, ResponseFraming) {
    let body_allowed = head.allows_body(cx.head_request);
    let mut keep_alive = cx.keep_alive && !head.close;
    let mut chunked = false;
    let mut content_length = head.content_length;
    let mut inferred = None;

    if content_length.is_none() {
        match length {
            BodyLength::Known(n) => {
                let informational = (100..200).contains(&head.code) || head.code == 204 || head.code == 304;
                if !informational {
                    inferred = Some(n);
                }
                content_length = Some(n);
            }
            BodyLength::Unknown if body_allowed => match cx.version {
                Version::Http11 => chunked = true,
                Version::Http10 => keep_alive = false,
            },
            BodyLength::Unknown => {}
        }
    }

    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(cx.version.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(head.status.as_bytes());
    buf.put_slice(b"\r\n");

    for (name, value) in &head.headers {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    if let Some(n) = inferred {
        buf.put_slice(b"Content-Length: ");
        buf.put_slice(itoa::Buffer::new().format(n).as_bytes());
        buf.put_slice(b"\r\n");
    }
    if chunked {
        buf.put_slice(b"Transfer-Encoding: chunked\r\n");
    }
    if head.is_switching() {
        keep_alive = false;
    } else if keep_alive {
        buf.put_slice(b"Connection: Keep-Alive\r\n");
    } else {
        buf.put_slice(b"Connection: close\r\n");
    }

    buf.put_slice(b"Server: ");
    buf.put_slice(cx.server_name.as_bytes());
    buf.put_slice(b"\r\nDate: ");
    buf.put_slice(cx.date);
    buf.put_slice(b"\r\n\r\n");

    let framing = ResponseFraming {
        keep_alive,
        chunked,
        content_length: if body_allowed { content_length } else { Some(0) },
        body_allowed,
    };
    (buf.freeze(), framing)
}

/// Drains `bucket` into `socket`.
///
/// On `WouldBlock` the bucket keeps its cursor and the call waits for
/// write readiness; each wait is bounded by `timeout`.
pub async fn flush<S: Socket>(socket: &S, bucket: &mut OutputBucket, timeout: Duration) -> io::Result<()> {
    while !bucket.is_drained() {
        let written = {
            let slices = bucket.io_slices();
            socket.try_write_vectored(&slices)
        };
        match written {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => bucket.advance(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                writable(socket, timeout).await?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn writable<S: Socket>(socket: &S, timeout: Duration) -> io::Result<()> {
    match tokio::time::timeout(timeout, socket.ready(Interest::WRITABLE)).await {
        Ok(ready) => ready.map(|_| ()),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
    }
}

/// Copies `len` bytes of `file`, starting at its current position, to
/// `socket`. Returns the number of bytes sent, which is short only when
/// the file ends early.
pub async fn send_file<S: Socket>(socket: &S, file: &File, len: u64, timeout: Duration) -> io::Result<u64> {
    let mut offset = file_position(file)?;
    let mut sent = 0u64;

    while sent < len {
        let count = (len - sent).min(1 << 30) as usize;
        let result = socket.try_io(Interest::WRITABLE, || {
            sys_sendfile(socket.as_raw_fd(), file, &mut offset, count)
        });
        match result {
            Ok(0) => break,
            Ok(n) => sent += n as u64,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => writable(socket, timeout).await?,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(sent)
}

fn file_position(file: &File) -> io::Result<u64> {
    let mut handle = file;
    handle.stream_position()
}

#[cfg(target_os = "linux")]
fn sys_sendfile(out_fd: i32, file: &File, offset: &mut u64, count: usize) -> io::Result<usize> {
    let mut off = *offset as libc::off_t;
    let n = unsafe { libc::sendfile(out_fd, file.as_raw_fd(), &mut off, count) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    *offset = off as u64;
    Ok(n as usize)
}

#[cfg(not(target_os = "linux"))]
fn sys_sendfile(out_fd: i32, file: &File, offset: &mut u64, count: usize) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;

    let mut buf = vec![0u8; count.min(64 * 1024)];
    let n = file.read_at(&mut buf, *offset)?;
    if n == 0 {
        return Ok(0);
    }
    let written = unsafe { libc::write(out_fd, buf.as_ptr() as *const _, n) };
    if written < 0 {
        return Err(io::Error::last_os_error());
    }
    *offset += written as u64;
    Ok(written as usize)
}
