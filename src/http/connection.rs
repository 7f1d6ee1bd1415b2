use std::io;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::app;
use crate::error::TaskError;
use crate::http::date::http_date;
use crate::http::environ::{Environ, Origin};
use crate::http::parser::Parser;
use crate::http::request::{Assembler, Method, Request, RequestQueue, Version};
use crate::http::response::{BodyLength, CONTINUE, Emit, FileBody, ResponseHead, StatusCode, error_page};
use crate::http::writer::{HeadContext, LAST_CHUNK, OutputBucket, ResponseFraming, assemble_head, flush, send_file};
use crate::scheduler::{Resume, Step, Task};
use crate::server::ServerContext;
use crate::server::socket::{Peer, Socket, ready_now};

const READ_BUFFER: usize = 16 * 1024;

pub enum ConnectionState {
    Reading,
    Dispatching,
    Responding(Box<Request>),
    /// Answer with an error page, then close.
    Error(StatusCode),
    Closed,
}

/// One client connection: reads requests, runs each on its own task and
/// writes the answers back in arrival order.
pub struct Connection<S: Socket> {
    socket: S,
    peer: Peer,
    cx: Rc<ServerContext>,
    parser: Parser,
    queue: RequestQueue,
    buf: Vec<u8>,
    /// No more requests will be read: peer closed, parse failure or upgrade.
    read_closed: bool,
    served: u64,
    state: ConnectionState,
}

/// What the task has put on the wire so far.
#[derive(Default)]
struct Progress {
    framing: Option<ResponseFraming>,
    status: u16,
    body_sent: u64,
    /// Any byte of the response reached the socket.
    flushed: bool,
}

enum Flow {
    More,
    /// The body is complete; the application is not pulled again.
    Enough,
}

struct Exchange {
    method: Method,
    path: String,
    version: Version,
    referer: String,
    user_agent: String,
    started: Instant,
}

impl<S: Socket> Connection<S> {
    pub(crate) fn new(socket: S, peer: Peer, cx: Rc<ServerContext>) -> Self {
        Self {
            socket,
            peer,
            cx,
            parser: Parser::new(),
            queue: RequestQueue::new(),
            buf: vec![0; READ_BUFFER],
            read_closed: false,
            served: 0,
            state: ConnectionState::Reading,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            self.state = match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => self.read_requests().await?,
                ConnectionState::Dispatching => self.dispatch(),
                ConnectionState::Responding(req) => self.respond(*req).await,
                ConnectionState::Error(status) => self.write_error(status, None).await,
                ConnectionState::Closed => break,
            };
        }
        let _ = self.socket.set_cork(false);
        let _ = self.socket.set_nodelay();
        debug!(peer = %self.peer.addr, served = self.served, "connection closed");
        Ok(())
    }

    async fn read_requests(&mut self) -> anyhow::Result<ConnectionState> {
        loop {
            if self.queue.front_ready() {
                return Ok(ConnectionState::Dispatching);
            }
            if self.read_closed {
                return Ok(ConnectionState::Closed);
            }
            self.send_continue().await?;

            let idle = self.queue.is_empty() && self.parser.is_idle();
            let timeout = if idle && self.served > 0 {
                self.cx.config.keepalive_timeout()
            } else {
                self.cx.config.read_timeout()
            };

            match tokio::time::timeout(timeout, self.read_some()).await {
                Err(_) if idle => {
                    debug!(peer = %self.peer.addr, "idle connection timed out");
                    return Ok(ConnectionState::Closed);
                }
                Err(_) => {
                    self.queue.record_error(StatusCode::RequestTimeout);
                    self.read_closed = true;
                }
                Ok(Ok(0)) => {
                    if !idle {
                        self.queue.record_error(StatusCode::ServiceUnavailable);
                    }
                    self.read_closed = true;
                }
                Ok(Ok(n)) => self.parse(n),
                Ok(Err(e)) => {
                    if e.kind() == io::ErrorKind::ConnectionReset {
                        debug!(peer = %self.peer.addr, "connection reset by peer");
                    } else {
                        error!(peer = %self.peer.addr, error = %e, "read failed");
                    }
                    if idle {
                        return Ok(ConnectionState::Closed);
                    }
                    self.queue.record_error(StatusCode::InternalServerError);
                    self.read_closed = true;
                }
            }
        }
    }

    async fn read_some(&mut self) -> io::Result<usize> {
        loop {
            self.socket.ready(tokio::io::Interest::READABLE).await?;
            match self.socket.try_read(&mut self.buf) {
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => continue,
                other => return other,
            }
        }
    }

    fn parse(&mut self, n: usize) {
        let mut assembler = Assembler::new(&mut self.queue, &self.cx.limits);
        if let Err(e) = self.parser.execute(&self.buf[..n], &mut assembler) {
            debug!(peer = %self.peer.addr, error = %e, "bad request");
            self.queue.record_error(e.status());
            self.read_closed = true;
        }
        if self.parser.is_upgraded() {
            self.read_closed = true;
        }
    }

    /// Owes `100 Continue` to a request at the front whose body has not
    /// arrived yet.
    async fn send_continue(&mut self) -> io::Result<()> {
        let Some(front) = self.queue.front_mut() else {
            return Ok(());
        };
        if !front.expect_continue {
            return Ok(());
        }
        front.expect_continue = false;
        self.write_raw(Bytes::from_static(CONTINUE)).await
    }

    fn dispatch(&mut self) -> ConnectionState {
        match self.queue.pop_front() {
            Some(req) => match req.bad_request {
                Some(status) => ConnectionState::Error(status),
                None => ConnectionState::Responding(Box::new(req)),
            },
            None => ConnectionState::Reading,
        }
    }

    async fn respond(&mut self, mut req: Request) -> ConnectionState {
        if req.expect_continue {
            req.expect_continue = false;
            if self.write_raw(Bytes::from_static(CONTINUE)).await.is_err() {
                return ConnectionState::Closed;
            }
        }

        let exchange = Exchange {
            method: req.method,
            path: req.path.clone(),
            version: req.version,
            referer: req.header("referer").unwrap_or("-").to_string(),
            user_agent: req.header("user-agent").unwrap_or("-").to_string(),
            started: req.received_at,
        };
        let mut keep_alive = req.keep_alive;

        let app = Arc::clone(&self.cx.app);
        let origin = self.origin();
        let spawned = Task::spawn(self.cx.config.task_stack_size, move |ctx| {
            let mut environ = Environ::new(req, origin, ctx)?;
            app::respond(app.as_ref(), &mut environ)
        });
        let mut task = match spawned {
            Ok(task) => task,
            Err(e) => {
                error!(peer = %self.peer.addr, error = %e, "failed to start request task");
                return self.write_error(StatusCode::InternalServerError, Some(&exchange)).await;
            }
        };

        let mut progress = Progress::default();
        let mut broken = false;
        let mut resume = Resume::Start;

        let failure = loop {
            resume = match task.switch(resume) {
                Step::Suspended(wait) => {
                    let own = wait.fd.is_none_or(|fd| fd == self.socket.as_raw_fd());
                    let outcome = match wait.interest.to_tokio() {
                        Some(interest) if own => task.wait_with(&wait, ready_now(&self.socket, interest)).await,
                        _ => task.wait(&wait).await,
                    };
                    if outcome.timed_out {
                        keep_alive = false;
                    }
                    outcome.resume
                }
                Step::Yielded(emit) => {
                    match self.write_emit(emit, &exchange, keep_alive, &mut progress).await {
                        Ok(Flow::More) => Resume::Value(None),
                        Ok(Flow::Enough) => Resume::Error(TaskError::Cancelled),
                        Err(e) => {
                            debug!(peer = %self.peer.addr, error = %e, "write failed");
                            broken = true;
                            Resume::Cancel
                        }
                    }
                }
                Step::Completed => break None,
                Step::Failed(err) => break Some(err),
            };
        };
        if let Some(framing) = progress.framing {
            keep_alive &= framing.keep_alive;
        }

        if let Some(err) = failure {
            error!(
                task = %task.id(),
                file = err.file(),
                line = err.line(),
                error = %err,
                path = %exchange.path,
                "application failed"
            );
            if !progress.flushed && !broken {
                return self.write_error(StatusCode::InternalServerError, Some(&exchange)).await;
            }
            return ConnectionState::Closed;
        }
        drop(task);

        if !broken {
            if let Err(e) = self.finish_body(&mut progress, &mut keep_alive).await {
                debug!(peer = %self.peer.addr, error = %e, "write failed");
                broken = true;
            }
        }
        let _ = self.socket.set_cork(false);

        self.served += 1;
        self.access_log(&exchange, progress.status, progress.body_sent);

        if broken || !keep_alive || self.parser.is_upgraded() {
            ConnectionState::Closed
        } else {
            ConnectionState::Reading
        }
    }

    async fn write_emit(
        &mut self,
        emit: Emit,
        exchange: &Exchange,
        keep_alive: bool,
        progress: &mut Progress,
    ) -> io::Result<Flow> {
        match emit {
            Emit::Head { head, first, length } => {
                let mut bucket = self.start_head(&head, length, exchange, keep_alive, progress);
                let flow = match first {
                    Some(data) => push_body(&mut bucket, data, progress),
                    None => body_flow(progress),
                };
                self.flush_bucket(&mut bucket, progress).await?;
                Ok(flow)
            }
            Emit::File { head, body } => {
                let length = BodyLength::Known(body.len);
                let mut bucket = self.start_head(&head, length, exchange, keep_alive, progress);
                self.flush_bucket(&mut bucket, progress).await?;
                self.write_file(body, progress).await?;
                Ok(Flow::Enough)
            }
            Emit::Chunk(data) => {
                let mut bucket = OutputBucket::new();
                let flow = push_body(&mut bucket, data, progress);
                self.flush_bucket(&mut bucket, progress).await?;
                Ok(flow)
            }
        }
    }

    fn start_head(
        &self,
        head: &ResponseHead,
        length: BodyLength,
        exchange: &Exchange,
        keep_alive: bool,
        progress: &mut Progress,
    ) -> OutputBucket {
        if let Err(e) = self.socket.set_cork(true) {
            debug!(error = %e, "cork failed");
        }
        let date = http_date();
        let cx = HeadContext {
            version: exchange.version,
            head_request: exchange.method == Method::HEAD,
            keep_alive,
            server_name: &self.cx.config.server_name,
            date: &date,
        };
        let (bytes, framing) = assemble_head(head, length, &cx);
        progress.framing = Some(framing);
        progress.status = head.code;

        let mut bucket = OutputBucket::new();
        bucket.push(bytes);
        bucket
    }

    async fn write_file(&mut self, body: FileBody, progress: &mut Progress) -> io::Result<()> {
        let Some(framing) = progress.framing else {
            return Ok(());
        };
        let len = match framing.content_length {
            Some(limit) => body.len.min(limit),
            None => body.len,
        };
        if !framing.body_allowed || len == 0 {
            return Ok(());
        }
        let sent = send_file(&self.socket, &body.file, len, self.cx.config.write_timeout()).await?;
        progress.body_sent += sent;
        progress.flushed |= sent > 0;
        Ok(())
    }

    async fn finish_body(&mut self, progress: &mut Progress, keep_alive: &mut bool) -> io::Result<()> {
        let Some(framing) = progress.framing else {
            return Ok(());
        };
        if framing.chunked {
            let mut bucket = OutputBucket::new();
            bucket.push_static(LAST_CHUNK);
            self.flush_bucket(&mut bucket, progress).await?;
        }
        if let Some(expected) = framing.content_length {
            if framing.body_allowed && progress.body_sent < expected {
                debug!(
                    peer = %self.peer.addr,
                    expected,
                    sent = progress.body_sent,
                    "response shorter than its Content-Length"
                );
                *keep_alive = false;
            }
        }
        Ok(())
    }

    async fn flush_bucket(&mut self, bucket: &mut OutputBucket, progress: &mut Progress) -> io::Result<()> {
        let result = flush(&self.socket, bucket, self.cx.config.write_timeout()).await;
        progress.flushed |= bucket.sent() > 0;
        result
    }

    async fn write_raw(&mut self, bytes: Bytes) -> io::Result<()> {
        let mut bucket = OutputBucket::new();
        bucket.push(bytes);
        flush(&self.socket, &mut bucket, self.cx.config.write_timeout()).await
    }

    async fn write_error(&mut self, status: StatusCode, exchange: Option<&Exchange>) -> ConnectionState {
        let page = error_page(status, &self.cx.config.server_name);
        let len = page.len() as u64;
        if let Err(e) = self.write_raw(page).await {
            debug!(peer = %self.peer.addr, error = %e, "failed to write error page");
        }
        let _ = self.socket.set_cork(false);
        if let Some(exchange) = exchange {
            self.access_log(exchange, status.as_u16(), len);
        } else if status != StatusCode::RequestTimeout {
            warn!(peer = %self.peer.addr, status = status.as_u16(), "rejected request");
        }
        ConnectionState::Closed
    }

    fn origin(&self) -> Origin {
        Origin {
            peer: self.peer.clone(),
            server_name: self.cx.config.server_name.clone(),
            server_port: self.cx.server_port,
            hub: self.cx.hub.clone(),
            fd: self.socket.as_raw_fd(),
        }
    }

    fn access_log(&self, exchange: &Exchange, status: u16, bytes: u64) {
        if !self.cx.config.access_log {
            return;
        }
        info!(
            target: "hearth::access",
            remote = %self.peer.addr,
            method = exchange.method.as_str(),
            path = %exchange.path,
            protocol = exchange.version.as_str(),
            status,
            bytes,
            elapsed_ms = elapsed_ms(exchange.started),
            referer = %exchange.referer,
            user_agent = %exchange.user_agent,
        );
    }
}

/// Queues one piece of body, framed and clipped to the declared length.
fn push_body(bucket: &mut OutputBucket, data: Bytes, progress: &mut Progress) -> Flow {
    let Some(framing) = progress.framing else {
        return Flow::Enough;
    };
    if !framing.body_allowed {
        return Flow::Enough;
    }
    if framing.chunked {
        progress.body_sent += data.len() as u64;
        bucket.push_chunk(data);
        return Flow::More;
    }
    match framing.content_length {
        Some(limit) => {
            let room = limit.saturating_sub(progress.body_sent);
            let take = (data.len() as u64).min(room) as usize;
            progress.body_sent += take as u64;
            bucket.push(data.slice(..take));
            body_flow(progress)
        }
        None => {
            progress.body_sent += data.len() as u64;
            bucket.push(data);
            Flow::More
        }
    }
}

fn body_flow(progress: &Progress) -> Flow {
    match progress.framing {
        Some(f) if !f.body_allowed => Flow::Enough,
        Some(ResponseFraming {
            content_length: Some(limit),
            chunked: false,
            ..
        }) if progress.body_sent >= limit => Flow::Enough,
        _ => Flow::More,
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
