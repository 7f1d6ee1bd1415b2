use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use bytes::Bytes;

use crate::app;
use crate::error::{AppError, TaskError};
use crate::http::request::{Input, Method, Request, Version};
use crate::http::response::{BodyLength, Emit, StartResponse};
use crate::scheduler::{Continuation, HubHandle, Payload, TaskContext};
use crate::server::socket::Peer;

/// Connection facts shared by every request on it.
#[derive(Debug, Clone)]
pub(crate) struct Origin {
    pub peer: Peer,
    pub server_name: String,
    pub server_port: u16,
    pub hub: HubHandle,
    pub fd: RawFd,
}

/// Everything the application sees of one request.
pub struct Environ {
    pub method: Method,
    /// Percent-decoded path.
    pub path: String,
    pub query: String,
    /// Request target exactly as sent.
    pub target: String,
    pub version: Version,
    pub headers: Vec<(String, String)>,
    pub remote_addr: String,
    pub remote_port: u16,
    pub server_name: String,
    pub server_port: u16,
    pub url_scheme: &'static str,
    input: Input,
    task: TaskContext<Emit>,
    hub: HubHandle,
    upgrade_fd: Option<RawFd>,
}

impl Environ {
    pub(crate) fn new(req: Request, origin: Origin, task: TaskContext<Emit>) -> io::Result<Self> {
        let input = match req.body {
            Some(body) => body.into_input()?,
            None => Input::empty(),
        };
        Ok(Self {
            method: req.method,
            path: req.path,
            query: req.query,
            target: req.target,
            version: req.version,
            headers: req.headers,
            remote_addr: origin.peer.addr,
            remote_port: origin.peer.port,
            server_name: origin.server_name,
            server_port: origin.server_port,
            url_scheme: "http",
            input,
            task,
            hub: origin.hub,
            upgrade_fd: req.upgrade.then_some(origin.fd),
        })
    }

    /// Case-insensitive header lookup; the first match wins.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// The request body.
    pub fn input(&mut self) -> &mut Input {
        &mut self.input
    }

    /// The task running this request.
    pub fn task(&self) -> &TaskContext<Emit> {
        &self.task
    }

    /// Handle that resumes this request's task once it suspends.
    pub fn continuation(&self) -> Continuation {
        self.task.continuation()
    }

    /// Parks the request until its continuation is resumed or `timeout`
    /// passes.
    pub fn suspend(&self, timeout: Option<Duration>) -> Result<Option<Payload>, TaskError> {
        self.task.suspend(timeout)
    }

    /// Sends body data before `call` returns, flushing the status line and
    /// headers first if they have not gone out yet.
    ///
    /// Once headers are out the length is unknown to the server unless the
    /// application declared one, so HTTP/1.1 bodies go out chunked. Data
    /// past a declared `Content-Length` is dropped.
    pub fn write(&self, start_response: &mut StartResponse, data: impl Into<Bytes>) -> Result<(), AppError> {
        let data = data.into();
        let emit = if start_response.headers_sent() {
            if data.is_empty() {
                return Ok(());
            }
            Emit::Chunk(data)
        } else {
            Emit::Head {
                head: start_response.take_head()?,
                first: (!data.is_empty()).then_some(data),
                length: BodyLength::Unknown,
            }
        };
        app::send(self, emit).map(drop)
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Raw socket of an upgraded connection. The application owns the
    /// protocol from here; the server closes the socket once the task ends.
    pub fn upgrade_fd(&self) -> Option<RawFd> {
        self.upgrade_fd
    }

    pub fn is_upgrade(&self) -> bool {
        self.upgrade_fd.is_some()
    }
}

impl std::fmt::Debug for Environ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environ")
            .field("method", &self.method)
            .field("target", &self.target)
            .field("version", &self.version)
            .field("remote_addr", &self.remote_addr)
            .field("task", &self.task.id())
            .finish()
    }
}
