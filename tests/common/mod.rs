#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use hearth::scheduler::HubHandle;
use hearth::{Application, Config, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub fn config() -> Config {
    let mut config = Config::default();
    config.listen = "127.0.0.1:0".into();
    config.access_log = false;
    config.read_timeout_secs = 5;
    config
}

pub fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub struct Running {
    pub addr: SocketAddr,
    pub hub: HubHandle,
    pub handle: JoinHandle<anyhow::Result<()>>,
}

/// Starts a server on an ephemeral port. Call inside a `LocalSet`.
pub async fn start<A: Application>(config: Config, app: A) -> Running {
    let server = Server::bind(config).await.expect("bind");
    let addr = server.local_addr().expect("tcp address");
    let hub = server.hub();
    let handle = tokio::task::spawn_local(server.serve(app));
    Running { addr, hub, handle }
}

#[derive(Debug)]
pub struct Reply {
    pub version: u8,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_count(&self, name: &str) -> usize {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .count()
    }

    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).expect("utf-8 body")
    }
}

/// Raw HTTP client over loopback TCP.
pub struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub async fn send(&mut self, raw: &[u8]) {
        self.stream.write_all(raw).await.expect("write request");
    }

    pub async fn get(&mut self, path: &str) -> Reply {
        let raw = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        self.send(raw.as_bytes()).await;
        self.read_reply().await
    }

    pub async fn read_reply(&mut self) -> Reply {
        self.read(true).await
    }

    /// Reads a reply that carries no body whatever its headers say, such
    /// as the answer to a HEAD request.
    pub async fn read_head(&mut self) -> Reply {
        self.read(false).await
    }

    /// True when the server closes the connection without sending more.
    pub async fn is_closed(&mut self) -> bool {
        if !self.buf.is_empty() {
            return false;
        }
        self.fill().await == Some(0)
    }

    /// The next `len` raw bytes, whatever they are.
    pub async fn read_bytes(&mut self, len: usize) -> Vec<u8> {
        self.read_exact(len).await;
        self.buf.drain(..len).collect()
    }

    /// Everything the server sends until it closes the connection.
    pub async fn read_to_close(&mut self) -> Vec<u8> {
        while let Some(n) = self.fill().await {
            if n == 0 {
                break;
            }
        }
        std::mem::take(&mut self.buf)
    }

    async fn read(&mut self, with_body: bool) -> Reply {
        let (version, status, headers, consumed) = loop {
            let mut slots = [httparse::EMPTY_HEADER; 64];
            let mut res = httparse::Response::new(&mut slots);
            match res.parse(&self.buf).expect("valid response head") {
                httparse::Status::Complete(n) => {
                    let headers = res
                        .headers
                        .iter()
                        .map(|h| {
                            (
                                h.name.to_string(),
                                String::from_utf8_lossy(h.value).into_owned(),
                            )
                        })
                        .collect::<Vec<_>>();
                    break (res.version.unwrap_or(1), res.code.unwrap_or(0), headers, n);
                }
                httparse::Status::Partial => self.fill_some().await,
            }
        };
        self.buf.drain(..consumed);

        let mut reply = Reply {
            version,
            status,
            headers,
            body: Vec::new(),
        };
        let bodiless = (100..200).contains(&status) || status == 204 || status == 304;
        if !with_body || bodiless {
            return reply;
        }

        if reply
            .header("transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
        {
            reply.body = self.read_chunked().await;
        } else if let Some(len) = reply.header("content-length") {
            let len: usize = len.parse().expect("numeric content-length");
            self.read_exact(len).await;
            reply.body = self.buf.drain(..len).collect();
        } else {
            reply.body = self.read_to_close().await;
        }
        reply
    }

    async fn read_chunked(&mut self) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line().await;
            let size = usize::from_str_radix(line.trim(), 16).expect("chunk size");
            if size == 0 {
                let trailer_end = self.read_line().await;
                assert!(trailer_end.is_empty(), "unexpected trailer");
                return body;
            }
            self.read_exact(size + 2).await;
            body.extend(self.buf.drain(..size));
            self.buf.drain(..2);
        }
    }

    async fn read_line(&mut self) -> String {
        loop {
            if let Some(end) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
                self.buf.drain(..end + 2);
                return line;
            }
            self.fill_some().await;
        }
    }

    async fn read_exact(&mut self, len: usize) {
        while self.buf.len() < len {
            self.fill_some().await;
        }
    }

    async fn fill_some(&mut self) {
        match self.fill().await {
            Some(0) => panic!("connection closed mid-response"),
            Some(_) => {}
            None => panic!("timed out waiting for the server"),
        }
    }

    /// Reads once; `None` on timeout or error.
    async fn fill(&mut self) -> Option<usize> {
        let mut chunk = [0u8; 8192];
        match tokio::time::timeout(READ_TIMEOUT, self.stream.read(&mut chunk)).await {
            Ok(Ok(n)) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Some(n)
            }
            Ok(Err(_)) => Some(0),
            Err(_) => None,
        }
    }
}
