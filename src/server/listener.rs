use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixStream};
use tracing::{info, warn};

use crate::config::ListenAddr;
use crate::server::socket::Peer;

pub enum Accepted {
    Tcp(TcpStream, Peer),
    Unix(UnixStream, Peer),
}

pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    pub async fn bind(addr: &ListenAddr, backlog: u32) -> anyhow::Result<Self> {
        match addr {
            ListenAddr::Tcp(host) => {
                let addr = tokio::net::lookup_host(host.as_str())
                    .await
                    .with_context(|| format!("failed to resolve {host}"))?
                    .next()
                    .with_context(|| format!("no address for {host}"))?;
                let socket = match addr {
                    SocketAddr::V4(_) => TcpSocket::new_v4()?,
                    SocketAddr::V6(_) => TcpSocket::new_v6()?,
                };
                socket.set_reuseaddr(true)?;
                socket
                    .bind(addr)
                    .with_context(|| format!("failed to bind {addr}"))?;
                let listener = socket.listen(backlog)?;
                info!("Listening on {}", listener.local_addr()?);
                Ok(Listener::Tcp(listener))
            }
            ListenAddr::Unix(path) => {
                match std::fs::remove_file(path) {
                    Ok(()) => warn!(path = %path.display(), "removed stale socket"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e).with_context(|| format!("failed to remove {}", path.display())),
                }
                let listener = UnixListener::bind(path)
                    .with_context(|| format!("failed to bind {}", path.display()))?;
                info!("Listening on unix:{}", path.display());
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    pub async fn accept(&self) -> io::Result<Accepted> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                let peer = Peer {
                    addr: addr.ip().to_string(),
                    port: addr.port(),
                };
                Ok(Accepted::Tcp(stream, peer))
            }
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Accepted::Unix(stream, Peer::unix()))
            }
        }
    }

    /// Bound address of a TCP listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix { .. } => None,
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}
