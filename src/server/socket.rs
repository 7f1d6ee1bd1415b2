use std::future::Future;
use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, RawFd};

use tokio::io::{Interest, Ready};
use tokio::net::{TcpStream, UnixStream};

/// Peer of an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub addr: String,
    pub port: u16,
}

impl Peer {
    pub fn unix() -> Self {
        Self {
            addr: String::new(),
            port: 0,
        }
    }
}

/// A non-blocking stream the connection state machine can drive.
///
/// Implemented for tokio TCP and unix streams.
pub trait Socket: AsRawFd + 'static {
    fn ready(&self, interest: Interest) -> impl Future<Output = io::Result<Ready>>;
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;
    fn try_io<R>(&self, interest: Interest, f: impl FnOnce() -> io::Result<R>) -> io::Result<R>;

    /// Holds back partial frames until uncorked.
    fn set_cork(&self, _on: bool) -> io::Result<()> {
        Ok(())
    }

    /// Sends small writes immediately.
    fn set_nodelay(&self) -> io::Result<()> {
        Ok(())
    }
}

impl Socket for TcpStream {
    fn ready(&self, interest: Interest) -> impl Future<Output = io::Result<Ready>> {
        TcpStream::ready(self, interest)
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        TcpStream::try_write_vectored(self, bufs)
    }

    fn try_io<R>(&self, interest: Interest, f: impl FnOnce() -> io::Result<R>) -> io::Result<R> {
        TcpStream::try_io(self, interest, f)
    }

    fn set_cork(&self, on: bool) -> io::Result<()> {
        set_tcp_cork(self.as_raw_fd(), on)
    }

    fn set_nodelay(&self) -> io::Result<()> {
        TcpStream::set_nodelay(self, true)
    }
}

impl Socket for UnixStream {
    fn ready(&self, interest: Interest) -> impl Future<Output = io::Result<Ready>> {
        UnixStream::ready(self, interest)
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        UnixStream::try_read(self, buf)
    }

    fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        UnixStream::try_write_vectored(self, bufs)
    }

    fn try_io<R>(&self, interest: Interest, f: impl FnOnce() -> io::Result<R>) -> io::Result<R> {
        UnixStream::try_io(self, interest, f)
    }
}

#[cfg(target_os = "linux")]
fn set_tcp_cork(fd: RawFd, on: bool) -> io::Result<()> {
    let value: libc::c_int = on.into();
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_tcp_cork(_fd: RawFd, _on: bool) -> io::Result<()> {
    Ok(())
}

/// Waits until the socket is really ready for `interest`.
///
/// Application code may read or write the raw descriptor behind the
/// reactor's back, leaving stale readiness cached. Each hit is confirmed
/// with a zero-timeout `poll(2)`, and stale readiness is cleared.
pub async fn ready_now<S: Socket>(socket: &S, interest: Interest) -> io::Result<()> {
    loop {
        socket.ready(interest).await?;
        let fd = socket.as_raw_fd();
        match socket.try_io(interest, || poll_now(fd, interest)) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

fn poll_now(fd: RawFd, interest: Interest) -> io::Result<()> {
    let mut events: libc::c_short = 0;
    if interest.is_readable() {
        events |= libc::POLLIN;
    }
    if interest.is_writable() {
        events |= libc::POLLOUT;
    }
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if pfd.revents & (events | libc::POLLERR | libc::POLLHUP) != 0 {
        Ok(())
    } else {
        Err(io::ErrorKind::WouldBlock.into())
    }
}
