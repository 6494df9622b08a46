//! Raw stream transports underneath [`Socket`](super::Socket).
//!
//! A [`Stream`] is a connected TCP or Unix-domain descriptor registered with
//! the tokio reactor. All I/O on it is non-blocking (`try_*`); callers wait
//! for readiness with [`Stream::ready`] and retry.

use crate::base::address::{cleanup_socket_name, format_socket_addr};
use nix::sys::socket::{self as sys, MsgFlags};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use tokio::io::{Interest, Ready};
use tokio::net::{TcpStream, UnixStream};

#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    pub async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        match self {
            Stream::Tcp(s) => s.ready(interest).await,
            Stream::Unix(s) => s.ready(interest).await,
        }
    }

    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.try_read(buf),
            Stream::Unix(s) => s.try_read(buf),
        }
    }

    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.try_write(buf),
            Stream::Unix(s) => s.try_write(buf),
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Stream::Unix(_))
    }

    /// Best-effort name of one side of the connection.
    pub fn name(&self, peer: bool) -> Option<String> {
        match self {
            Stream::Tcp(s) => {
                let addr = if peer { s.peer_addr() } else { s.local_addr() };
                addr.ok().map(|a| format_socket_addr(&a))
            }
            Stream::Unix(s) => {
                let addr = if peer { s.peer_addr() } else { s.local_addr() };
                let addr = addr.ok()?;
                let path = addr.as_pathname()?;
                cleanup_socket_name(&path.to_string_lossy())
            }
        }
    }

    /// Non-consuming liveness check: false once the peer has closed or the
    /// descriptor reports an error.
    pub fn is_alive(&self) -> bool {
        let mut peek = [0u8; 1];
        match sys::recv(
            self.as_raw_fd(),
            &mut peek,
            MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT,
        ) {
            Ok(0) => false,
            Ok(_) => true,
            Err(nix::errno::Errno::EAGAIN) => true,
            Err(_) => false,
        }
    }

    /// Shuts down both directions so the peer observes EOF immediately.
    pub fn shutdown(&self) {
        if let Err(e) = sys::shutdown(self.as_raw_fd(), sys::Shutdown::Both) {
            tracing::trace!(error = %e, "shutdown on closing socket failed");
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl From<TcpStream> for Stream {
    fn from(s: TcpStream) -> Self {
        Stream::Tcp(s)
    }
}

impl From<UnixStream> for Stream {
    fn from(s: UnixStream) -> Self {
        Stream::Unix(s)
    }
}

/// Blocking-style `Read`/`Write` view over a shared [`Stream`].
///
/// Reads and writes never block; they surface `WouldBlock`, which the TLS
/// engine reports as a want-read/want-write condition.
#[derive(Debug, Clone)]
pub struct RawIo {
    stream: Arc<Stream>,
}

impl RawIo {
    pub fn new(stream: Arc<Stream>) -> Self {
        Self { stream }
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }
}

impl Read for RawIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }
}

impl Write for RawIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_liveness_check_does_not_consume() {
        let (a, b) = UnixStream::pair().unwrap();
        let a = Stream::from(a);
        let b = Stream::from(b);

        assert!(a.is_alive());

        b.ready(Interest::WRITABLE).await.unwrap();
        b.try_write(b"x").unwrap();
        a.ready(Interest::READABLE).await.unwrap();
        assert!(a.is_alive());

        let mut buf = [0u8; 4];
        assert_eq!(a.try_read(&mut buf).unwrap(), 1);
        assert_eq!(&buf[..1], b"x");

        drop(b);
        a.ready(Interest::READABLE).await.unwrap();
        assert!(!a.is_alive());
    }

    #[tokio::test]
    async fn test_unnamed_unix_pair_has_no_name() {
        let (a, _b) = UnixStream::pair().unwrap();
        let a = Stream::from(a);
        assert!(a.is_unix());
        assert_eq!(a.name(false), None);
        assert_eq!(a.name(true), None);
    }
}
