use crate::base::neterror::NetError;
use crate::reactor::{Reactor, Watcher};
use crate::socket::stream::Stream;
use crate::socket::tls::engine::{self, CryptoSession, TlsIo};
use crate::socket::tls::{ClientTlsOptions, CryptoState, ServerTlsOptions, TlsOptions};
use crate::socket::{next_socket_id, SocketId, DEFAULT_CHUNK_SIZE};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::Interest;
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::watch;

/// Which side of the connection created the socket.
#[derive(Debug, Clone)]
pub(crate) enum Role {
    Client { peer_name: Option<String> },
    Server { tls: Option<ServerTlsOptions> },
}

/// A connected stream socket (TCP or Unix domain).
///
/// `Socket` is a cheap handle; clones refer to the same connection. At most
/// one read may be pending at a time, writes suspend on backpressure, and
/// [`close`](Socket::close) releases the descriptor immediately.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    id: SocketId,
    stream: Mutex<Option<Arc<Stream>>>,
    crypto: Mutex<CryptoSession>,
    closed: watch::Sender<bool>,
    reading: AtomicBool,
    chunk_size: AtomicUsize,
    io_watcher: Watcher,
    suspended: Mutex<usize>,
    local: Option<String>,
    remote: Option<String>,
    role: Role,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.inner.id)
            .field("local", &self.inner.local)
            .field("remote", &self.inner.remote)
            .field("closed", &self.is_closed())
            .field("crypto", &self.crypto_state())
            .finish()
    }
}

impl Socket {
    pub(crate) fn new(stream: Stream, reactor: &Reactor, role: Role) -> Self {
        let local = address_with_fallback(&stream, false);
        let remote = address_with_fallback(&stream, true);
        let (closed, _) = watch::channel(false);
        let socket = Self {
            inner: Arc::new(SocketInner {
                id: next_socket_id(),
                stream: Mutex::new(Some(Arc::new(stream))),
                crypto: Mutex::new(CryptoSession::default()),
                closed,
                reading: AtomicBool::new(false),
                chunk_size: AtomicUsize::new(DEFAULT_CHUNK_SIZE),
                io_watcher: reactor.watch(),
                suspended: Mutex::new(0),
                local,
                remote,
                role,
            }),
        };
        tracing::trace!(socket = socket.id(), remote = ?socket.inner.remote, "socket opened");
        socket
    }

    /// Wraps an already connected TCP stream as a client socket.
    pub fn from_tcp(stream: TcpStream, reactor: &Reactor) -> Self {
        let peer_name = stream.peer_addr().ok().map(|addr| addr.ip().to_string());
        Self::new(stream.into(), reactor, Role::Client { peer_name })
    }

    /// Wraps an already connected Unix stream as a client socket.
    pub fn from_unix(stream: UnixStream, reactor: &Reactor) -> Self {
        Self::new(stream.into(), reactor, Role::Client { peer_name: None })
    }

    pub fn id(&self) -> SocketId {
        self.inner.id
    }

    /// Reads the next chunk of data.
    ///
    /// Returns `Ok(None)` at end of stream or when the socket is closed.
    /// Fails with [`NetError::PendingRead`] if another read is in flight and
    /// with [`NetError::SocketClosed`] if the socket is closed while waiting.
    pub async fn read(&self) -> Result<Option<Bytes>, NetError> {
        if self.inner.reading.swap(true, Ordering::AcqRel) {
            return Err(NetError::PendingRead);
        }
        let _pending = PendingRead(&self.inner);

        let Ok(stream) = self.stream() else {
            return Ok(None);
        };

        let chunk_size = self.inner.chunk_size.load(Ordering::Relaxed);
        let mut buf = BytesMut::zeroed(chunk_size);
        loop {
            match self.try_read(&stream, &mut buf) {
                TlsIo::Done(n) => {
                    buf.truncate(n);
                    return Ok(Some(buf.freeze()));
                }
                TlsIo::Eof => return Ok(None),
                TlsIo::Want(interest) => self.wait(&stream, interest).await?,
                TlsIo::Failed(e) if e.kind() == ErrorKind::ConnectionReset => {
                    tracing::trace!(socket = self.id(), "connection reset while reading");
                    return Ok(None);
                }
                TlsIo::Failed(e) => return Err(e.into()),
            }
        }
    }

    /// Writes all of `data`, suspending while the kernel buffer is full.
    pub async fn write(&self, data: impl AsRef<[u8]>) -> Result<(), NetError> {
        let mut data = data.as_ref();
        let stream = self.stream()?;

        while !data.is_empty() {
            if self.is_closed() {
                return Err(NetError::SocketClosed);
            }
            match self.try_write(&stream, data) {
                TlsIo::Done(n) => data = &data[n..],
                TlsIo::Want(interest) => self.wait(&stream, interest).await?,
                TlsIo::Eof => return Err(NetError::ConnectionClosed),
                TlsIo::Failed(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Writes `data` and closes the socket.
    pub async fn end(&self, data: impl AsRef<[u8]>) -> Result<(), NetError> {
        let result = self.write(data).await;
        self.close();
        result
    }

    /// Releases the descriptor. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        engine::disable(self);
        self.inner.io_watcher.cancel();
        if let Some(stream) = lock(&self.inner.stream).take() {
            stream.shutdown();
        }
        tracing::debug!(socket = self.id(), "socket closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Liveness check: open and the peer has not closed its side.
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.stream().is_ok_and(|s| s.is_alive())
    }

    pub fn local_address(&self) -> Option<String> {
        self.inner.local.clone()
    }

    pub fn remote_address(&self) -> Option<String> {
        self.inner.remote.clone()
    }

    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.stream().ok().map(|s| s.as_raw_fd())
    }

    /// Maximum number of bytes returned by a single read.
    pub fn set_chunk_size(&self, size: usize) {
        self.inner.chunk_size.store(size.max(1), Ordering::Relaxed);
    }

    /// Enables TLS with the socket's default options: client defaults for
    /// connected sockets, the listener's server options for accepted ones.
    pub async fn enable_crypto(&self) -> Result<(), NetError> {
        let options = match &self.inner.role {
            Role::Client { .. } => TlsOptions::Client(ClientTlsOptions::default()),
            Role::Server { tls: Some(tls) } => TlsOptions::Server(tls.clone()),
            Role::Server { tls: None } => {
                return Err(NetError::InvalidTlsConfig(
                    "no server TLS options configured for this socket".into(),
                ))
            }
        };
        engine::enable(self, options, false).await
    }

    /// Enables TLS with `options`. A no-op if the session already runs with
    /// an equal option set.
    pub async fn enable_crypto_with(&self, options: impl Into<TlsOptions>) -> Result<(), NetError> {
        engine::enable(self, options.into(), false).await
    }

    /// Tears down any TLS session and negotiates a new one unconditionally.
    pub async fn renegotiate_crypto(&self, options: impl Into<TlsOptions>) -> Result<(), NetError> {
        engine::enable(self, options.into(), true).await
    }

    pub fn disable_crypto(&self) {
        engine::disable(self);
    }

    pub fn crypto_state(&self) -> CryptoState {
        self.crypto().state
    }

    /// Protocol selected through ALPN, if any.
    pub fn alpn_protocol(&self) -> Option<String> {
        let crypto = self.crypto();
        let ssl = crypto.ssl.as_ref()?;
        ssl.ssl()
            .selected_alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }

    /// Lets a pending operation on this socket keep the reactor alive.
    pub fn reference(&self) {
        self.inner.io_watcher.reference();
    }

    pub fn unreference(&self) {
        self.inner.io_watcher.unreference();
    }

    pub(crate) fn peer_name(&self) -> Option<&str> {
        match &self.inner.role {
            Role::Client { peer_name } => peer_name.as_deref(),
            Role::Server { .. } => None,
        }
    }

    pub(crate) fn crypto(&self) -> MutexGuard<'_, CryptoSession> {
        lock(&self.inner.crypto)
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    pub(crate) fn stream(&self) -> Result<Arc<Stream>, NetError> {
        lock(&self.inner.stream)
            .as_ref()
            .map(Arc::clone)
            .ok_or(NetError::SocketClosed)
    }

    /// Suspends until `stream` is ready for `interest` or the socket closes.
    pub(crate) async fn wait(&self, stream: &Stream, interest: Interest) -> Result<(), NetError> {
        let _suspended = Suspended::new(&self.inner);
        let closed = self.inner.closed.subscribe();
        tokio::select! {
            biased;
            _ = wait_closed(closed) => Err(NetError::SocketClosed),
            ready = stream.ready(interest) => ready.map(|_| ()).map_err(NetError::from),
        }
    }

    fn try_read(&self, stream: &Stream, buf: &mut [u8]) -> TlsIo {
        {
            let mut crypto = self.crypto();
            if let Some(ssl) = crypto.ssl.as_mut() {
                return engine::tls_read(ssl, buf);
            }
        }
        match stream.try_read(buf) {
            Ok(0) => TlsIo::Eof,
            Ok(n) => TlsIo::Done(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => TlsIo::Want(Interest::READABLE),
            Err(e) => TlsIo::Failed(e),
        }
    }

    fn try_write(&self, stream: &Stream, data: &[u8]) -> TlsIo {
        {
            let mut crypto = self.crypto();
            if let Some(ssl) = crypto.ssl.as_mut() {
                return engine::tls_write(ssl, data);
            }
        }
        match stream.try_write(data) {
            Ok(n) => TlsIo::Done(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => TlsIo::Want(Interest::WRITABLE),
            Err(e) => TlsIo::Failed(e),
        }
    }
}

/// Names one side of the connection. Unix sockets usually know only one
/// side, so the other direction is tried when the first has no name.
fn address_with_fallback(stream: &Stream, peer: bool) -> Option<String> {
    stream
        .name(peer)
        .or_else(|| stream.is_unix().then(|| stream.name(!peer)).flatten())
}

pub(crate) async fn wait_closed(mut closed: watch::Receiver<bool>) {
    // The sender outlives every receiver handed out by the owning resource.
    let _ = closed.wait_for(|closed| *closed).await;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PendingRead<'a>(&'a SocketInner);

impl Drop for PendingRead<'_> {
    fn drop(&mut self) {
        self.0.reading.store(false, Ordering::Release);
    }
}

/// Keeps the I/O watcher enabled while any operation is suspended.
struct Suspended<'a>(&'a SocketInner);

impl<'a> Suspended<'a> {
    fn new(inner: &'a SocketInner) -> Self {
        let mut count = lock(&inner.suspended);
        *count += 1;
        if *count == 1 {
            inner.io_watcher.enable();
        }
        Self(inner)
    }
}

impl Drop for Suspended<'_> {
    fn drop(&mut self) {
        let mut count = lock(&self.0.suspended);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.0.io_watcher.disable();
        }
    }
}
