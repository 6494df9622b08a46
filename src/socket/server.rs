use crate::base::address::{cleanup_socket_name, format_socket_addr};
use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::base::uri::{path_scheme, split_uri, Scheme};
use crate::reactor::{Reactor, Watcher};
use crate::socket::client::{lock, wait_closed, Role, Socket};
use crate::socket::stream::Stream;
use crate::socket::tls::ServerTlsOptions;
use crate::socket::DEFAULT_CHUNK_SIZE;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpSocket, UnixListener};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenOptions {
    /// Pending-connection queue length (TCP only).
    pub backlog: u32,
    pub reuse_address: bool,
    pub reuse_port: bool,
    /// Read chunk size of accepted sockets.
    pub chunk_size: usize,
    pub tcp_nodelay: bool,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            backlog: 128,
            reuse_address: true,
            reuse_port: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            tcp_nodelay: false,
        }
    }
}

impl ListenOptions {
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    pub fn with_reuse_port(mut self, reuse: bool) -> Self {
        self.reuse_port = reuse;
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn with_tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    async fn accept(&self, nodelay: bool) -> io::Result<Stream> {
        match self {
            Listener::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                if nodelay {
                    stream.set_nodelay(true)?;
                }
                Ok(stream.into())
            }
            Listener::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(stream.into())
            }
        }
    }

    fn name(&self) -> Option<String> {
        match self {
            Listener::Tcp(l) => l.local_addr().ok().map(|a| format_socket_addr(&a)),
            Listener::Unix(l) => {
                let addr = l.local_addr().ok()?;
                cleanup_socket_name(&addr.as_pathname()?.to_string_lossy())
            }
        }
    }
}

/// A bound, listening stream socket.
///
/// Only one [`accept`](ListeningSocket::accept) may be pending at a time.
/// Accepted sockets carry the listener's TLS options, so
/// [`Socket::enable_crypto`] negotiates as a server.
#[derive(Clone)]
pub struct ListeningSocket {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    reactor: Reactor,
    listener: Mutex<Option<Arc<Listener>>>,
    closed: watch::Sender<bool>,
    accepting: AtomicBool,
    watcher: Watcher,
    address: Option<String>,
    options: ListenOptions,
    tls: Option<ServerTlsOptions>,
}

impl fmt::Debug for ListeningSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListeningSocket")
            .field("address", &self.inner.address)
            .field("closed", &self.is_closed())
            .field("tls", &self.inner.tls.is_some())
            .finish()
    }
}

impl ListeningSocket {
    fn new(
        listener: Listener,
        reactor: &Reactor,
        options: ListenOptions,
        tls: Option<ServerTlsOptions>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        let address = listener.name();
        Self {
            inner: Arc::new(ListenerInner {
                reactor: reactor.clone(),
                listener: Mutex::new(Some(Arc::new(listener))),
                closed,
                accepting: AtomicBool::new(false),
                watcher: reactor.watch(),
                address,
                options,
                tls,
            }),
        }
    }

    /// Waits for the next client.
    ///
    /// Returns `Ok(None)` once the listener is closed, including while an
    /// accept is outstanding. A second concurrent call fails with
    /// [`NetError::PendingAccept`].
    pub async fn accept(&self) -> Result<Option<Socket>, NetError> {
        if self.inner.accepting.swap(true, Ordering::AcqRel) {
            return Err(NetError::PendingAccept);
        }
        let _pending = PendingAccept(&self.inner);

        let Some(listener) = lock(&self.inner.listener).clone() else {
            return Ok(None);
        };
        let nodelay = self.inner.options.tcp_nodelay;

        loop {
            let accepted = match listener.accept(nodelay).now_or_never() {
                Some(result) => result,
                None => {
                    self.inner.watcher.enable();
                    let closed = self.inner.closed.subscribe();
                    tokio::select! {
                        biased;
                        _ = wait_closed(closed) => return Ok(None),
                        result = listener.accept(nodelay) => result,
                    }
                }
            };

            match accepted {
                Ok(stream) => return Ok(Some(self.wrap(stream))),
                Err(e) if is_transient(&e) => {
                    tracing::warn!(address = ?self.inner.address, error = %e, "transient accept error");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn wrap(&self, stream: Stream) -> Socket {
        let socket = Socket::new(
            stream,
            &self.inner.reactor,
            Role::Server {
                tls: self.inner.tls.clone(),
            },
        );
        socket.set_chunk_size(self.inner.options.chunk_size);
        tracing::debug!(
            address = ?self.inner.address,
            socket = socket.id(),
            remote = ?socket.remote_address(),
            "accepted connection"
        );
        socket
    }

    /// Releases the descriptor and ends any pending accept. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        self.inner.watcher.cancel();
        lock(&self.inner.listener).take();
        tracing::debug!(address = ?self.inner.address, "listener closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Bound address: `ip:port` for TCP, the socket path for Unix.
    pub fn address(&self) -> Option<String> {
        self.inner.address.clone()
    }

    pub fn reference(&self) {
        self.inner.watcher.reference();
    }

    pub fn unreference(&self) {
        self.inner.watcher.unreference();
    }
}

struct PendingAccept<'a>(&'a ListenerInner);

impl Drop for PendingAccept<'_> {
    fn drop(&mut self) {
        self.0.watcher.disable();
        self.0.accepting.store(false, Ordering::Release);
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Binds and listens on `uri` (`tcp://host:port`, `host:port` or
/// `unix:///path`). Port 0 picks an ephemeral port.
///
/// Must be called within a tokio runtime. Server TLS options are validated
/// up front and handed to every accepted socket.
pub fn listen(
    uri: &str,
    options: &ListenOptions,
    tls: Option<ServerTlsOptions>,
    reactor: &Reactor,
) -> Result<ListeningSocket, NetError> {
    if let Some(tls) = &tls {
        tls.acceptor()?;
    }

    let listener = match path_scheme(uri) {
        Some((Scheme::Unix, path)) => {
            Listener::Unix(UnixListener::bind(path).bind_context(uri)?)
        }
        Some((scheme, _)) => return Err(NetError::InvalidUriScheme(scheme.to_string())),
        None => Listener::Tcp(bind_tcp(uri, options)?),
    };

    let socket = ListeningSocket::new(listener, reactor, options.clone(), tls);
    tracing::debug!(address = ?socket.address(), "listening");
    Ok(socket)
}

fn bind_tcp(uri: &str, options: &ListenOptions) -> Result<TcpListener, NetError> {
    let parsed = split_uri(uri)?;
    if parsed.scheme != Scheme::Tcp {
        return Err(NetError::InvalidUriScheme(parsed.scheme.to_string()));
    }

    let host = parsed.host.trim_matches(|c| c == '[' || c == ']');
    let addr: SocketAddr = (host, parsed.port)
        .to_socket_addrs()
        .dns_context(host)?
        .next()
        .ok_or(NetError::NameNotResolved)?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .bind_context(uri)?;
    socket.set_reuseaddr(options.reuse_address).bind_context(uri)?;
    if options.reuse_port {
        socket.set_reuseport(true).bind_context(uri)?;
    }
    socket.bind(addr).bind_context(uri)?;
    socket.listen(options.backlog).bind_context(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_options_defaults() {
        let opts: ListenOptions = serde_json::from_str(r#"{"backlog": 16}"#).unwrap();
        assert_eq!(opts.backlog, 16);
        assert!(opts.reuse_address);
        assert!(!opts.reuse_port);
        assert_eq!(opts.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn test_listen_rejects_datagram_schemes() {
        let reactor = Reactor::new();
        for uri in ["udp://127.0.0.1:0", "udg:///tmp/x.sock"] {
            let err = listen(uri, &ListenOptions::default(), None, &reactor).unwrap_err();
            assert!(matches!(err, NetError::InvalidUriScheme(_)), "{uri}");
        }
    }

    #[tokio::test]
    async fn test_listen_validates_tls_options() {
        let reactor = Reactor::new();
        let err = listen(
            "127.0.0.1:0",
            &ListenOptions::default(),
            Some(ServerTlsOptions::default()),
            &reactor,
        )
        .unwrap_err();
        assert!(matches!(err, NetError::InvalidTlsConfig(_)));
    }

    #[tokio::test]
    async fn test_second_accept_faults() {
        let reactor = Reactor::new();
        let server = listen("127.0.0.1:0", &ListenOptions::default(), None, &reactor).unwrap();

        let acceptor = server.clone();
        let pending = tokio::spawn(async move { acceptor.accept().await });
        while reactor.referenced_watchers() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(matches!(server.accept().await, Err(NetError::PendingAccept)));

        server.close();
        assert!(pending.await.unwrap().unwrap().is_none());
        assert!(server.accept().await.unwrap().is_none());
        assert_eq!(reactor.referenced_watchers(), 0);
    }
}
