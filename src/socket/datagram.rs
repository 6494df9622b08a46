use crate::base::address::{cleanup_socket_name, format_socket_addr};
use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::base::uri::{path_scheme, split_uri, Scheme};
use crate::reactor::{Reactor, Watcher};
use crate::socket::client::{lock, wait_closed};
use crate::socket::DEFAULT_CHUNK_SIZE;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{UdpSocket, UnixDatagram};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindOptions {
    /// Maximum datagram size returned by one receive.
    pub chunk_size: usize,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl BindOptions {
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }
}

enum Endpoint {
    Udp(UdpSocket),
    Unix(UnixDatagram),
}

impl Endpoint {
    async fn readable(&self) -> io::Result<()> {
        match self {
            Endpoint::Udp(s) => s.readable().await,
            Endpoint::Unix(s) => s.readable().await,
        }
    }

    /// One non-blocking `recvfrom`. Unnamed Unix peers yield an empty name.
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, String)> {
        match self {
            Endpoint::Udp(s) => {
                let (n, peer) = s.try_recv_from(buf)?;
                Ok((n, format_socket_addr(&peer)))
            }
            Endpoint::Unix(s) => {
                let (n, peer) = s.try_recv_from(buf)?;
                let name = peer
                    .as_pathname()
                    .and_then(|p| cleanup_socket_name(&p.to_string_lossy()))
                    .unwrap_or_default();
                Ok((n, name))
            }
        }
    }

    fn try_send_to(&self, data: &[u8], address: &str) -> Result<usize, NetError> {
        let sent = match self {
            Endpoint::Udp(s) => s.try_send_to(data, udp_target(address)?),
            Endpoint::Unix(s) => s.try_send_to(data, address.strip_prefix("udg://").unwrap_or(address)),
        };
        sent.map_err(|e| NetError::SendFailed(e.to_string()))
    }

    fn name(&self) -> Option<String> {
        match self {
            Endpoint::Udp(s) => s.local_addr().ok().map(|a| format_socket_addr(&a)),
            Endpoint::Unix(s) => {
                let addr = s.local_addr().ok()?;
                cleanup_socket_name(&addr.as_pathname()?.to_string_lossy())
            }
        }
    }
}

/// Parses `ip:port`, `[ipv6]:port` or `udp://ip:port`.
fn udp_target(address: &str) -> Result<SocketAddr, NetError> {
    address
        .strip_prefix("udp://")
        .unwrap_or(address)
        .parse()
        .map_err(|_| NetError::InvalidUri(address.to_string()))
}

/// A bound datagram endpoint (UDP or Unix datagram).
///
/// At most one [`receive`](DatagramSocket::receive) may be pending.
/// Sends are single non-blocking `sendto` calls and may be partial.
#[derive(Clone)]
pub struct DatagramSocket {
    inner: Arc<DatagramInner>,
}

struct DatagramInner {
    reactor: Reactor,
    endpoint: Mutex<Option<Arc<Endpoint>>>,
    closed: watch::Sender<bool>,
    receiving: AtomicBool,
    chunk_size: AtomicUsize,
    watcher: Watcher,
    address: Option<String>,
}

impl fmt::Debug for DatagramSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramSocket")
            .field("address", &self.inner.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl DatagramSocket {
    /// Binds `uri`: `udp://host:port` (scheme optional) or `udg:///path`.
    ///
    /// Must be called within a tokio runtime.
    pub fn bind(uri: &str, options: &BindOptions, reactor: &Reactor) -> Result<Self, NetError> {
        let endpoint = match path_scheme(uri) {
            Some((Scheme::Udg, path)) => {
                Endpoint::Unix(UnixDatagram::bind(path).bind_context(uri)?)
            }
            Some((scheme, _)) => return Err(NetError::InvalidUriScheme(scheme.to_string())),
            None => Endpoint::Udp(bind_udp(uri)?),
        };

        let (closed, _) = watch::channel(false);
        let address = endpoint.name();
        tracing::debug!(address = ?address, "datagram endpoint bound");
        Ok(Self {
            inner: Arc::new(DatagramInner {
                reactor: reactor.clone(),
                endpoint: Mutex::new(Some(Arc::new(endpoint))),
                closed,
                receiving: AtomicBool::new(false),
                chunk_size: AtomicUsize::new(options.chunk_size.max(1)),
                watcher: reactor.watch(),
                address,
            }),
        })
    }

    /// Waits for the next datagram and returns it with the sender's address.
    ///
    /// Returns `Ok(None)` when the endpoint is closed or the read fails.
    pub async fn receive(&self) -> Result<Option<(String, Bytes)>, NetError> {
        if self.inner.receiving.swap(true, Ordering::AcqRel) {
            return Err(NetError::PendingReceive);
        }
        let _pending = PendingReceive(&self.inner);

        let Some(endpoint) = lock(&self.inner.endpoint).clone() else {
            return Ok(None);
        };

        let mut buf = BytesMut::zeroed(self.inner.chunk_size.load(Ordering::Relaxed));
        self.inner.watcher.enable();
        loop {
            let closed = self.inner.closed.subscribe();
            let ready = tokio::select! {
                biased;
                _ = wait_closed(closed) => return Ok(None),
                ready = endpoint.readable() => ready,
            };
            // Closed, but the deferred wake has not run yet.
            if lock(&self.inner.endpoint).is_none() {
                return Ok(None);
            }

            let received = ready.and_then(|_| endpoint.try_recv_from(&mut buf));
            match received {
                Ok((n, peer)) => {
                    buf.truncate(n);
                    return Ok(Some((peer, buf.freeze())));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    tracing::debug!(address = ?self.inner.address, error = %e, "datagram receive failed");
                    self.inner.watcher.cancel();
                    return Ok(None);
                }
            }
        }
    }

    /// Sends one datagram to `address` and returns the bytes written.
    pub fn send(&self, address: &str, data: &[u8]) -> Result<usize, NetError> {
        let endpoint = lock(&self.inner.endpoint)
            .clone()
            .ok_or(NetError::EndpointNotWritable)?;
        endpoint.try_send_to(data, address)
    }

    /// Releases the descriptor. A pending receive resolves with `None` on
    /// a later scheduler turn. Idempotent.
    pub fn close(&self) {
        if lock(&self.inner.endpoint).take().is_none() {
            return;
        }
        self.inner.watcher.cancel();

        if self.inner.receiving.load(Ordering::Acquire) {
            let inner = Arc::clone(&self.inner);
            self.inner.reactor.defer(move || {
                inner.closed.send_replace(true);
            });
        } else {
            self.inner.closed.send_replace(true);
        }
        tracing::debug!(address = ?self.inner.address, "datagram endpoint closed");
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.endpoint).is_none()
    }

    pub fn address(&self) -> Option<String> {
        self.inner.address.clone()
    }

    /// Applies to receives started after the call.
    pub fn set_chunk_size(&self, size: usize) {
        self.inner.chunk_size.store(size.max(1), Ordering::Relaxed);
    }

    pub fn reference(&self) {
        self.inner.watcher.reference();
    }

    pub fn unreference(&self) {
        self.inner.watcher.unreference();
    }
}

struct PendingReceive<'a>(&'a DatagramInner);

impl Drop for PendingReceive<'_> {
    fn drop(&mut self) {
        self.0.watcher.disable();
        self.0.receiving.store(false, Ordering::Release);
    }
}

fn bind_udp(uri: &str) -> Result<UdpSocket, NetError> {
    let with_scheme = if uri.contains("://") {
        uri.to_string()
    } else {
        format!("udp://{uri}")
    };
    let parsed = split_uri(&with_scheme)?;
    if parsed.scheme != Scheme::Udp {
        return Err(NetError::InvalidUriScheme(parsed.scheme.to_string()));
    }

    let host = parsed.host.trim_matches(|c| c == '[' || c == ']');
    let addr = (host, parsed.port)
        .to_socket_addrs()
        .dns_context(host)?
        .next()
        .ok_or(NetError::NameNotResolved)?;

    let socket = std::net::UdpSocket::bind(addr).bind_context(uri)?;
    socket.set_nonblocking(true).bind_context(uri)?;
    UdpSocket::from_std(socket).bind_context(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_target() {
        assert_eq!(
            udp_target("udp://127.0.0.1:53").unwrap(),
            "127.0.0.1:53".parse::<SocketAddr>().unwrap()
        );
        assert!(udp_target("[::1]:53").unwrap().is_ipv6());
        assert!(matches!(udp_target("localhost"), Err(NetError::InvalidUri(_))));
    }

    #[tokio::test]
    async fn test_bind_rejects_stream_schemes() {
        let reactor = Reactor::new();
        for uri in ["tcp://127.0.0.1:0", "unix:///tmp/x.sock"] {
            let err = DatagramSocket::bind(uri, &BindOptions::default(), &reactor).unwrap_err();
            assert!(matches!(err, NetError::InvalidUriScheme(_)), "{uri}");
        }
    }

    #[tokio::test]
    async fn test_closed_endpoint() {
        let reactor = Reactor::new();
        let socket = DatagramSocket::bind("127.0.0.1:0", &BindOptions::default(), &reactor).unwrap();
        socket.close();
        socket.close();

        assert!(socket.is_closed());
        assert!(socket.receive().await.unwrap().is_none());
        assert!(matches!(
            socket.send("127.0.0.1:9", b"x"),
            Err(NetError::EndpointNotWritable)
        ));
    }
}
