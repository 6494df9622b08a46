use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::base::uri::{normalize_bind_to, parse_uri, DestinationKey, Scheme};
use crate::dns::{resolve_host, GaiResolver, Resolve};
use crate::reactor::Reactor;
use crate::socket::client::{Role, Socket};
use crate::socket::tls::ClientTlsOptions;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream, UnixStream};
use tokio_util::sync::CancellationToken;

/// Restricts which resolved addresses are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::Any => true,
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Ipv6 => addr.is_ipv6(),
        }
    }
}

/// Options for establishing client connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Upper bound for each individual connect attempt.
    pub connect_timeout: Duration,
    /// Number of resolved addresses tried before giving up.
    pub max_attempts: usize,
    pub address_family: AddressFamily,
    /// Local address to bind before connecting, e.g. `10.0.0.2` or `[::1]:0`.
    pub bind_to: Option<String>,
    pub tcp_nodelay: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_attempts: 2,
            address_family: AddressFamily::Any,
            bind_to: None,
            tcp_nodelay: false,
        }
    }
}

impl ConnectOptions {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_address_family(mut self, family: AddressFamily) -> Self {
        self.address_family = family;
        self
    }

    pub fn with_bind_to(mut self, bind_to: impl Into<String>) -> Self {
        self.bind_to = Some(bind_to.into());
        self
    }

    pub fn with_tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }
}

/// Produces connected sockets for a destination.
///
/// The pool's seam for connection establishment; tests substitute their
/// own implementation.
pub trait Connect: Send + Sync {
    fn connect<'a>(
        &'a self,
        destination: &'a DestinationKey,
        token: Option<&'a CancellationToken>,
    ) -> BoxFuture<'a, Result<Socket, NetError>>;
}

/// Default [`Connect`] implementation: DNS → TCP, or a direct Unix connect.
pub struct ConnectJob {
    reactor: Reactor,
    options: ConnectOptions,
    resolver: Arc<dyn Resolve>,
}

impl ConnectJob {
    pub fn new(reactor: Reactor, options: ConnectOptions) -> Self {
        Self {
            reactor,
            options,
            resolver: Arc::new(GaiResolver::new()),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    async fn run(
        &self,
        destination: &DestinationKey,
        token: Option<&CancellationToken>,
    ) -> Result<Socket, NetError> {
        let Some(token) = token else {
            return self.establish(destination).await;
        };
        if token.is_cancelled() {
            return Err(NetError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!(destination = %destination, "connect cancelled");
                Err(NetError::Cancelled)
            }
            result = self.establish(destination) => result,
        }
    }

    async fn establish(&self, destination: &DestinationKey) -> Result<Socket, NetError> {
        let timeout = self.options.connect_timeout;

        if let Some(path) = destination.unix_path() {
            let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
                .await
                .map_err(|_| NetError::ConnectionTimedOut)?
                .connection_context(destination.as_str())?;
            tracing::debug!(destination = %destination, "unix socket connected");
            return Ok(Socket::new(
                stream.into(),
                &self.reactor,
                Role::Client { peer_name: None },
            ));
        }

        let uri = parse_uri(destination.as_str())?;
        if uri.scheme != Scheme::Tcp {
            return Err(NetError::InvalidUriScheme(uri.scheme.to_string()));
        }

        let bind_to = normalize_bind_to(self.options.bind_to.as_deref())?
            .map(|b| {
                b.parse::<SocketAddr>()
                    .map_err(|_| NetError::InvalidBindTo(b.clone()))
            })
            .transpose()?;

        let family = self.options.address_family;
        let addrs: Vec<SocketAddr> = resolve_host(self.resolver.as_ref(), &uri.host, uri.port)
            .await?
            .into_iter()
            .filter(|addr| family.matches(addr))
            .collect();
        if addrs.is_empty() {
            return Err(NetError::dns_failed(
                &uri.host,
                io::Error::new(io::ErrorKind::NotFound, "no address of the requested family"),
            ));
        }

        let mut last_error = NetError::ConnectionFailed;
        for addr in addrs.iter().take(self.options.max_attempts.max(1)) {
            tracing::trace!(destination = %destination, %addr, "connect attempt");
            match tokio::time::timeout(timeout, connect_tcp(*addr, bind_to)).await {
                Ok(Ok(stream)) => {
                    if self.options.tcp_nodelay {
                        stream.set_nodelay(true)?;
                    }
                    tracing::debug!(destination = %destination, %addr, "tcp connected");
                    let peer_name = uri.host.trim_matches(|c| c == '[' || c == ']').to_string();
                    return Ok(Socket::new(
                        stream.into(),
                        &self.reactor,
                        Role::Client {
                            peer_name: Some(peer_name),
                        },
                    ));
                }
                Ok(Err(e)) => {
                    tracing::debug!(destination = %destination, %addr, error = %e, "connect attempt failed");
                    last_error = NetError::connection_failed_to(destination.as_str(), e);
                }
                Err(_) => {
                    tracing::debug!(destination = %destination, %addr, "connect attempt timed out");
                    last_error = NetError::ConnectionTimedOut;
                }
            }
        }
        Err(last_error)
    }
}

impl Connect for ConnectJob {
    fn connect<'a>(
        &'a self,
        destination: &'a DestinationKey,
        token: Option<&'a CancellationToken>,
    ) -> BoxFuture<'a, Result<Socket, NetError>> {
        Box::pin(self.run(destination, token))
    }
}

async fn connect_tcp(addr: SocketAddr, bind_to: Option<SocketAddr>) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(local) = bind_to {
        socket.bind(local)?;
    }
    socket.connect(addr).await
}

/// Connects to `uri` (`tcp://host:port`, `host:port` or `unix:///path`).
pub async fn connect(
    uri: &str,
    options: &ConnectOptions,
    reactor: &Reactor,
    token: Option<&CancellationToken>,
) -> Result<Socket, NetError> {
    let destination = DestinationKey::parse(uri)?;
    ConnectJob::new(reactor.clone(), options.clone())
        .connect(&destination, token)
        .await
}

/// Connects to `uri` and negotiates TLS. The destination host is the
/// default peer name.
pub async fn crypto_connect(
    uri: &str,
    options: &ConnectOptions,
    tls: &ClientTlsOptions,
    reactor: &Reactor,
    token: Option<&CancellationToken>,
) -> Result<Socket, NetError> {
    let socket = connect(uri, options, reactor, token).await?;
    socket.enable_crypto_with(tls.clone()).await?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_defaults() {
        let opts: ConnectOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts, ConnectOptions::default());
        assert_eq!(opts.connect_timeout, Duration::from_secs(10));
        assert_eq!(opts.max_attempts, 2);

        let opts: ConnectOptions =
            serde_json::from_str(r#"{"address_family":"ipv6","tcp_nodelay":true}"#).unwrap();
        assert_eq!(opts.address_family, AddressFamily::Ipv6);
        assert!(opts.tcp_nodelay);
    }

    #[test]
    fn test_address_family_filter() {
        let v4: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert!(AddressFamily::Any.matches(&v4) && AddressFamily::Any.matches(&v6));
        assert!(AddressFamily::Ipv4.matches(&v4) && !AddressFamily::Ipv4.matches(&v6));
        assert!(!AddressFamily::Ipv6.matches(&v4) && AddressFamily::Ipv6.matches(&v6));
    }

    #[tokio::test]
    async fn test_cancelled_token_fails_before_connecting() {
        let token = CancellationToken::new();
        token.cancel();
        let reactor = Reactor::new();
        let err = connect("tcp://127.0.0.1:9", &ConnectOptions::default(), &reactor, Some(&token))
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_udp_destination_rejected() {
        let reactor = Reactor::new();
        let err = connect("udp://127.0.0.1:53", &ConnectOptions::default(), &reactor, None)
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::InvalidUriScheme(_)));
    }

    #[tokio::test]
    async fn test_family_mismatch_is_not_resolved() {
        let reactor = Reactor::new();
        let opts = ConnectOptions::default().with_address_family(AddressFamily::Ipv6);
        let err = connect("tcp://127.0.0.1:80", &opts, &reactor, None)
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::NameNotResolvedFor { .. }));
    }
}
