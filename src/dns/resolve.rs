//! Resolver trait and host override support.

use crate::base::neterror::NetError;
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
};

/// A host name to resolve into IP addresses.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    #[inline]
    pub fn new(host: impl Into<Box<str>>) -> Self {
        Self { host: host.into() }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.host
    }

    /// The host as an IP literal, with IPv6 brackets stripped.
    pub fn as_ip(&self) -> Option<IpAddr> {
        self.host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .ok()
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value)
    }
}

impl From<String> for Name {
    fn from(value: String) -> Self {
        Name::new(value)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.host, f)
    }
}

/// Resolved addresses. Ports are zero; callers set the service port.
pub type Addrs = Box<dyn Iterator<Item = SocketAddr> + Send>;

pub type Resolving = Pin<Box<dyn Future<Output = Result<Addrs, NetError>> + Send>>;

/// Host name resolution used by the connect job.
///
/// Implementations must be usable concurrently through `&self` and return
/// boxed futures so they can be held as trait objects.
pub trait Resolve: Send + Sync {
    fn resolve(&self, name: Name) -> Resolving;
}

impl<R: Resolve + ?Sized> Resolve for Arc<R> {
    fn resolve(&self, name: Name) -> Resolving {
        (**self).resolve(name)
    }
}

/// Resolves `host` and attaches `port`, skipping the resolver for IP literals.
pub async fn resolve_host(
    resolver: &dyn Resolve,
    host: &str,
    port: u16,
) -> Result<Vec<SocketAddr>, NetError> {
    let name = Name::new(host);
    if let Some(ip) = name.as_ip() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let addrs = resolver.resolve(name).await?;
    Ok(addrs
        .map(|mut addr| {
            addr.set_port(port);
            addr
        })
        .collect())
}

/// Resolver that answers configured hosts locally and delegates the rest.
///
/// ```rust,ignore
/// use sockio::dns::{DnsResolverWithOverrides, GaiResolver};
///
/// let resolver = DnsResolverWithOverrides::new(Arc::new(GaiResolver::new()))
///     .with_override("db.internal", vec!["10.0.0.5".parse()?]);
/// ```
pub struct DnsResolverWithOverrides {
    inner: Arc<dyn Resolve>,
    overrides: HashMap<String, Vec<IpAddr>>,
}

impl DnsResolverWithOverrides {
    pub fn new(inner: Arc<dyn Resolve>) -> Self {
        Self {
            inner,
            overrides: HashMap::new(),
        }
    }

    /// Pins `host` (case-insensitive) to `addrs`.
    pub fn with_override(mut self, host: &str, addrs: Vec<IpAddr>) -> Self {
        self.overrides.insert(host.to_ascii_lowercase(), addrs);
        self
    }

    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }
}

impl Resolve for DnsResolverWithOverrides {
    fn resolve(&self, name: Name) -> Resolving {
        if let Some(ips) = self.overrides.get(&name.as_str().to_ascii_lowercase()) {
            tracing::trace!(host = %name, "dns override hit");
            let addrs: Vec<SocketAddr> = ips.iter().map(|ip| SocketAddr::new(*ip, 0)).collect();
            return Box::pin(std::future::ready(Ok(Box::new(addrs.into_iter()) as Addrs)));
        }
        self.inner.resolve(name)
    }
}

impl fmt::Debug for DnsResolverWithOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsResolverWithOverrides")
            .field("override_count", &self.overrides.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct MockResolver {
        response: Vec<SocketAddr>,
    }

    impl Resolve for MockResolver {
        fn resolve(&self, _name: Name) -> Resolving {
            let addrs = self.response.clone();
            Box::pin(async move { Ok(Box::new(addrs.into_iter()) as Addrs) })
        }
    }

    fn mock() -> Arc<MockResolver> {
        Arc::new(MockResolver {
            response: vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 0)],
        })
    }

    #[test]
    fn test_name_as_ip() {
        assert_eq!(
            Name::new("127.0.0.1").as_ip(),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert!(Name::new("[::1]").as_ip().is_some_and(|ip| ip.is_ipv6()));
        assert_eq!(Name::new("example.com").as_ip(), None);
    }

    #[tokio::test]
    async fn test_override_hit_is_case_insensitive() {
        let resolver = DnsResolverWithOverrides::new(mock())
            .with_override("Override.Local", vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);

        let addrs: Vec<_> = resolver
            .resolve(Name::new("override.LOCAL"))
            .await
            .unwrap()
            .collect();
        assert_eq!(addrs, vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)]);
    }

    #[tokio::test]
    async fn test_override_miss_delegates() {
        let resolver = DnsResolverWithOverrides::new(mock());
        let addrs: Vec<_> = resolver
            .resolve(Name::new("not-overridden.com"))
            .await
            .unwrap()
            .collect();
        assert_eq!(addrs[0].ip(), IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[tokio::test]
    async fn test_resolve_host_sets_port() {
        let resolver = mock();
        let addrs = resolve_host(resolver.as_ref(), "example.com", 443).await.unwrap();
        assert_eq!(addrs[0].port(), 443);

        let addrs = resolve_host(resolver.as_ref(), "[::1]", 80).await.unwrap();
        assert_eq!(addrs, vec!["[::1]:80".parse::<SocketAddr>().unwrap()]);
    }
}
