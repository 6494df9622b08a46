//! System resolver (`getaddrinfo`), run off the async workers by tokio.

use super::{Addrs, Name, Resolve, Resolving};
use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use std::io;

/// Resolves through the operating system so `/etc/hosts` and
/// `resolv.conf` are honored.
#[derive(Clone, Debug, Default)]
pub struct GaiResolver;

impl GaiResolver {
    pub fn new() -> Self {
        Self
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let domain = name.as_str().to_string();
            tracing::debug!(domain = %domain, "resolving via getaddrinfo");

            let addrs: Vec<_> = tokio::net::lookup_host((domain.as_str(), 0))
                .await
                .dns_context(&domain)?
                .collect();

            if addrs.is_empty() {
                return Err(NetError::dns_failed(
                    &domain,
                    io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
                ));
            }

            tracing::debug!(domain = %domain, count = addrs.len(), "dns resolution complete");
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gai_resolver_localhost() {
        let addrs: Vec<_> = GaiResolver::new()
            .resolve(Name::new("localhost"))
            .await
            .unwrap()
            .collect();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.ip().is_loopback()));
    }
}
