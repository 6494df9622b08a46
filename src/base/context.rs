//! Ergonomic error context helpers.
//!
//! Provides extension traits for adding context to `Result` types,
//! converting IO errors into context-rich `NetError` variants.

use crate::base::neterror::NetError;
use std::io;

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Add connection context to an IO error.
    ///
    /// # Example
    /// ```ignore
    /// use sockio::base::context::IoResultExt;
    ///
    /// let stream = TcpStream::connect(addr).await
    ///     .connection_context("tcp://example.com:443")?;
    /// // Error: "Connection to tcp://example.com:443 failed: connection refused"
    /// ```
    fn connection_context(self, uri: &str) -> Result<T, NetError>;

    /// Add DNS resolution context to an IO error.
    fn dns_context(self, domain: &str) -> Result<T, NetError>;

    /// Add bind/listen context to an IO error.
    fn bind_context(self, uri: &str) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn connection_context(self, uri: &str) -> Result<T, NetError> {
        self.map_err(|e| NetError::connection_failed_to(uri, e))
    }

    fn dns_context(self, domain: &str) -> Result<T, NetError> {
        self.map_err(|e| NetError::dns_failed(domain, e))
    }

    fn bind_context(self, uri: &str) -> Result<T, NetError> {
        self.map_err(|e| NetError::bind_failed(uri, e))
    }
}
