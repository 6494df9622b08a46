//! # sockio
//!
//! Async socket runtime on top of tokio: connected stream sockets with a
//! single-pending-read discipline, TLS negotiation through BoringSSL,
//! per-destination connection pooling with idle eviction, listening
//! sockets and datagram endpoints.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sockio::reactor::Reactor;
//! use sockio::socket::{BasicSocketPool, PoolOptions, SocketPool};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sockio::base::neterror::NetError> {
//!     let reactor = Reactor::new();
//!     let pool = BasicSocketPool::new(reactor.clone(), PoolOptions::default());
//!
//!     let socket = pool.checkout("tcp://example.com:80", None).await?;
//!     socket.write("HEAD / HTTP/1.0\r\n\r\n").await?;
//!     while let Some(chunk) = socket.read().await? {
//!         print!("{}", String::from_utf8_lossy(&chunk));
//!     }
//!     pool.clear(&socket)?;
//!     socket.close();
//!
//!     reactor.idle().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Errors, URIs and address formatting
//! - [`reactor`] - Watcher bookkeeping over the tokio runtime
//! - [`socket`] - Sockets, TLS, pooling, listeners and datagram endpoints
//! - [`dns`] - Resolver seam used by the connect job

pub mod base;
pub mod dns;
pub mod reactor;
pub mod socket;
