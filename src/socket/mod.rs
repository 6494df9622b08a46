//! Sockets and connection management.
//!
//! - [`Socket`]: connected stream socket with single-pending-read discipline
//! - [`tls`]: crypto negotiation on top of a socket (BoringSSL)
//! - [`pool`]: per-destination pooling of idle client sockets
//! - [`connectjob`]: DNS → TCP/Unix connect flow used by the pool
//! - [`server`]: listening sockets and the accept loop
//! - [`datagram`]: UDP and Unix datagram endpoints

pub mod client;
pub mod connectjob;
pub mod datagram;
pub mod pool;
pub mod server;
pub(crate) mod stream;
pub mod tls;

pub use self::client::Socket;
pub use self::connectjob::{connect, crypto_connect, AddressFamily, Connect, ConnectJob, ConnectOptions};
pub use self::datagram::{BindOptions, DatagramSocket};
pub use self::pool::{BasicSocketPool, PoolOptions, SocketPool, StaticSocketPool};
pub use self::server::{listen, ListenOptions, ListeningSocket};

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique socket identity. Never reused, unlike descriptors.
pub type SocketId = u64;

/// Default maximum number of bytes returned by one read or receive.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_socket_id() -> SocketId {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)
}
