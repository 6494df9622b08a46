use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::socket::SocketId;

#[derive(Debug, Error, Clone)]
pub enum NetError {
    // Usage faults
    #[error("A read operation is already pending")]
    PendingRead,
    #[error("An accept operation is already pending")]
    PendingAccept,
    #[error("A receive operation is already pending")]
    PendingReceive,
    #[error("The socket has been closed")]
    SocketClosed,
    #[error("A crypto negotiation with different options is already pending")]
    PendingCrypto,
    #[error("The endpoint is not writable")]
    EndpointNotWritable,
    #[error("Unknown socket: {0}")]
    UnknownSocket(SocketId),
    #[error("Invalid URI: {0}")]
    InvalidUri(String),
    #[error("Invalid URI scheme ({0}); tcp, udp, unix or udg scheme expected")]
    InvalidUriScheme(String),
    #[error("Invalid bindTo value: {0}")]
    InvalidBindTo(String),
    #[error("Invalid IPv4 address: {0}")]
    InvalidIpv4(String),
    #[error("Invalid IPv6 address: {0}")]
    InvalidIpv6(String),
    #[error("Invalid port: {0}")]
    InvalidPort(String),
    #[error("Invalid TLS configuration: {0}")]
    InvalidTlsConfig(String),

    // Connection faults
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Connection to {uri} failed: {source}")]
    ConnectionFailedTo { uri: String, source: Arc<io::Error> },
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Name not resolved for {domain}: {source}")]
    NameNotResolvedFor { domain: String, source: Arc<io::Error> },
    #[error("Address in use")]
    AddressInUse,
    #[error("Address invalid")]
    AddressInvalid,
    #[error("Could not bind {uri}: {source}")]
    BindFailed { uri: String, source: Arc<io::Error> },
    #[error("Could not send packet on endpoint: {0}")]
    SendFailed(String),
    #[error("Socket I/O failed: {0}")]
    Io(Arc<io::Error>),

    // Crypto faults
    #[error("Crypto negotiation failed: Connection reset by peer")]
    CryptoPeerReset,
    #[error("Crypto negotiation failed: {0}")]
    CryptoNegotiation(String),

    // Cancellation
    #[error("The operation was cancelled")]
    Cancelled,
}

impl NetError {
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionFailed | NetError::ConnectionFailedTo { .. } => -104,
            NetError::NameNotResolved | NetError::NameNotResolvedFor { .. } => -105,
            NetError::CryptoNegotiation(_) => -107,
            NetError::AddressInvalid => -108,
            NetError::SocketClosed => -112,
            NetError::ConnectionTimedOut => -118,
            NetError::AddressInUse => -147,
            NetError::BindFailed { .. } => -148,
            NetError::SendFailed(_) => -149,
            NetError::Io(_) => -150,
            NetError::CryptoPeerReset => -151,
            NetError::Cancelled => -3,

            NetError::InvalidUri(_) => -300,
            NetError::InvalidUriScheme(_) => -302,
            NetError::InvalidBindTo(_) => -304,
            NetError::InvalidIpv4(_) => -305,
            NetError::InvalidIpv6(_) => -306,
            NetError::InvalidPort(_) => -307,
            NetError::InvalidTlsConfig(_) => -308,

            // Usage faults (custom codes starting at -1000)
            NetError::PendingRead => -1000,
            NetError::PendingAccept => -1001,
            NetError::PendingReceive => -1002,
            NetError::EndpointNotWritable => -1003,
            NetError::UnknownSocket(_) => -1004,
            NetError::PendingCrypto => -1005,
        }
    }

    /// Programmer errors: never retried, never recovered internally.
    pub fn is_usage_fault(&self) -> bool {
        matches!(
            self,
            NetError::PendingRead
                | NetError::PendingAccept
                | NetError::PendingReceive
                | NetError::PendingCrypto
                | NetError::SocketClosed
                | NetError::EndpointNotWritable
                | NetError::UnknownSocket(_)
                | NetError::InvalidUri(_)
                | NetError::InvalidUriScheme(_)
                | NetError::InvalidBindTo(_)
                | NetError::InvalidIpv4(_)
                | NetError::InvalidIpv6(_)
                | NetError::InvalidPort(_)
                | NetError::InvalidTlsConfig(_)
        )
    }

    pub fn is_crypto_fault(&self) -> bool {
        matches!(self, NetError::CryptoPeerReset | NetError::CryptoNegotiation(_))
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, NetError::Cancelled)
    }

    pub(crate) fn connection_failed_to(uri: &str, source: io::Error) -> Self {
        NetError::ConnectionFailedTo {
            uri: uri.to_string(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn dns_failed(domain: &str, source: io::Error) -> Self {
        NetError::NameNotResolvedFor {
            domain: domain.to_string(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn bind_failed(uri: &str, source: io::Error) -> Self {
        NetError::BindFailed {
            uri: uri.to_string(),
            source: Arc::new(source),
        }
    }
}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
            io::ErrorKind::ConnectionReset => NetError::ConnectionReset,
            io::ErrorKind::TimedOut => NetError::ConnectionTimedOut,
            io::ErrorKind::AddrInUse => NetError::AddressInUse,
            io::ErrorKind::AddrNotAvailable => NetError::AddressInvalid,
            _ => NetError::Io(Arc::new(e)),
        }
    }
}
