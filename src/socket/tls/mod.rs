//! TLS configuration and the crypto negotiation engine.
//!
//! The handshake itself is delegated to BoringSSL; this module decides when
//! to run it and drives it over the socket's non-blocking descriptor.

use boring::ssl::SslVersion;
use std::fmt;

pub mod certificate;
pub(crate) mod engine;
pub mod options;

pub use self::certificate::Certificate;
pub use self::engine::{negotiation_plan, NegotiationPlan};
pub use self::options::{
    ClientTlsOptions, ClientTlsOptionsBuilder, ServerTlsOptions, ServerTlsOptionsBuilder,
};

/// TLS protocol version.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TlsVersion(pub(crate) SslVersion);

impl TlsVersion {
    pub const TLS_1_0: TlsVersion = TlsVersion(SslVersion::TLS1);
    pub const TLS_1_1: TlsVersion = TlsVersion(SslVersion::TLS1_1);
    pub const TLS_1_2: TlsVersion = TlsVersion(SslVersion::TLS1_2);
    pub const TLS_1_3: TlsVersion = TlsVersion(SslVersion::TLS1_3);
}

impl fmt::Debug for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if *self == Self::TLS_1_0 {
            "TLS_1_0"
        } else if *self == Self::TLS_1_1 {
            "TLS_1_1"
        } else if *self == Self::TLS_1_2 {
            "TLS_1_2"
        } else if *self == Self::TLS_1_3 {
            "TLS_1_3"
        } else {
            "Unknown"
        };
        f.write_str(name)
    }
}

/// The option set applied to a socket. Compared structurally by the
/// renegotiation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsOptions {
    Client(ClientTlsOptions),
    Server(ServerTlsOptions),
}

impl From<ClientTlsOptions> for TlsOptions {
    fn from(options: ClientTlsOptions) -> Self {
        TlsOptions::Client(options)
    }
}

impl From<ServerTlsOptions> for TlsOptions {
    fn from(options: ServerTlsOptions) -> Self {
        TlsOptions::Server(options)
    }
}

/// Per-socket crypto state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptoState {
    #[default]
    Plain,
    Negotiating,
    Secured,
    /// Negotiation failed; the socket has been closed.
    Failed,
}
