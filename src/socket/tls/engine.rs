use super::{ClientTlsOptions, CryptoState, TlsOptions};
use crate::base::neterror::NetError;
use crate::socket::client::{wait_closed, Socket};
use crate::socket::stream::{RawIo, Stream};
use boring::ssl::{ErrorCode, HandshakeError, SslStream};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::Interest;
use tokio::sync::watch;

/// TLS session bookkeeping owned by a socket.
pub(crate) struct CryptoSession {
    pub(crate) state: CryptoState,
    pub(crate) active: Option<TlsOptions>,
    pub(crate) ssl: Option<SslStream<RawIo>>,
    progress: watch::Sender<CryptoState>,
}

impl Default for CryptoSession {
    fn default() -> Self {
        Self {
            state: CryptoState::Plain,
            active: None,
            ssl: None,
            progress: watch::channel(CryptoState::Plain).0,
        }
    }
}

impl CryptoSession {
    fn set_state(&mut self, state: CryptoState) {
        self.state = state;
        self.progress.send_replace(state);
    }

    /// Drops the session. `notify` sends a best-effort close_notify first.
    fn teardown(&mut self, notify: bool) {
        self.active = None;
        if let Some(mut ssl) = self.ssl.take() {
            if notify {
                let _ = ssl.shutdown();
            }
        }
        if self.state != CryptoState::Failed {
            self.set_state(CryptoState::Plain);
        }
    }
}

/// What `enable` has to do for a requested option set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPlan {
    /// The session already runs with an equal option set.
    Skip,
    Handshake,
    /// Tear down the current session, then handshake.
    Renegotiate,
    /// A handshake with an equal option set is in flight; wait for it.
    Join,
    /// A handshake with a different option set is in flight.
    Conflict,
}

/// Decides whether enabling `requested` needs a handshake.
pub fn negotiation_plan(
    active: Option<&TlsOptions>,
    state: CryptoState,
    requested: &TlsOptions,
    force: bool,
) -> NegotiationPlan {
    match state {
        CryptoState::Negotiating if active == Some(requested) => NegotiationPlan::Join,
        CryptoState::Negotiating => NegotiationPlan::Conflict,
        CryptoState::Secured if !force && active == Some(requested) => NegotiationPlan::Skip,
        CryptoState::Secured => NegotiationPlan::Renegotiate,
        CryptoState::Plain | CryptoState::Failed => NegotiationPlan::Handshake,
    }
}

/// Result of one non-blocking TLS record operation.
pub(crate) enum TlsIo {
    Done(usize),
    Eof,
    Want(Interest),
    Failed(io::Error),
}

fn classify(e: boring::ssl::Error) -> TlsIo {
    match e.code() {
        ErrorCode::ZERO_RETURN => TlsIo::Eof,
        ErrorCode::WANT_READ => TlsIo::Want(Interest::READABLE),
        ErrorCode::WANT_WRITE => TlsIo::Want(Interest::WRITABLE),
        ErrorCode::SYSCALL if e.io_error().is_none() => TlsIo::Eof,
        _ => match e.into_io_error() {
            Ok(io) => TlsIo::Failed(io),
            Err(e) => TlsIo::Failed(io::Error::new(io::ErrorKind::Other, e.to_string())),
        },
    }
}

pub(crate) fn tls_read(ssl: &mut SslStream<RawIo>, buf: &mut [u8]) -> TlsIo {
    match ssl.ssl_read(buf) {
        Ok(0) => TlsIo::Eof,
        Ok(n) => TlsIo::Done(n),
        Err(e) => classify(e),
    }
}

pub(crate) fn tls_write(ssl: &mut SslStream<RawIo>, buf: &[u8]) -> TlsIo {
    match ssl.ssl_write(buf) {
        Ok(n) => TlsIo::Done(n),
        Err(e) => match classify(e) {
            TlsIo::Eof => TlsIo::Failed(io::ErrorKind::BrokenPipe.into()),
            other => other,
        },
    }
}

/// Enables TLS on `socket` with `options`.
///
/// An already-secured socket with an equal option set is left untouched
/// unless `force` is set; any other secured socket is torn down and
/// renegotiated. A call made while an equal handshake is in flight waits
/// for it; one with different options fails with
/// [`NetError::PendingCrypto`]. A failed handshake closes the socket.
pub(crate) async fn enable(
    socket: &Socket,
    options: TlsOptions,
    force: bool,
) -> Result<(), NetError> {
    let prior = loop {
        // Plan and claim happen under one lock so concurrent callers
        // never both start a handshake.
        let mut progress = {
            let mut crypto = socket.crypto();
            let plan = negotiation_plan(crypto.active.as_ref(), crypto.state, &options, force);
            match plan {
                NegotiationPlan::Skip => {
                    tracing::trace!(socket = socket.id(), "crypto already enabled with equal options");
                    return Ok(());
                }
                NegotiationPlan::Conflict => return Err(NetError::PendingCrypto),
                NegotiationPlan::Join => crypto.progress.subscribe(),
                NegotiationPlan::Handshake | NegotiationPlan::Renegotiate => {
                    if plan == NegotiationPlan::Renegotiate {
                        tracing::debug!(socket = socket.id(), "renegotiating crypto");
                        // The peer starts its own fresh session; an alert
                        // here would land in its new handshake.
                        crypto.teardown(false);
                    }
                    let prior = crypto.state;
                    crypto.active = Some(options.clone());
                    crypto.set_state(CryptoState::Negotiating);
                    break prior;
                }
            }
        };

        tracing::trace!(socket = socket.id(), "joining in-flight crypto handshake");
        let closed = socket.closed_signal();
        tokio::select! {
            biased;
            _ = wait_closed(closed) => return Err(NetError::SocketClosed),
            _ = progress.wait_for(|state| *state != CryptoState::Negotiating) => {}
        }
    };

    let mut negotiation = Negotiation {
        socket,
        prior,
        settled: false,
    };

    let (stream, start) = match start_handshake(socket, &options) {
        Ok(started) => started,
        Err(e) => {
            negotiation.abandon();
            return Err(e);
        }
    };
    tracing::debug!(socket = socket.id(), "crypto handshake started");

    match handshake(socket, &stream, start).await {
        Ok(ssl) => {
            negotiation.secured(ssl);
            tracing::debug!(socket = socket.id(), "crypto handshake finished");
            Ok(())
        }
        Err(e) => {
            tracing::debug!(socket = socket.id(), error = %e, "crypto handshake failed");
            negotiation.failed();
            Err(e)
        }
    }
}

/// Settles the `Negotiating` state exactly once, including when the
/// enabling future is dropped mid-handshake.
struct Negotiation<'a> {
    socket: &'a Socket,
    prior: CryptoState,
    settled: bool,
}

impl Negotiation<'_> {
    fn secured(&mut self, ssl: SslStream<RawIo>) {
        self.settled = true;
        let mut crypto = self.socket.crypto();
        crypto.ssl = Some(ssl);
        crypto.set_state(CryptoState::Secured);
    }

    /// Nothing touched the wire; back to the state before the claim.
    fn abandon(&mut self) {
        self.settled = true;
        let mut crypto = self.socket.crypto();
        crypto.active = None;
        crypto.set_state(self.prior);
    }

    fn failed(&mut self) {
        self.settled = true;
        {
            let mut crypto = self.socket.crypto();
            crypto.active = None;
            crypto.set_state(CryptoState::Failed);
        }
        self.socket.close();
    }
}

impl Drop for Negotiation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(socket = self.socket.id(), "crypto handshake abandoned mid-flight");
            self.failed();
        }
    }
}

type Started = (Arc<Stream>, Result<SslStream<RawIo>, HandshakeError<RawIo>>);

fn start_handshake(socket: &Socket, options: &TlsOptions) -> Result<Started, NetError> {
    let stream = socket.stream()?;
    let io = RawIo::new(Arc::clone(&stream));
    let start = match options {
        TlsOptions::Client(client) => {
            let client = client.clone().with_default_peer_name(socket.peer_name());
            start_client(&client, io)?
        }
        TlsOptions::Server(server) => server.acceptor()?.accept(io),
    };
    Ok((stream, start))
}

/// Drops the TLS session and returns the socket to plaintext.
pub(crate) fn disable(socket: &Socket) {
    socket.crypto().teardown(true);
}

fn start_client(
    options: &ClientTlsOptions,
    io: RawIo,
) -> Result<Result<SslStream<RawIo>, HandshakeError<RawIo>>, NetError> {
    let config_err = |e: boring::error::ErrorStack| NetError::InvalidTlsConfig(e.to_string());

    let connector = options.connector()?;
    let mut config = connector.configure().map_err(config_err)?;

    let domain = options.peer_name.as_deref().unwrap_or_default();
    let named = !domain.is_empty() && ClientTlsOptions::should_set_sni(domain);

    config.set_use_server_name_indication(options.sni_enabled && named);
    config.set_verify_hostname(options.verify_peer && named);
    if options.verify_peer && !named {
        if let Ok(ip) = domain.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            config.param_mut().set_ip(ip).map_err(config_err)?;
        }
    }

    Ok(config.connect(domain, io))
}

/// Retries the non-blocking handshake each time the descriptor is ready.
async fn handshake(
    socket: &Socket,
    stream: &Stream,
    mut attempt: Result<SslStream<RawIo>, HandshakeError<RawIo>>,
) -> Result<SslStream<RawIo>, NetError> {
    loop {
        match attempt {
            Ok(ssl) => return Ok(ssl),
            Err(HandshakeError::WouldBlock(mid)) => {
                let interest = if mid.error().code() == ErrorCode::WANT_WRITE {
                    Interest::WRITABLE
                } else {
                    Interest::READABLE
                };
                socket.wait(stream, interest).await?;
                attempt = mid.handshake();
            }
            Err(HandshakeError::Failure(mid)) => {
                let error = mid.error();
                if peer_reset(error, stream) {
                    return Err(NetError::CryptoPeerReset);
                }
                return Err(NetError::CryptoNegotiation(error.to_string()));
            }
            Err(HandshakeError::SetupFailure(e)) => {
                return Err(NetError::CryptoNegotiation(e.to_string()));
            }
        }
    }
}

fn peer_reset(error: &boring::ssl::Error, stream: &Stream) -> bool {
    if let Some(io) = error.io_error() {
        return matches!(
            io.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
        );
    }
    matches!(error.code(), ErrorCode::SYSCALL | ErrorCode::ZERO_RETURN) || !stream.is_alive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::tls::ServerTlsOptions;

    fn client(peer: &str) -> TlsOptions {
        ClientTlsOptions::builder().peer_name(peer).build().into()
    }

    #[test]
    fn test_plain_socket_always_handshakes() {
        let opts = client("a.test");
        for state in [CryptoState::Plain, CryptoState::Failed] {
            assert_eq!(negotiation_plan(None, state, &opts, false), NegotiationPlan::Handshake);
            assert_eq!(negotiation_plan(None, state, &opts, true), NegotiationPlan::Handshake);
        }
    }

    #[test]
    fn test_equal_options_skip() {
        let active = client("a.test");
        let requested = client("a.test");
        assert_eq!(
            negotiation_plan(Some(&active), CryptoState::Secured, &requested, false),
            NegotiationPlan::Skip
        );
    }

    #[test]
    fn test_force_renegotiates_equal_options() {
        let opts = client("a.test");
        assert_eq!(
            negotiation_plan(Some(&opts), CryptoState::Secured, &opts, true),
            NegotiationPlan::Renegotiate
        );
    }

    #[test]
    fn test_different_options_renegotiate() {
        let active = client("a.test");
        assert_eq!(
            negotiation_plan(Some(&active), CryptoState::Secured, &client("b.test"), false),
            NegotiationPlan::Renegotiate
        );

        let server: TlsOptions = ServerTlsOptions::default().into();
        assert_eq!(
            negotiation_plan(Some(&active), CryptoState::Secured, &server, false),
            NegotiationPlan::Renegotiate
        );
    }

    #[test]
    fn test_in_flight_handshake_is_joined_or_refused() {
        let active = client("a.test");
        assert_eq!(
            negotiation_plan(Some(&active), CryptoState::Negotiating, &client("a.test"), false),
            NegotiationPlan::Join
        );
        assert_eq!(
            negotiation_plan(Some(&active), CryptoState::Negotiating, &client("b.test"), false),
            NegotiationPlan::Conflict
        );
        // Forcing never interrupts a handshake that is still running.
        assert_eq!(
            negotiation_plan(Some(&active), CryptoState::Negotiating, &client("b.test"), true),
            NegotiationPlan::Conflict
        );
    }

    #[test]
    fn test_session_publishes_state_changes() {
        let mut session = CryptoSession::default();
        let progress = session.progress.subscribe();
        session.active = Some(client("a.test"));
        session.set_state(CryptoState::Negotiating);
        assert_eq!(*progress.borrow(), CryptoState::Negotiating);

        session.teardown(false);
        assert_eq!(session.state, CryptoState::Plain);
        assert!(session.active.is_none());
        assert_eq!(*progress.borrow(), CryptoState::Plain);

        session.set_state(CryptoState::Failed);
        session.teardown(true);
        assert_eq!(session.state, CryptoState::Failed);
    }
}
