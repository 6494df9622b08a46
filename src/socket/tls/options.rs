use super::certificate::Certificate;
use super::TlsVersion;
use crate::base::neterror::NetError;
use boring::error::ErrorStack;
use boring::ssl::{
    AlpnError, NameType, SniError, SslAcceptor, SslConnector, SslContext, SslContextBuilder,
    SslMethod, SslVerifyMode,
};
use boring::x509::X509;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

fn config_err(e: ErrorStack) -> NetError {
    NetError::InvalidTlsConfig(e.to_string())
}

/// Encodes protocol names in ALPN wire format (length-prefixed).
fn alpn_wire(protocols: &[String]) -> Result<Vec<u8>, NetError> {
    let mut wire = Vec::new();
    for proto in protocols {
        if proto.is_empty() || proto.len() > 255 {
            return Err(NetError::InvalidTlsConfig(format!(
                "invalid ALPN protocol: {proto:?}"
            )));
        }
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto.as_bytes());
    }
    Ok(wire)
}

/// Picks the first server-preferred protocol the client offered.
fn select_alpn<'a>(server: &[String], client: &'a [u8]) -> Option<&'a [u8]> {
    let mut offered = Vec::new();
    let mut rest = client;
    while let Some((&len, tail)) = rest.split_first() {
        let len = len as usize;
        if tail.len() < len {
            break;
        }
        offered.push(&tail[..len]);
        rest = &tail[len..];
    }
    server
        .iter()
        .find_map(|proto| offered.iter().copied().find(|o| *o == proto.as_bytes()))
}

fn apply_common(
    builder: &mut SslContextBuilder,
    min: Option<TlsVersion>,
    max: Option<TlsVersion>,
    ciphers: Option<&str>,
) -> Result<(), NetError> {
    if let Some(min) = min {
        builder.set_min_proto_version(Some(min.0)).map_err(config_err)?;
    }
    if let Some(max) = max {
        builder.set_max_proto_version(Some(max.0)).map_err(config_err)?;
    }
    if let Some(ciphers) = ciphers {
        builder.set_cipher_list(ciphers).map_err(config_err)?;
    }
    Ok(())
}

/// Builder for [`ClientTlsOptions`].
#[must_use]
#[derive(Debug, Clone, Default)]
pub struct ClientTlsOptionsBuilder {
    config: ClientTlsOptions,
}

/// Client-side TLS policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTlsOptions {
    /// Name used for SNI and hostname verification. Defaults to the
    /// destination host when the socket was created by a connect helper.
    pub peer_name: Option<String>,

    /// Verify the peer certificate chain and hostname.
    pub verify_peer: bool,

    /// Send the SNI extension (never sent for IP literals).
    pub sni_enabled: bool,

    /// CA bundle file used instead of the system trust store.
    pub ca_file: Option<PathBuf>,

    /// Additional trusted CA certificates (PEM).
    pub ca_pem: Option<Vec<u8>>,

    /// ALPN protocols in preference order.
    pub alpn_protocols: Vec<String>,

    pub min_tls_version: Option<TlsVersion>,
    pub max_tls_version: Option<TlsVersion>,

    /// Cipher suite configuration string.
    pub cipher_list: Option<String>,

    /// Client certificate for mutual TLS.
    pub certificate: Option<Certificate>,
}

impl Default for ClientTlsOptions {
    fn default() -> Self {
        Self {
            peer_name: None,
            verify_peer: true,
            sni_enabled: true,
            ca_file: None,
            ca_pem: None,
            alpn_protocols: Vec::new(),
            min_tls_version: Some(TlsVersion::TLS_1_2),
            max_tls_version: None,
            cipher_list: None,
            certificate: None,
        }
    }
}

impl ClientTlsOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer_name(mut self, name: &str) -> Self {
        self.config.peer_name = Some(name.to_string());
        self
    }

    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.config.verify_peer = verify;
        self
    }

    pub fn sni_enabled(mut self, enabled: bool) -> Self {
        self.config.sni_enabled = enabled;
        self
    }

    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_file = Some(path.into());
        self
    }

    pub fn ca_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.config.ca_pem = Some(pem.into());
        self
    }

    pub fn alpn_protocols(mut self, alpn: &[&str]) -> Self {
        self.config.alpn_protocols = alpn.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn min_tls_version(mut self, version: TlsVersion) -> Self {
        self.config.min_tls_version = Some(version);
        self
    }

    pub fn max_tls_version(mut self, version: TlsVersion) -> Self {
        self.config.max_tls_version = Some(version);
        self
    }

    pub fn cipher_list(mut self, ciphers: &str) -> Self {
        self.config.cipher_list = Some(ciphers.to_string());
        self
    }

    pub fn certificate(mut self, certificate: Certificate) -> Self {
        self.config.certificate = Some(certificate);
        self
    }

    pub fn build(self) -> ClientTlsOptions {
        self.config
    }
}

impl ClientTlsOptions {
    pub fn builder() -> ClientTlsOptionsBuilder {
        ClientTlsOptionsBuilder::new()
    }

    /// Fills in the peer name when none was configured.
    pub(crate) fn with_default_peer_name(mut self, name: Option<&str>) -> Self {
        if self.peer_name.is_none() {
            self.peer_name = name.map(str::to_string);
        }
        self
    }

    pub(crate) fn connector(&self) -> Result<SslConnector, NetError> {
        let mut builder = SslConnector::builder(SslMethod::tls()).map_err(config_err)?;
        apply_common(
            &mut builder,
            self.min_tls_version,
            self.max_tls_version,
            self.cipher_list.as_deref(),
        )?;

        if !self.alpn_protocols.is_empty() {
            builder
                .set_alpn_protos(&alpn_wire(&self.alpn_protocols)?)
                .map_err(config_err)?;
        }

        if self.verify_peer {
            builder.set_verify(SslVerifyMode::PEER);
            if let Some(ca_file) = &self.ca_file {
                builder.set_ca_file(ca_file).map_err(config_err)?;
            }
            if let Some(pem) = &self.ca_pem {
                for ca in X509::stack_from_pem(pem).map_err(config_err)? {
                    builder.cert_store_mut().add_cert(ca).map_err(config_err)?;
                }
            }
        } else {
            builder.set_verify(SslVerifyMode::NONE);
        }

        if let Some(certificate) = &self.certificate {
            certificate.apply_to(&mut builder)?;
        }

        Ok(builder.build())
    }

    /// Check if SNI should be set for this host.
    /// Per RFC 6066, SNI MUST NOT be set for raw IP addresses.
    pub fn should_set_sni(host: &str) -> bool {
        host.trim_matches(|c| c == '[' || c == ']')
            .parse::<std::net::IpAddr>()
            .is_err()
    }
}

/// Builder for [`ServerTlsOptions`].
#[must_use]
#[derive(Debug, Clone, Default)]
pub struct ServerTlsOptionsBuilder {
    config: ServerTlsOptions,
}

/// Server-side TLS policy, including the SNI certificate map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTlsOptions {
    /// Certificate served when SNI is absent or matches no entry.
    pub default_certificate: Option<Certificate>,

    /// Hostname to certificate mapping; keys may be `*.example.com`.
    pub certificates: BTreeMap<String, Certificate>,

    /// Require and verify client certificates.
    pub verify_peer: bool,

    /// CA bundle used to verify client certificates.
    pub ca_file: Option<PathBuf>,

    pub alpn_protocols: Vec<String>,

    pub min_tls_version: Option<TlsVersion>,
    pub max_tls_version: Option<TlsVersion>,
    pub cipher_list: Option<String>,
}

impl Default for ServerTlsOptions {
    fn default() -> Self {
        Self {
            default_certificate: None,
            certificates: BTreeMap::new(),
            verify_peer: false,
            ca_file: None,
            alpn_protocols: Vec::new(),
            min_tls_version: Some(TlsVersion::TLS_1_2),
            max_tls_version: None,
            cipher_list: None,
        }
    }
}

impl ServerTlsOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_certificate(mut self, certificate: Certificate) -> Self {
        self.config.default_certificate = Some(certificate);
        self
    }

    pub fn certificate(mut self, hostname: &str, certificate: Certificate) -> Self {
        self.config
            .certificates
            .insert(hostname.to_ascii_lowercase(), certificate);
        self
    }

    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.config.verify_peer = verify;
        self
    }

    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_file = Some(path.into());
        self
    }

    pub fn alpn_protocols(mut self, alpn: &[&str]) -> Self {
        self.config.alpn_protocols = alpn.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn min_tls_version(mut self, version: TlsVersion) -> Self {
        self.config.min_tls_version = Some(version);
        self
    }

    pub fn max_tls_version(mut self, version: TlsVersion) -> Self {
        self.config.max_tls_version = Some(version);
        self
    }

    pub fn cipher_list(mut self, ciphers: &str) -> Self {
        self.config.cipher_list = Some(ciphers.to_string());
        self
    }

    pub fn build(self) -> ServerTlsOptions {
        self.config
    }
}

impl ServerTlsOptions {
    pub fn builder() -> ServerTlsOptionsBuilder {
        ServerTlsOptionsBuilder::new()
    }

    pub(crate) fn acceptor(&self) -> Result<SslAcceptor, NetError> {
        let default = self.default_certificate.as_ref().ok_or_else(|| {
            NetError::InvalidTlsConfig("a default certificate is required".into())
        })?;

        let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls()).map_err(config_err)?;
        default.apply_to(&mut builder)?;
        apply_common(
            &mut builder,
            self.min_tls_version,
            self.max_tls_version,
            self.cipher_list.as_deref(),
        )?;

        if self.verify_peer {
            builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
            if let Some(ca_file) = &self.ca_file {
                builder.set_ca_file(ca_file).map_err(config_err)?;
            }
        } else {
            builder.set_verify(SslVerifyMode::NONE);
        }

        if !self.alpn_protocols.is_empty() {
            let protocols = self.alpn_protocols.clone();
            builder.set_alpn_select_callback(move |_, client| {
                select_alpn(&protocols, client).ok_or(AlpnError::NOACK)
            });
        }

        if !self.certificates.is_empty() {
            let mut contexts = HashMap::with_capacity(self.certificates.len());
            for (hostname, certificate) in &self.certificates {
                let mut ctx = SslContext::builder(SslMethod::tls()).map_err(config_err)?;
                certificate.apply_to(&mut ctx)?;
                contexts.insert(hostname.clone(), ctx.build());
            }

            builder.set_servername_callback(move |ssl, _alert| {
                let name = ssl
                    .servername(NameType::HOST_NAME)
                    .map(str::to_ascii_lowercase);
                if let Some(ctx) = name.as_deref().and_then(|n| lookup_sni(&contexts, n)) {
                    ssl.set_ssl_context(ctx).map_err(|_| SniError::ALERT_FATAL)?;
                }
                Ok(())
            });
        }

        Ok(builder.build())
    }
}

/// Exact hostname match first, then a single-label wildcard.
fn lookup_sni<'a, T>(map: &'a HashMap<String, T>, name: &str) -> Option<&'a T> {
    map.get(name).or_else(|| {
        let (_, parent) = name.split_once('.')?;
        map.get(&format!("*.{parent}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpn_wire_format() {
        let wire = alpn_wire(&["h2".to_string(), "http/1.1".to_string()]).unwrap();
        assert_eq!(wire, b"\x02h2\x08http/1.1");
        assert!(alpn_wire(&["".to_string()]).is_err());
    }

    #[test]
    fn test_select_alpn_prefers_server_order() {
        let server = vec!["http/1.1".to_string(), "h2".to_string()];
        assert_eq!(select_alpn(&server, b"\x02h2\x08http/1.1"), Some(&b"http/1.1"[..]));
        assert_eq!(select_alpn(&server, b"\x03foo"), None);
    }

    #[test]
    fn test_lookup_sni() {
        let mut map = HashMap::new();
        map.insert("example.com".to_string(), 1);
        map.insert("*.example.com".to_string(), 2);

        assert_eq!(lookup_sni(&map, "example.com"), Some(&1));
        assert_eq!(lookup_sni(&map, "www.example.com"), Some(&2));
        assert_eq!(lookup_sni(&map, "a.b.example.com"), None);
        assert_eq!(lookup_sni(&map, "other.org"), None);
    }

    #[test]
    fn test_should_set_sni() {
        assert!(ClientTlsOptions::should_set_sni("example.com"));
        assert!(!ClientTlsOptions::should_set_sni("127.0.0.1"));
        assert!(!ClientTlsOptions::should_set_sni("[::1]"));
    }

    #[test]
    fn test_builders() {
        let client = ClientTlsOptions::builder()
            .peer_name("example.com")
            .alpn_protocols(&["h2"])
            .verify_peer(false)
            .build();
        assert_eq!(client.peer_name.as_deref(), Some("example.com"));
        assert!(!client.verify_peer);
        assert_ne!(client, ClientTlsOptions::default());

        let server = ServerTlsOptions::builder()
            .certificate("Example.COM", Certificate::from_pem("c", "k"))
            .build();
        assert!(server.certificates.contains_key("example.com"));
        assert!(matches!(
            server.acceptor(),
            Err(NetError::InvalidTlsConfig(_))
        ));
    }

    #[test]
    fn test_default_peer_name_only_fills_gaps() {
        let opts = ClientTlsOptions::default().with_default_peer_name(Some("a.test"));
        assert_eq!(opts.peer_name.as_deref(), Some("a.test"));

        let opts = ClientTlsOptions::builder()
            .peer_name("b.test")
            .build()
            .with_default_peer_name(Some("a.test"));
        assert_eq!(opts.peer_name.as_deref(), Some("b.test"));
    }
}
