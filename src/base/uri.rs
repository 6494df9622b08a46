//! URI parsing and normalization for socket destinations.
//!
//! Accepted forms:
//! - `tcp://host:port`, `udp://host:port` (scheme defaults to `tcp`)
//! - `unix:///path/to/socket`, `udg:///path/to/socket`
//! - IPv6 hosts in brackets: `tcp://[::1]:443`

use crate::base::neterror::NetError;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use url::Url;

/// Transport scheme of a socket URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Tcp,
    Udp,
    Unix,
    Udg,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Udp => "udp",
            Scheme::Unix => "unix",
            Scheme::Udg => "udg",
        }
    }

    /// Whether the scheme addresses a filesystem path rather than host and port.
    pub fn is_path(&self) -> bool {
        matches!(self, Scheme::Unix | Scheme::Udg)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed socket URI.
///
/// For path schemes `host` holds the path with leading slashes trimmed and
/// `port` is zero. IPv6 hosts are always bracketed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketUri {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

/// Parses a URI into scheme, host and port. Host and a non-zero port are required.
pub fn parse_uri(uri: &str) -> Result<SocketUri, NetError> {
    let parsed = split_uri(uri)?;
    if !parsed.scheme.is_path() && parsed.port == 0 {
        return Err(NetError::InvalidUri(format!(
            "{uri}; host and port components required"
        )));
    }
    Ok(parsed)
}

/// Like [`parse_uri`], but accepts port zero (ephemeral port for binding).
pub(crate) fn split_uri(uri: &str) -> Result<SocketUri, NetError> {
    if let Some((scheme, path)) = path_scheme(uri) {
        return Ok(SocketUri {
            scheme,
            host: path.trim_start_matches('/').to_string(),
            port: 0,
        });
    }

    let with_scheme = if uri.contains("://") {
        uri.to_string()
    } else {
        format!("tcp://{uri}")
    };

    let url = Url::parse(&with_scheme).map_err(|_| NetError::InvalidUri(uri.to_string()))?;

    let scheme = match url.scheme() {
        "tcp" => Scheme::Tcp,
        "udp" => Scheme::Udp,
        other => return Err(NetError::InvalidUriScheme(other.to_string())),
    };

    let host = url.host_str().unwrap_or_default();
    let port = url.port();
    if host.is_empty() || port.is_none() {
        return Err(NetError::InvalidUri(format!(
            "{uri}; host and port components required"
        )));
    }

    let host = if host.contains(':') {
        format!("[{}]", host.trim_matches(|c| c == '[' || c == ']'))
    } else {
        host.to_ascii_lowercase()
    };

    Ok(SocketUri {
        scheme,
        host,
        port: port.unwrap_or_default(),
    })
}

/// Splits `unix://` and `udg://` URIs, keeping the path verbatim.
pub(crate) fn path_scheme(uri: &str) -> Option<(Scheme, &str)> {
    let (scheme, rest) = uri.split_once("://")?;
    if scheme.eq_ignore_ascii_case("unix") {
        Some((Scheme::Unix, rest))
    } else if scheme.eq_ignore_ascii_case("udg") {
        Some((Scheme::Udg, rest))
    } else {
        None
    }
}

/// Normalized connection target used as the pool key.
///
/// Two URIs produce equal keys iff they denote the same target:
/// `unix://` URIs are kept verbatim, everything else becomes
/// `scheme://host:port` with lowercase scheme and host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DestinationKey(String);

impl DestinationKey {
    pub fn parse(uri: &str) -> Result<Self, NetError> {
        if uri
            .get(..7)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("unix://"))
        {
            return Ok(DestinationKey(uri.to_string()));
        }

        let parsed = parse_uri(uri)?;
        Ok(DestinationKey(format!(
            "{}://{}:{}",
            parsed.scheme, parsed.host, parsed.port
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unix socket path for `unix://` keys.
    pub fn unix_path(&self) -> Option<&str> {
        path_scheme(&self.0).map(|(_, path)| path)
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalizes a bind address, appending `:0` when no port is present.
///
/// Accepts `a.b.c.d[:port]` and `[ipv6][:port]`.
pub fn normalize_bind_to(bind_to: Option<&str>) -> Result<Option<String>, NetError> {
    let Some(bind_to) = bind_to else {
        return Ok(None);
    };
    let invalid = || NetError::InvalidBindTo(bind_to.to_string());

    if let Some(rest) = bind_to.strip_prefix('[') {
        let (ip, tail) = rest.split_once(']').ok_or_else(invalid)?;
        if ip.is_empty() || !ip.chars().all(|c| c.is_ascii_hexdigit() || c == ':') {
            return Err(invalid());
        }
        let port = bind_port(tail).ok_or_else(invalid)?;

        if ip.parse::<Ipv6Addr>().is_err() {
            return Err(NetError::InvalidIpv6(ip.to_string()));
        }
        let port = check_port(port)?;
        return Ok(Some(format!("[{ip}]:{port}")));
    }

    let (ip, tail) = match bind_to.find(':') {
        Some(idx) => (&bind_to[..idx], &bind_to[idx..]),
        None => (bind_to, ""),
    };
    let groups: Vec<&str> = ip.split('.').collect();
    if groups.len() != 4
        || groups
            .iter()
            .any(|g| g.is_empty() || !g.chars().all(|c| c.is_ascii_digit()))
    {
        return Err(invalid());
    }
    let port = bind_port(tail).ok_or_else(invalid)?;

    if ip.parse::<Ipv4Addr>().is_err() {
        return Err(NetError::InvalidIpv4(ip.to_string()));
    }
    let port = check_port(port)?;
    Ok(Some(format!("{ip}:{port}")))
}

/// Extracts the digits of an optional `:port` suffix.
fn bind_port(tail: &str) -> Option<&str> {
    if tail.is_empty() {
        return Some("0");
    }
    let digits = tail.strip_prefix(':')?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(digits)
}

fn check_port(port: &str) -> Result<u16, NetError> {
    port.parse::<u16>()
        .map_err(|_| NetError::InvalidPort(port.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(uri: &str) -> (Scheme, String, u16) {
        let p = parse_uri(uri).unwrap();
        (p.scheme, p.host, p.port)
    }

    #[test]
    fn test_parse_uri() {
        assert_eq!(parts("unix:///tmp/test"), (Scheme::Unix, "tmp/test".into(), 0));
        assert_eq!(parts("udg://test"), (Scheme::Udg, "test".into(), 0));
        assert_eq!(parts("tcp://test:1234"), (Scheme::Tcp, "test".into(), 1234));
        assert_eq!(parts("udp://host:4321"), (Scheme::Udp, "host".into(), 4321));
        assert_eq!(
            parts("tcp://[2001:db8:85a3:8d3:1319:8a2e:370:7348]:443"),
            (
                Scheme::Tcp,
                "[2001:db8:85a3:8d3:1319:8a2e:370:7348]".into(),
                443
            )
        );
        assert_eq!(parts("example.com:80"), (Scheme::Tcp, "example.com".into(), 80));
    }

    #[test]
    fn test_parse_uri_invalid() {
        assert!(matches!(parse_uri("///////"), Err(NetError::InvalidUri(_))));
        assert!(matches!(parse_uri("tcp://host"), Err(NetError::InvalidUri(_))));
    }

    #[test]
    fn test_parse_uri_invalid_scheme() {
        for uri in ["http://example.com", "https://example.com", "xml://example.com"] {
            let err = parse_uri(uri).unwrap_err();
            assert!(matches!(err, NetError::InvalidUriScheme(_)), "{uri}");
            assert!(err.to_string().contains("tcp, udp, unix or udg scheme expected"));
        }
    }

    #[test]
    fn test_destination_key_normalization() {
        let a = DestinationKey::parse("tcp://Example.COM:80").unwrap();
        let b = DestinationKey::parse("example.com:80").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "tcp://example.com:80");

        let v6 = DestinationKey::parse("tcp://[::1]:443").unwrap();
        assert_eq!(v6.as_str(), "tcp://[::1]:443");

        let unix = DestinationKey::parse("unix:///var/run/app.sock").unwrap();
        assert_eq!(unix.as_str(), "unix:///var/run/app.sock");
        assert_eq!(unix.unix_path(), Some("/var/run/app.sock"));

        assert_ne!(
            DestinationKey::parse("tcp://example.com:80").unwrap(),
            DestinationKey::parse("tcp://example.com:81").unwrap()
        );
    }

    #[test]
    fn test_normalize_bind_to() {
        let cases = [
            ("127.0.0.1", "127.0.0.1:0"),
            ("127.0.0.1:0", "127.0.0.1:0"),
            ("123.123.123.123:1234", "123.123.123.123:1234"),
            ("[::1]", "[::1]:0"),
            ("[a:b::c]", "[a:b::c]:0"),
            ("[1:2::3]:4", "[1:2::3]:4"),
            (
                "[0000:abcd:0000:abcd:0000:abcd:0127:2258]:4567",
                "[0000:abcd:0000:abcd:0000:abcd:0127:2258]:4567",
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(
                normalize_bind_to(Some(input)).unwrap().as_deref(),
                Some(expected),
                "{input}"
            );
        }
        assert_eq!(normalize_bind_to(None).unwrap(), None);
    }

    #[test]
    fn test_normalize_bind_to_errors() {
        for input in [
            "-1.-1.-1.-1",
            "a.b.c.d",
            "123.123.123.123:-0",
            "123.123.123.123:-1234567",
            "[0000:abcd:0000:abcd:0000:abcd:0127:2258]:-67899",
            "[e:f:g:h]",
        ] {
            assert!(
                matches!(normalize_bind_to(Some(input)), Err(NetError::InvalidBindTo(_))),
                "{input}"
            );
        }

        for input in ["123.123.123.123:123456", "[0000:abcd:0000:abcd:0000:abcd:0127:2258]:67899"] {
            assert!(
                matches!(normalize_bind_to(Some(input)), Err(NetError::InvalidPort(_))),
                "{input}"
            );
        }

        for input in ["[::::]", "[:::1]"] {
            assert!(
                matches!(normalize_bind_to(Some(input)), Err(NetError::InvalidIpv6(_))),
                "{input}"
            );
        }

        for input in ["256.256.256.256", "1234.12.12.12"] {
            assert!(
                matches!(normalize_bind_to(Some(input)), Err(NetError::InvalidIpv4(_))),
                "{input}"
            );
        }
    }
}
