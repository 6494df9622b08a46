//! Socket name formatting.

use std::net::SocketAddr;

/// Cleans up a raw socket name as reported by the OS layer.
///
/// Returns `None` for names that carry no information (empty or a single
/// NUL, as reported for unnamed Unix sockets). IPv6 names of the form
/// `2001:db8::1:443` are rewritten as `[2001:db8::1]:443`.
pub fn cleanup_socket_name(raw: &str) -> Option<String> {
    if raw.is_empty() || raw == "\0" {
        return None;
    }

    if let (Some(first), Some(last)) = (raw.find(':'), raw.rfind(':')) {
        if first < last && !raw.starts_with('[') {
            let (host, port) = (&raw[..last], &raw[last + 1..]);
            return Some(format!("[{host}]:{port}"));
        }
    }

    Some(raw.to_string())
}

/// Formats an IP socket address through the same cleanup path as raw names.
pub fn format_socket_addr(addr: &SocketAddr) -> String {
    let raw = format!("{}:{}", addr.ip(), addr.port());
    cleanup_socket_name(&raw).unwrap_or(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbracketed_ipv6_is_bracketed() {
        assert_eq!(
            cleanup_socket_name("2001:db8::1:443").as_deref(),
            Some("[2001:db8::1]:443")
        );
        assert_eq!(cleanup_socket_name("::1:80").as_deref(), Some("[::1]:80"));
    }

    #[test]
    fn test_bracketed_and_ipv4_untouched() {
        assert_eq!(cleanup_socket_name("[::1]:80").as_deref(), Some("[::1]:80"));
        assert_eq!(
            cleanup_socket_name("127.0.0.1:8080").as_deref(),
            Some("127.0.0.1:8080")
        );
        assert_eq!(cleanup_socket_name("/tmp/sock").as_deref(), Some("/tmp/sock"));
    }

    #[test]
    fn test_empty_names() {
        assert_eq!(cleanup_socket_name(""), None);
        assert_eq!(cleanup_socket_name("\0"), None);
    }

    #[test]
    fn test_format_socket_addr() {
        let v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(format_socket_addr(&v6), "[2001:db8::1]:443");

        let v4: SocketAddr = "10.0.0.1:53".parse().unwrap();
        assert_eq!(format_socket_addr(&v4), "10.0.0.1:53");
    }
}
