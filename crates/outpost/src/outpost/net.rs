use std::{borrow::Cow, net::IpAddr};

use tokio::sync::watch;

/// Normalize a bind/listen address.
///
/// Configs use the shorthand `":PORT"` to mean "bind on all interfaces", which
/// `SocketAddr` parsing does not accept; it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Resolves once `flag` turns true. Returns `false` if the sender is gone first, which
/// disables the branch when used as `true = shutdown_requested(..)` inside `select!`.
pub async fn shutdown_requested(flag: &mut watch::Receiver<bool>) -> bool {
    flag.wait_for(|v| *v).await.is_ok()
}

/// Strips the port from a `Host` header value and lower-cases it.
pub fn host_without_port(host: &str) -> String {
    let host = host.trim();
    let bare = if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        rest.split(']').next().unwrap_or(rest)
    } else if host.matches(':').count() == 1 {
        host.split(':').next().unwrap_or(host)
    } else {
        host
    };
    bare.trim_end_matches('.').to_ascii_lowercase()
}

/// Maps a request host to the tunnel it addresses. `None` for the bare base domain or
/// an empty host; those never name a tunnel.
pub fn tunnel_id_from_host(host: &str, base_domain: &str) -> Option<String> {
    let id = host_without_port(host);
    if id.is_empty() || id == base_domain {
        return None;
    }
    Some(id)
}

/// Connection-scoped headers that a proxy must not forward, plus the length header which
/// is recomputed for the re-framed body.
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

/// Client address as seen by the relay: the first `x-forwarded-for` entry when present,
/// else the peer address, with IPv4-mapped and loopback v6 forms folded to IPv4.
pub fn client_ip(forwarded_for: Option<&str>, peer: Option<IpAddr>) -> String {
    let forwarded = forwarded_for
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let raw = match (forwarded, peer) {
        (Some(f), _) => f.to_string(),
        (None, Some(ip)) => ip.to_string(),
        (None, None) => return String::new(),
    };

    if raw == "::1" {
        return "127.0.0.1".to_string();
    }
    match raw.strip_prefix("::ffff:") {
        Some(v4) if v4.parse::<std::net::Ipv4Addr>().is_ok() => v4.to_string(),
        _ => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn tunnel_id_strips_port_and_case() {
        let base = "example.dev";
        assert_eq!(
            tunnel_id_from_host("ABCD.example.dev:8080", base).as_deref(),
            Some("abcd.example.dev")
        );
        assert_eq!(
            tunnel_id_from_host("app.customer.org", base).as_deref(),
            Some("app.customer.org")
        );
        assert_eq!(tunnel_id_from_host("example.dev:443", base), None);
        assert_eq!(tunnel_id_from_host("Example.Dev", base), None);
        assert_eq!(tunnel_id_from_host("", base), None);
        assert_eq!(host_without_port("[::1]:8080"), "::1");
    }

    #[test]
    fn hop_by_hop_headers() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(is_hop_by_hop("content-length"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("set-cookie"));
    }

    #[test]
    fn client_ip_prefers_forwarded_and_folds_v6() {
        let peer: IpAddr = "10.0.0.9".parse().unwrap();
        assert_eq!(
            client_ip(Some("203.0.113.7, 10.0.0.1"), Some(peer)),
            "203.0.113.7"
        );
        assert_eq!(client_ip(None, Some(peer)), "10.0.0.9");
        assert_eq!(client_ip(Some(" "), Some(peer)), "10.0.0.9");

        let mapped: IpAddr = "::ffff:192.0.2.1".parse().unwrap();
        assert_eq!(client_ip(None, Some(mapped)), "192.0.2.1");
        assert_eq!(client_ip(Some("::ffff:198.51.100.2"), None), "198.51.100.2");

        let loopback: IpAddr = "::1".parse().unwrap();
        assert_eq!(client_ip(None, Some(loopback)), "127.0.0.1");
        assert_eq!(client_ip(None, None), "");
    }
}
