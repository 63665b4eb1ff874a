//! Domain normalization shared by the route table, the proxy, and the TLS
//! certificate callback.

/// Lowercases and trims a single trailing dot. Does not strip a port suffix;
/// callers that receive a `Host` header strip the port themselves before
/// calling this.
pub fn normalize_domain(raw: &str) -> String {
    let trimmed = raw.strip_suffix('.').unwrap_or(raw);
    trimmed.to_ascii_lowercase()
}

/// Splits a `Host` header value into `(host, port)`, stripping a bracketed
/// IPv6 literal's brackets. `port` is `None` when absent.
pub fn split_host_port(host_header: &str) -> (&str, Option<&str>) {
    if let Some(rest) = host_header.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = &rest[..end];
            let remainder = &rest[end + 1..];
            let port = remainder.strip_prefix(':');
            return (host, port);
        }
    }
    match host_header.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => (h, Some(p)),
        _ => (host_header, None),
    }
}

/// Normalizes a raw `Host` header into a bare, comparable domain.
pub fn normalize_host_header(host_header: &str) -> String {
    let (host, _port) = split_host_port(host_header);
    normalize_domain(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_trailing_dot() {
        assert_eq!(normalize_domain("EXAMPLE.com."), "example.com");
        assert_eq!(normalize_domain("example.com"), "example.com");
    }

    #[test]
    fn strips_port_from_host_header() {
        assert_eq!(normalize_host_header("example.com:443"), "example.com");
        assert_eq!(normalize_host_header("EXAMPLE.com."), "example.com");
    }

    #[test]
    fn handles_bracketed_ipv6_literal() {
        let (host, port) = split_host_port("[::1]:8080");
        assert_eq!(host, "::1");
        assert_eq!(port, Some("8080"));
    }

    #[test]
    fn three_forms_match_same_route() {
        let a = normalize_host_header("example.com:443");
        let b = normalize_host_header("EXAMPLE.com.");
        let c = normalize_host_header("example.com");
        assert_eq!(a, b);
        assert_eq!(b, c);
    }
}
