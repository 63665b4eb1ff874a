//! Pingclair HTTP Proxy implementation using Pingora (spec §4.2).
//!
//! A single host handler: `request_filter` resolves `Host` against the Route
//! Table and handles the IP-literal / no-route / inactive-route terminal
//! cases itself; `upstream_peer` reconciles the live container IP and builds
//! the `HttpPeer`; `error_while_proxy` classifies "container down" failures
//! and enqueues a background `MarkInactive`.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_core::Result as PingoraResult;
use pingora_http::ResponseHeader;
use pingora_proxy::{ProxyHttp, Session};

use pingclair_core::domain::{normalize_domain, split_host_port};
use pingclair_core::route_table::{Route, RouteTable};
use pingclair_runtime::runtime::Runtime;

use crate::rate_limit::RateLimiter;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Upstream failure classes that mean "the container is gone", per spec
/// §4.1's state machine (`Active → Inactive`).
fn is_container_down(err: &pingora_core::Error) -> bool {
    let text = err.to_string();
    text.contains("ConnectionRefused")
        || text.contains("ConnectNoRoute")
        || text.contains("connection refused")
        || text.contains("no route to host")
        || text.contains("i/o timeout")
        || text.contains("ConnectTimedout")
}

pub struct RequestCtx {
    route: Option<Route>,
    client_ip: String,
    host: String,
    scheme: &'static str,
    start_time: Instant,
}

impl Default for RequestCtx {
    fn default() -> Self {
        Self {
            route: None,
            client_ip: String::new(),
            host: String::new(),
            scheme: "http",
            start_time: Instant::now(),
        }
    }
}

/// The edge reverse proxy. Generic over the runtime capability so tests can
/// drive it with `pingclair_runtime::runtime::MockRuntime`.
pub struct PingclairProxy<R: Runtime> {
    routes: Arc<RouteTable>,
    runtime: Arc<R>,
    container_network: String,
    rate_limiter: Arc<RateLimiter>,
    block_direct_ip: bool,
    blocked_ip_log_cooldown: Duration,
    recent_blocked_logs: Mutex<std::collections::HashMap<String, Instant>>,
}

impl<R: Runtime> PingclairProxy<R> {
    pub fn new(
        routes: Arc<RouteTable>,
        runtime: Arc<R>,
        container_network: String,
        rate_limiter: Arc<RateLimiter>,
        block_direct_ip: bool,
        blocked_ip_log_cooldown: Duration,
    ) -> Self {
        Self {
            routes,
            runtime,
            container_network,
            rate_limiter,
            block_direct_ip,
            blocked_ip_log_cooldown,
            recent_blocked_logs: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Rate-limits the 403 log line itself per client IP (spec §4.2: "logs
    /// for such 403s are rate-limited per client IP with a 1-minute
    /// cooldown"), not the response.
    fn should_log_blocked_ip(&self, client_ip: &str) -> bool {
        let mut guard = self.recent_blocked_logs.lock();
        let now = Instant::now();
        match guard.get(client_ip) {
            Some(last) if now.duration_since(*last) < self.blocked_ip_log_cooldown => false,
            _ => {
                guard.insert(client_ip.to_string(), now);
                true
            }
        }
    }

    async fn respond(session: &mut Session, status: u16, body: &str) -> PingoraResult<()> {
        let mut header = ResponseHeader::build(status, Some(2))?;
        header.insert_header("Content-Type", "text/plain")?;
        header.insert_header("Content-Length", body.len().to_string())?;
        session.write_response_header(Box::new(header), false).await?;
        session.write_response_body(Some(bytes::Bytes::copy_from_slice(body.as_bytes())), true).await?;
        Ok(())
    }

    async fn respond_rate_limited(session: &mut Session, info: &crate::rate_limit::RateLimitInfo) -> PingoraResult<()> {
        let body = "Too Many Requests";
        let mut header = ResponseHeader::build(429, Some(2 + info.to_headers().len()))?;
        header.insert_header("Content-Type", "text/plain")?;
        header.insert_header("Content-Length", body.len().to_string())?;
        for (name, value) in info.to_headers() {
            header.insert_header(name, value)?;
        }
        session.write_response_header(Box::new(header), false).await?;
        session.write_response_body(Some(bytes::Bytes::from_static(body.as_bytes())), true).await?;
        Ok(())
    }

    fn client_ip(session: &Session) -> String {
        session
            .client_addr()
            .map(|addr| match addr {
                pingora_core::protocols::l4::socket::SocketAddr::Inet(inet) => inet.ip().to_string(),
                pingora_core::protocols::l4::socket::SocketAddr::Unix(_) => "127.0.0.1".to_string(),
            })
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    fn is_tls(session: &Session) -> bool {
        session.digest().map(|d| d.ssl_digest.is_some()).unwrap_or(false)
    }
}

#[async_trait]
impl<R: Runtime + 'static> ProxyHttp for PingclairProxy<R> {
    type CTX = RequestCtx;

    fn new_ctx(&self) -> Self::CTX {
        RequestCtx::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> PingoraResult<bool> {
        let req_header = session.req_header();
        let path = req_header.uri.path().to_string();
        let host_header = req_header
            .headers
            .get("Host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let (host_only, _port) = split_host_port(&host_header);
        let host = normalize_domain(host_only);

        ctx.client_ip = Self::client_ip(session);
        ctx.scheme = if Self::is_tls(session) { "https" } else { "http" };
        ctx.host = host_header;

        if host.parse::<IpAddr>().is_ok() {
            let is_acme_challenge = path.starts_with(ACME_CHALLENGE_PREFIX);
            if self.block_direct_ip && !is_acme_challenge {
                if self.should_log_blocked_ip(&ctx.client_ip) {
                    tracing::warn!(client_ip = %ctx.client_ip, host, "blocked direct IP-literal access");
                }
                Self::respond(session, 403, "Forbidden").await?;
            } else {
                Self::respond(session, 404, "Not Found").await?;
            }
            return Ok(true);
        }

        if let Err(info) = self.rate_limiter.check(Some(&ctx.client_ip)) {
            Self::respond_rate_limited(session, &info).await?;
            return Ok(true);
        }

        let route = match self.routes.get(&host).await {
            Some(route) => route,
            None => {
                let available: Vec<String> = self.routes.snapshot().await.into_keys().collect();
                tracing::info!(host, available_domains = ?available, "no route for host");
                Self::respond(session, 404, "Domain not found").await?;
                return Ok(true);
            }
        };

        if !route.active {
            Self::respond(session, 503, "Service Unavailable").await?;
            return Ok(true);
        }

        ctx.route = Some(route);
        Ok(false)
    }

    async fn upstream_peer(&self, _session: &mut Session, ctx: &mut Self::CTX) -> PingoraResult<Box<HttpPeer>> {
        let mut route = ctx
            .route
            .clone()
            .ok_or_else(|| pingora_core::Error::new(pingora_core::ErrorType::ConnectNoRoute))?;

        if route.domain != self.routes.admin_domain() {
            if let Ok(info) = self.runtime.inspect(&route.container_id).await {
                if let Some(live_ip) = info.ip_on(&self.container_network) {
                    if live_ip != route.container_ip {
                        tracing::warn!(
                            domain = %route.domain,
                            cached_ip = %route.container_ip,
                            live_ip,
                            "route IP drifted from runtime, using live IP for this request"
                        );
                        let domain = route.domain.clone();
                        let new_ip = live_ip.to_string();
                        let routes = self.routes.clone();
                        tokio::spawn(async move {
                            if let Err(err) = routes.force_update_ip(&domain, &new_ip).await {
                                tracing::warn!(domain, error = %err, "background force_update_ip failed");
                            }
                        });
                        route.container_ip = live_ip.to_string();
                    }
                }
            }
        }

        let addr = Self::parse_upstream(&route.upstream_url())
            .ok_or_else(|| pingora_core::Error::new(pingora_core::ErrorType::ConnectNoRoute))?;
        ctx.route = Some(route);
        let peer = HttpPeer::new(addr, false, String::new());
        Ok(Box::new(peer))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut pingora_http::RequestHeader,
        ctx: &mut Self::CTX,
    ) -> PingoraResult<()> {
        upstream_request.insert_header("X-Forwarded-For", ctx.client_ip.as_str())?;
        upstream_request.insert_header("X-Real-IP", ctx.client_ip.as_str())?;
        upstream_request.insert_header("X-Forwarded-Proto", ctx.scheme)?;
        upstream_request.insert_header("X-Forwarded-Host", ctx.host.as_str())?;
        Ok(())
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> PingoraResult<()> {
        upstream_response.insert_header("Server", "Pingclair")?;

        let elapsed = ctx.start_time.elapsed();
        tracing::debug!(
            domain = ?ctx.route.as_ref().map(|r| &r.domain),
            elapsed_ms = elapsed.as_millis(),
            "request completed"
        );

        Ok(())
    }

    fn error_while_proxy(
        &self,
        peer: &HttpPeer,
        _session: &mut Session,
        e: Box<pingora_core::Error>,
        ctx: &mut Self::CTX,
        _client_reused: bool,
    ) -> Box<pingora_core::Error> {
        tracing::error!(peer = %peer, error = %e, "proxy error");

        if is_container_down(&e) {
            if let Some(route) = &ctx.route {
                let container_id = route.container_id.clone();
                let routes = self.routes.clone();
                tokio::spawn(async move {
                    let domains = routes.domains_for_container(&container_id).await;
                    if let Err(err) = routes.mark_inactive(&domains).await {
                        tracing::warn!(container_id, error = %err, "background mark_inactive failed");
                    }
                });
            }
        }

        e
    }
}

impl<R: Runtime> PingclairProxy<R> {
    /// Parses `http://{ip}:{port}` (possibly bracketed IPv6) back into
    /// `(host, port)` for `HttpPeer::new`.
    fn parse_upstream(url: &str) -> Option<(&str, u16)> {
        let rest = url.strip_prefix("http://")?;
        if let Some(inner) = rest.strip_prefix('[') {
            let (host, tail) = inner.split_once(']')?;
            let port = tail.strip_prefix(':')?.parse().ok()?;
            return Some((host, port));
        }
        let (host, port) = rest.rsplit_once(':')?;
        Some((host, port.parse().ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_upstream_url_with_plain_ipv4() {
        let (host, port) = PingclairProxy::<pingclair_runtime::runtime::MockRuntime>::parse_upstream(
            "http://10.89.0.5:8080",
        )
        .unwrap();
        assert_eq!(host, "10.89.0.5");
        assert_eq!(port, 8080);
    }

    #[test]
    fn parses_upstream_url_with_bracketed_ipv6() {
        let (host, port) =
            PingclairProxy::<pingclair_runtime::runtime::MockRuntime>::parse_upstream("http://[::1]:9000")
                .unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 9000);
    }

    #[test]
    fn rejects_non_http_scheme() {
        assert!(PingclairProxy::<pingclair_runtime::runtime::MockRuntime>::parse_upstream(
            "https://10.0.0.1:443"
        )
        .is_none());
    }
}
