//! Plaintext HTTP edge listener (spec §6).
//!
//! Exposes `GET /.well-known/acme-challenge/{token}` for the ACME HTTP-01
//! responder and redirects everything else to `https://{host}{uri}`. Parses
//! the request line and headers by hand in the style of a minimal edge
//! listener rather than pulling in a full HTTP server for what is, on this
//! port, two possible responses.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Looks up the key authorization for an ACME HTTP-01 token. Implemented by
/// the certificate manager's challenge handler; kept as a trait here so this
/// crate does not depend on `pingclair-tls`.
#[async_trait]
pub trait HttpChallengeLookup: Send + Sync {
    async fn lookup(&self, token: &str) -> Option<String>;
}

/// The plaintext :80 listener.
pub struct EdgeHttpServer {
    challenges: Arc<dyn HttpChallengeLookup>,
}

impl EdgeHttpServer {
    pub fn new(challenges: Arc<dyn HttpChallengeLookup>) -> Self {
        Self { challenges }
    }

    /// Binds `addr` and serves connections until `shutdown` fires.
    pub async fn run(
        &self,
        addr: &str,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr, "edge http listener bound");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let challenges = self.challenges.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, challenges).await {
                            tracing::debug!(%peer, error = %err, "edge http connection ended with error");
                        }
                    });
                }
                _ = shutdown.recv() => {
                    tracing::info!("edge http listener shutting down");
                    return Ok(());
                }
            }
        }
    }
}

struct ParsedRequest {
    method: String,
    path: String,
    host: Option<String>,
}

async fn handle_connection(
    mut stream: TcpStream,
    challenges: Arc<dyn HttpChallengeLookup>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }
    buf.truncate(n);

    let request = match parse_request(&buf) {
        Some(req) => req,
        None => {
            write_response(&mut stream, 400, "Bad Request", "text/plain", b"Bad Request").await?;
            return Ok(());
        }
    };

    if request.method == "GET" {
        if let Some(token) = request.path.strip_prefix("/.well-known/acme-challenge/") {
            match challenges.lookup(token).await {
                Some(key_auth) => {
                    write_response(&mut stream, 200, "OK", "text/plain", key_auth.as_bytes()).await?;
                    return Ok(());
                }
                None => {
                    write_response(&mut stream, 404, "Not Found", "text/plain", b"Not Found").await?;
                    return Ok(());
                }
            }
        }
    }

    let host = request.host.as_deref().unwrap_or("");
    let location = format!("https://{host}{}", request.path);
    write_redirect(&mut stream, &location).await
}

fn parse_request(buf: &[u8]) -> Option<ParsedRequest> {
    let text = std::str::from_utf8(buf).ok()?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut host = None;
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("host") {
                host = Some(value.trim().to_string());
            }
        }
    }

    Some(ParsedRequest { method, path, host })
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

async fn write_redirect(stream: &mut TcpStream, location: &str) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 301 Moved Permanently\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_request_line_and_host_header() {
        let raw = b"GET /.well-known/acme-challenge/abc123 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let parsed = parse_request(raw).unwrap();
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.path, "/.well-known/acme-challenge/abc123");
        assert_eq!(parsed.host.as_deref(), Some("example.com"));
    }

    #[test]
    fn rejects_unparseable_request() {
        assert!(parse_request(b"\x00\x01\x02").is_none());
    }

    struct AlwaysNone;

    #[async_trait]
    impl HttpChallengeLookup for AlwaysNone {
        async fn lookup(&self, _token: &str) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn challenge_miss_returns_404() {
        let challenges: Arc<dyn HttpChallengeLookup> = Arc::new(AlwaysNone);
        assert!(challenges.lookup("missing").await.is_none());
    }
}
