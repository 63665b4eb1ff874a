//! Pingclair - edge reverse proxy, ACME certificate manager, and OCI
//! registry for a single host.
//!
//! Wires the Event Bus between the Registry and the Container Event
//! Reactor, starts the TLS proxy, the plaintext ACME/redirect listener, and
//! the registry's own HTTP surface, and blocks in Pingora's service runtime
//! for the process lifetime.

mod host_policy;

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pingclair_core::config::{AcmeMode, CoreConfig};
use pingclair_core::domain::split_host_port;
use pingclair_core::event_bus::EventBus;
use pingclair_core::persistence::SqlitePersistence;
use pingclair_core::route_table::{Protocol, Route, RouteTable};
use pingclair_core::server::EdgeHttpServer;
use pingclair_registry::{run_registry_server, BlobStore, ManifestStore, Registry};
use pingclair_runtime::reactor::EventReactor;
use pingclair_runtime::runtime::MockRuntime;
use pingclair_tls::{AcmeClient, CertStore, CertificateManager, ChallengeStore, SniCertResolver};

use host_policy::RouteTableHostPolicy;

#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    pingclair_proxy::metrics::init();

    let config = CoreConfig::from_env();
    let tokio_rt = tokio::runtime::Runtime::new()?;
    let pingora_server = tokio_rt.block_on(bootstrap(config))?;

    // `tokio_rt` is not dropped here: it keeps driving the reactor, the edge
    // HTTP listener and the registry server on its own worker threads while
    // this thread blocks in Pingora's service runtime below.
    pingora_server.run_forever();
}

async fn bootstrap(config: CoreConfig) -> anyhow::Result<pingora_core::server::Server> {
    let persistence = Arc::new(SqlitePersistence::connect(&config.database_path).await?);
    let events = EventBus::new();

    let cert_store = Arc::new(CertStore::init(config.cert_dir.clone(), persistence.clone()).await?);
    let challenges = Arc::new(ChallengeStore::load(config.cert_dir.join("challenge_tokens.json")).await?);

    let acme_client = match &config.acme_email {
        Some(email) => {
            let client = match config.acme_mode {
                AcmeMode::Production => AcmeClient::production(email, None).await?,
                AcmeMode::Staging => AcmeClient::staging(email, None).await?,
            };
            Some(client)
        }
        None => {
            tracing::warn!("no PINGCLAIR_ACME_EMAIL set, running without a live ACME client (self-signed only)");
            None
        }
    };

    let routes = Arc::new(RouteTable::load(&config.admin_domain, persistence.clone()).await?);
    let host_policy = RouteTableHostPolicy::spawn(routes.clone());

    let manager = Arc::new(CertificateManager::new(
        cert_store,
        challenges.clone(),
        acme_client,
        config.acme_mode,
        &config.admin_domain,
        None,
        config.renew_before,
        host_policy,
    ));
    manager.ensure_admin().await?;

    let (registry_host, registry_port) = parse_addr(&config.registry_addr)?;
    routes
        .upsert_admin(Route {
            domain: config.admin_domain.clone(),
            container_id: "pingclair-self".to_string(),
            container_ip: registry_host,
            container_port: registry_port.to_string(),
            protocol: Protocol::Https,
            path: "/".to_string(),
            active: true,
        })
        .await?;

    let runtime = Arc::new(MockRuntime::new());
    let rate_limiter = pingclair_proxy::RateLimiter::new(pingclair_proxy::RateLimitConfig::default());

    let blocked_cidrs: Vec<String> = std::env::var("PINGCLAIR_BLOCKED_CIDRS")
        .ok()
        .map(|raw| raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
        .unwrap_or_default();
    let connection_filter = pingclair_proxy::PingclairConnectionFilter::new(&blocked_cidrs);

    let proxy = pingclair_proxy::PingclairProxy::new(
        routes.clone(),
        runtime.clone(),
        config.container_network.clone(),
        rate_limiter,
        config.block_direct_ip,
        config.blocked_ip_log_cooldown,
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let reactor = Arc::new(EventReactor::new(
        runtime,
        routes.clone(),
        events.clone(),
        config.container_network.clone(),
        None,
        config.reactor_cooldown,
    ));
    tokio::spawn({
        let reactor = reactor.clone();
        async move { reactor.run().await }
    });

    let edge_http = Arc::new(EdgeHttpServer::new(challenges));
    tokio::spawn({
        let edge_http = edge_http.clone();
        let addr = config.http_addr.clone();
        let shutdown = shutdown_tx.subscribe();
        async move {
            if let Err(err) = edge_http.run(&addr, shutdown).await {
                tracing::error!(error = %err, "edge http listener exited with error");
            }
        }
    });

    let blobs = BlobStore::init(config.registry_dir.join("blobs")).await?;
    let manifests = ManifestStore::init(config.registry_dir.join("repositories")).await?;
    let registry = Arc::new(Registry::new(blobs, manifests, events));
    let registry_addr: std::net::SocketAddr = config.registry_addr.parse()?;
    tokio::spawn(async move {
        if let Err(err) = run_registry_server(registry_addr, registry).await {
            tracing::error!(error = %err, "registry server exited with error");
        }
    });

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, draining with a bounded deadline");
        let _ = shutdown_tx.send(());
        tokio::time::sleep(SHUTDOWN_DEADLINE).await;
        std::process::exit(0);
    });

    let mut pingora_server = pingora_core::server::Server::new(None)?;
    pingora_server.bootstrap();

    let sni_resolver = SniCertResolver::new(manager);
    let mut tls_settings = pingora_core::listeners::tls::TlsSettings::with_callbacks(Box::new(sni_resolver))
        .map_err(|e| anyhow::anyhow!("failed to build TLS settings: {e}"))?;
    tls_settings.enable_h2();

    let mut proxy_service = pingora_proxy::http_proxy_service(&pingora_server.configuration, proxy);
    let mut sock_opts = pingora_core::listeners::TcpSocketOptions::default();
    sock_opts.connection_filter = Some(Arc::new(connection_filter));
    proxy_service.add_tls_with_settings(&config.https_addr, Some(sock_opts), tls_settings);
    pingora_server.add_service(proxy_service);

    tracing::info!(https_addr = %config.https_addr, http_addr = %config.http_addr, registry_addr = %config.registry_addr, "pingclair bootstrapped");

    Ok(pingora_server)
}

fn parse_addr(addr: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = split_host_port(addr);
    let port: u16 = port
        .ok_or_else(|| anyhow::anyhow!("address {addr:?} is missing a port"))?
        .parse()?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_registry_addr() {
        let (host, port) = parse_addr("127.0.0.1:5000").unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 5000);
    }

    #[test]
    fn rejects_addr_without_port() {
        assert!(parse_addr("127.0.0.1").is_err());
    }
}
