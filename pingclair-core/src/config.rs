//! Process-wide configuration, populated from the environment.
//!
//! The surrounding CLI and a config-file loader are external collaborators;
//! this is the typed surface the rest of the workspace consumes.

use std::time::Duration;

/// Core configuration for a running pingclair process.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Reserved hostname for the platform's own control surface (the registry
    /// and, eventually, an admin surface). Protected from generic route
    /// mutation.
    pub admin_domain: String,
    /// Plaintext HTTP listener address (ACME HTTP-01 + redirect-to-HTTPS).
    pub http_addr: String,
    /// TLS listener address.
    pub https_addr: String,
    /// OCI Distribution v2 registry listener address (spec §6, a separate
    /// external interface from the TLS proxy listener).
    pub registry_addr: String,
    /// Directory holding blob/manifest storage for the registry.
    pub registry_dir: std::path::PathBuf,
    /// Path to the sqlite database file.
    pub database_path: String,
    /// Directory holding on-disk certificate material.
    pub cert_dir: std::path::PathBuf,
    /// `production` or `staging`.
    pub acme_mode: AcmeMode,
    /// Contact email used for the ACME account.
    pub acme_email: Option<String>,
    /// Renewal window: reissue when `expires_at - now < renew_before`.
    pub renew_before: Duration,
    /// Default container-network name the runtime reports IPs on.
    pub container_network: String,
    /// Recent-container cooldown (spec §3, default 10s).
    pub reactor_cooldown: Duration,
    /// Blocked-IP log dedup cooldown (spec §3, default 1 minute).
    pub blocked_ip_log_cooldown: Duration,
    /// Reject direct IP-literal Host access with 403 instead of silently 404.
    pub block_direct_ip: bool,
}

/// ACME issuance mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmeMode {
    Production,
    Staging,
}

impl CoreConfig {
    /// Builds configuration from environment variables, falling back to
    /// sane development defaults for anything unset.
    pub fn from_env() -> Self {
        let acme_mode = match std::env::var("PINGCLAIR_ACME_MODE").as_deref() {
            Ok("production") => AcmeMode::Production,
            _ => AcmeMode::Staging,
        };

        Self {
            admin_domain: std::env::var("PINGCLAIR_ADMIN_DOMAIN")
                .unwrap_or_else(|_| "admin.localhost".to_string()),
            http_addr: std::env::var("PINGCLAIR_HTTP_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:80".to_string()),
            https_addr: std::env::var("PINGCLAIR_HTTPS_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:443".to_string()),
            registry_addr: std::env::var("PINGCLAIR_REGISTRY_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:5000".to_string()),
            registry_dir: std::env::var("PINGCLAIR_REGISTRY_DIR")
                .map(std::path::PathBuf::from)
                .unwrap_or_else(|_| default_data_dir().join("registry")),
            database_path: std::env::var("PINGCLAIR_DATABASE_PATH")
                .unwrap_or_else(|_| "pingclair.db".to_string()),
            cert_dir: std::env::var("PINGCLAIR_CERT_DIR")
                .map(std::path::PathBuf::from)
                .unwrap_or_else(|_| default_cert_dir()),
            acme_mode,
            acme_email: std::env::var("PINGCLAIR_ACME_EMAIL").ok(),
            renew_before: Duration::from_secs(
                std::env::var("PINGCLAIR_RENEW_BEFORE_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30 * 24 * 3600),
            ),
            container_network: std::env::var("PINGCLAIR_CONTAINER_NETWORK")
                .unwrap_or_else(|_| "pingclair".to_string()),
            reactor_cooldown: Duration::from_secs(10),
            blocked_ip_log_cooldown: Duration::from_secs(60),
            block_direct_ip: std::env::var("PINGCLAIR_BLOCK_DIRECT_IP")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

fn default_cert_dir() -> std::path::PathBuf {
    default_data_dir().join("certs")
}

fn default_data_dir() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("pingclair")
}
