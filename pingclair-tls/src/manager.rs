//! Certificate Manager (spec §4.3): owns the ACME user, issues and renews
//! per-domain certificates, and presents the `TLSCertificateFor` handshake
//! callback with a bounded deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pingclair_core::config::AcmeMode;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::RwLock;

use crate::acme::{AcmeClient, AcmeError, Certificate, CertificateStatus, CertificateType};
use crate::cert_store::CertStore;
use crate::challenge::ChallengeStore;

/// Resolves whether the Certificate Manager is allowed to act on a given
/// hostname. Breaks the cyclic dependency with the Route Table (spec §9):
/// the manager accepts a capability instead of holding a `RouteTable`
/// directly.
pub trait HostPolicy: Send + Sync {
    fn allow(&self, host: &str) -> bool;
}

/// Always-allow policy, useful for tests and for an admin-only deployment.
pub struct AllowAll;
impl HostPolicy for AllowAll {
    fn allow(&self, _host: &str) -> bool {
        true
    }
}

pub struct CertificateManager {
    store: Arc<CertStore>,
    challenges: Arc<ChallengeStore>,
    acme: Option<AcmeClient>,
    mode: AcmeMode,
    admin_domain: String,
    root_domain: Option<String>,
    renew_before: Duration,
    host_policy: Arc<dyn HostPolicy>,
    obtain_locks: RwLock<HashMap<String, Arc<AsyncMutex<()>>>>,
    rate_limited: RwLock<std::collections::HashSet<String>>,
}

impl CertificateManager {
    pub fn new(
        store: Arc<CertStore>,
        challenges: Arc<ChallengeStore>,
        acme: Option<AcmeClient>,
        mode: AcmeMode,
        admin_domain: &str,
        root_domain: Option<String>,
        renew_before: Duration,
        host_policy: Arc<dyn HostPolicy>,
    ) -> Self {
        Self {
            store,
            challenges,
            acme,
            mode,
            admin_domain: admin_domain.to_string(),
            root_domain,
            renew_before,
            host_policy,
            obtain_locks: RwLock::new(HashMap::new()),
            rate_limited: RwLock::new(std::collections::HashSet::new()),
        }
    }

    fn host_allowed(&self, host: &str) -> bool {
        host == self.admin_domain
            || self.root_domain.as_deref() == Some(host)
            || self.host_policy.allow(host)
    }

    fn wanted_type(&self) -> CertificateType {
        match self.mode {
            AcmeMode::Production => CertificateType::Production,
            AcmeMode::Staging => CertificateType::Staging,
        }
    }

    /// `TLSCertificateFor(serverName) → Certificate` (spec §4.3): the
    /// handshake callback, bounded to 5 seconds total (spec §5).
    pub async fn tls_certificate_for(&self, server_name: &str) -> Option<Certificate> {
        match tokio::time::timeout(Duration::from_secs(5), self.resolve_certificate(server_name)).await {
            Ok(cert) => cert,
            Err(_) => {
                tracing::warn!(server_name, "certificate lookup exceeded 5s deadline");
                None
            }
        }
    }

    async fn resolve_certificate(&self, server_name: &str) -> Option<Certificate> {
        if !self.host_allowed(server_name) {
            tracing::warn!(server_name, "rejecting TLS handshake for unknown host");
            return None;
        }

        if let Some(cert) = self.store.get_cached(server_name).await {
            if matches!(cert.status, CertificateStatus::Valid) {
                return Some(cert);
            }
        }

        if let Some(cert) = self.store.read_from_disk(server_name, self.wanted_type()).await {
            return Some(cert);
        }

        if let Ok(Some(cert)) = self.store.get_from_db(server_name).await {
            return Some(cert);
        }

        if server_name == self.admin_domain {
            return self.self_signed(server_name).await.ok();
        }

        None
    }

    /// `Obtain(domain)` (spec §4.3 Obtain flow).
    pub async fn obtain(&self, domain: &str) -> Result<Certificate, AcmeError> {
        if self.rate_limited.read().await.contains(domain) {
            return Err(AcmeError::RateLimited(format!("{domain} rate-limited earlier this run")));
        }

        if let Some(existing) = self.store.get_cached(domain).await {
            let matches_mode = existing.cert_type == self.wanted_type();
            if matches!(existing.status, CertificateStatus::Valid)
                && !existing.needs_renewal(self.renew_before)
                && matches_mode
            {
                return Ok(existing);
            }
            if !matches_mode && self.mode == AcmeMode::Production {
                // Stale staging cert found while running in production: invalid, replace.
                self.store.remove_type(domain, CertificateType::Staging).await.ok();
            }
        }

        let guard = self.lock_for(domain).await;
        let _held = guard.lock().await;

        let Some(acme) = &self.acme else {
            return Err(AcmeError::Account("no ACME client configured".to_string()));
        };

        let mut attempt: u32 = 0;
        const MAX_ATTEMPTS: u32 = 3;
        let mut delay = Duration::from_secs(10);

        loop {
            attempt += 1;
            let result = tokio::time::timeout(
                Duration::from_secs(60),
                acme.obtain_certificate(domain, &self.challenges),
            )
            .await;

            match result {
                Ok(Ok(cert)) => {
                    tracing::info!(domain, status = "valid", "certificate obtained");
                    self.store.store(&cert).await.map_err(|e| AcmeError::Protocol(e.to_string()))?;
                    return Ok(cert);
                }
                Ok(Err(AcmeError::RateLimited(reason))) => {
                    self.rate_limited.write().await.insert(domain.to_string());
                    tracing::error!(domain, status = "failed", reason, "ACME rate limited, no retries");
                    break;
                }
                Ok(Err(err)) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(domain, attempt, error = %err, "transient ACME failure, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Ok(Err(err)) => {
                    tracing::error!(domain, status = "failed", error = %err, "ACME obtain exhausted retries");
                    break;
                }
                Err(_) => {
                    tracing::warn!(domain, attempt, "ACME request exceeded 60s budget");
                    if attempt >= MAX_ATTEMPTS {
                        break;
                    }
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }

        let fallback = self.self_signed(domain).await.map_err(|e| AcmeError::Protocol(e.to_string()))?;
        Ok(fallback)
    }

    /// `Renew(domain)` — identical to Obtain; the stored record supplies
    /// the resolved resource for the client internally.
    pub async fn renew(&self, domain: &str) -> Result<Certificate, AcmeError> {
        self.obtain(domain).await
    }

    /// `EnsureAdmin()` — idempotent startup bootstrap for the admin domain.
    pub async fn ensure_admin(&self) -> Result<Certificate, AcmeError> {
        if let Some(cert) = self.store.get_cached(&self.admin_domain).await {
            if matches!(cert.status, CertificateStatus::Valid) && !cert.needs_renewal(self.renew_before) {
                return Ok(cert);
            }
        }
        if self.acme.is_some() {
            self.obtain(&self.admin_domain.clone()).await
        } else {
            self.self_signed(&self.admin_domain.clone())
                .await
                .map_err(|e| AcmeError::Protocol(e.to_string()))
        }
    }

    async fn lock_for(&self, domain: &str) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.obtain_locks.read().await.get(domain) {
            return lock.clone();
        }
        let mut guard = self.obtain_locks.write().await;
        guard
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Generates a 24-hour self-signed certificate and persists it with the
    /// `_self-signed` suffix (spec §4.3 step 8).
    async fn self_signed(&self, domain: &str) -> std::io::Result<Certificate> {
        let key_pair = KeyPair::generate().map_err(to_io_error)?;
        let mut params = CertificateParams::new(vec![domain.to_string()]).map_err(to_io_error)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain);
        params.distinguished_name = dn;
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::hours(24);

        let cert = params.self_signed(&key_pair).map_err(to_io_error)?;

        let record = Certificate {
            domain: domain.to_string(),
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            issued_at: std::time::SystemTime::now(),
            expires_at: std::time::SystemTime::now() + Duration::from_secs(24 * 3600),
            issuer: domain.to_string(),
            status: CertificateStatus::Valid,
            cert_type: CertificateType::SelfSigned,
        };

        self.store
            .store(&record)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        tracing::warn!(domain, "issued self-signed fallback certificate");
        Ok(record)
    }
}

fn to_io_error<E: std::fmt::Display>(e: E) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert_store::CertStore;
    use pingclair_core::persistence::SqlitePersistence;

    async fn manager() -> (tempfile::TempDir, CertificateManager) {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(SqlitePersistence::connect(":memory:").await.unwrap());
        let store = Arc::new(CertStore::init(dir.path().to_path_buf(), persistence).await.unwrap());
        let challenges = Arc::new(ChallengeStore::load(dir.path().join("tokens.json")).await.unwrap());
        let manager = CertificateManager::new(
            store,
            challenges,
            None,
            AcmeMode::Staging,
            "admin.localhost",
            None,
            Duration::from_secs(30 * 24 * 3600),
            Arc::new(AllowAll),
        );
        (dir, manager)
    }

    #[tokio::test]
    async fn ensure_admin_falls_back_to_self_signed_without_acme_client() {
        let (_dir, manager) = manager().await;
        let cert = manager.ensure_admin().await.unwrap();
        assert_eq!(cert.cert_type, CertificateType::SelfSigned);
    }

    #[tokio::test]
    async fn rejects_unknown_host_from_host_policy() {
        struct DenyAll;
        impl HostPolicy for DenyAll {
            fn allow(&self, _host: &str) -> bool {
                false
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(SqlitePersistence::connect(":memory:").await.unwrap());
        let store = Arc::new(CertStore::init(dir.path().to_path_buf(), persistence).await.unwrap());
        let challenges = Arc::new(ChallengeStore::load(dir.path().join("tokens.json")).await.unwrap());
        let manager = CertificateManager::new(
            store,
            challenges,
            None,
            AcmeMode::Staging,
            "admin.localhost",
            None,
            Duration::from_secs(30 * 24 * 3600),
            Arc::new(DenyAll),
        );

        assert!(manager.tls_certificate_for("unknown.example.com").await.is_none());
    }
}
