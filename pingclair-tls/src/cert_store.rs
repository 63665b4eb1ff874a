//! Certificate storage: the on-disk type-suffixed convention plus the
//! `certificates` DB table, kept in sync with an in-memory read cache for
//! handshake-hot-path lookups.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::acme::{Certificate, CertificateStatus, CertificateType};
use pingclair_core::persistence::{PersistenceError, SqlitePersistence};

#[derive(Debug, Error)]
pub enum CertStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no certificate stored for {0}")]
    NotFound(String),

    #[error("invalid certificate record: {0}")]
    Invalid(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

type Result<T> = std::result::Result<T, CertStoreError>;

const KEY_SUFFIX: &str = "+rsa";

fn type_suffix(cert_type: CertificateType) -> &'static str {
    match cert_type {
        CertificateType::SelfSigned => "_self-signed",
        CertificateType::Staging => "_letsencrypt-staging",
        CertificateType::Production => "_letsencrypt-production",
        CertificateType::Unknown => "_unknown",
    }
}

fn cert_type_label(cert_type: CertificateType) -> &'static str {
    match cert_type {
        CertificateType::SelfSigned => "self-signed",
        CertificateType::Staging => "staging",
        CertificateType::Production => "production",
        CertificateType::Unknown => "unknown",
    }
}

fn parse_cert_type_label(raw: &str) -> CertificateType {
    match raw {
        "self-signed" => CertificateType::SelfSigned,
        "staging" => CertificateType::Staging,
        "production" => CertificateType::Production,
        _ => CertificateType::Unknown,
    }
}

/// On-disk + DB certificate store. The Certificate Manager exclusively owns
/// this (spec §3 ownership rule, §9 "global mutable state ... redesigned
/// into owned fields on the owning component").
pub struct CertStore {
    dir: PathBuf,
    persistence: Arc<SqlitePersistence>,
    cache: RwLock<HashMap<String, Certificate>>,
}

impl CertStore {
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("pingclair")
            .join("certs")
    }

    pub async fn init(dir: PathBuf, persistence: Arc<SqlitePersistence>) -> Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let store = Self {
            dir,
            persistence,
            cache: RwLock::new(HashMap::new()),
        };
        store.load_all_from_db().await?;
        Ok(store)
    }

    async fn load_all_from_db(&self) -> Result<()> {
        let rows = self
            .persistence
            .with_retry(|pool| async move {
                sqlx::query(
                    "SELECT domain, cert_pem, key_pem, issued_at, expires_at, issuer, status, cert_type FROM certificates",
                )
                .fetch_all(&pool)
                .await
            })
            .await?;

        let mut cache = self.cache.write().await;
        for row in rows {
            let cert = row_to_certificate(&row)?;
            cache.insert(cert.domain.clone(), cert);
        }
        Ok(())
    }

    fn cert_path(&self, domain: &str, cert_type: CertificateType) -> PathBuf {
        self.dir.join(format!("{domain}{}", type_suffix(cert_type)))
    }

    fn key_path(&self, domain: &str, cert_type: CertificateType) -> PathBuf {
        self.dir
            .join(format!("{domain}{}{}", type_suffix(cert_type), KEY_SUFFIX))
    }

    /// In-memory fast path (spec §4.3 lookup order step 1).
    pub async fn get_cached(&self, domain: &str) -> Option<Certificate> {
        self.cache.read().await.get(domain).cloned()
    }

    /// Removes any on-disk certificate of `cert_type` for `domain` (used
    /// when the mode policy invalidates a stale staging cert found while in
    /// production).
    pub async fn remove_type(&self, domain: &str, cert_type: CertificateType) -> Result<()> {
        let cert_path = self.cert_path(domain, cert_type);
        let key_path = self.key_path(domain, cert_type);
        let _ = tokio::fs::remove_file(&cert_path).await;
        let _ = tokio::fs::remove_file(&key_path).await;
        Ok(())
    }

    /// Persists to DB then to disk under the type-suffixed convention
    /// (spec §4.3 "File naming convention on disk").
    pub async fn store(&self, cert: &Certificate) -> Result<()> {
        self.store_db(cert).await?;

        let tmp_cert = self.cert_path(&cert.domain, cert.cert_type).with_extension("tmp");
        tokio::fs::write(&tmp_cert, &cert.cert_pem).await?;
        tokio::fs::rename(&tmp_cert, self.cert_path(&cert.domain, cert.cert_type)).await?;

        let tmp_key = self.key_path(&cert.domain, cert.cert_type).with_extension("tmp");
        tokio::fs::write(&tmp_key, &cert.key_pem).await?;
        tokio::fs::rename(&tmp_key, self.key_path(&cert.domain, cert.cert_type)).await?;

        self.cache.write().await.insert(cert.domain.clone(), cert.clone());
        Ok(())
    }

    async fn store_db(&self, cert: &Certificate) -> Result<()> {
        let issued_at = system_time_to_rfc3339(cert.issued_at);
        let expires_at = system_time_to_rfc3339(cert.expires_at);
        let status = match cert.status {
            CertificateStatus::Valid => "valid",
            CertificateStatus::Failed => "failed",
            CertificateStatus::Pending => "pending",
        };
        let cert_type = cert_type_label(cert.cert_type);

        let domain = cert.domain.clone();
        let cert_pem = cert.cert_pem.clone();
        let key_pem = cert.key_pem.clone();
        let issuer = cert.issuer.clone();

        self.persistence
            .with_retry(move |pool| {
                let domain = domain.clone();
                let cert_pem = cert_pem.clone();
                let key_pem = key_pem.clone();
                let issued_at = issued_at.clone();
                let expires_at = expires_at.clone();
                let issuer = issuer.clone();
                async move {
                    sqlx::query(
                        "INSERT INTO certificates (domain, cert_pem, key_pem, issued_at, expires_at, issuer, status, cert_type)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                         ON CONFLICT(domain) DO UPDATE SET
                            cert_pem = excluded.cert_pem,
                            key_pem = excluded.key_pem,
                            issued_at = excluded.issued_at,
                            expires_at = excluded.expires_at,
                            issuer = excluded.issuer,
                            status = excluded.status,
                            cert_type = excluded.cert_type",
                    )
                    .bind(&domain)
                    .bind(&cert_pem)
                    .bind(&key_pem)
                    .bind(&issued_at)
                    .bind(&expires_at)
                    .bind(&issuer)
                    .bind(status)
                    .bind(cert_type)
                    .execute(&pool)
                    .await
                }
            })
            .await?;

        Ok(())
    }

    /// DB record lookup (spec §4.3 lookup order step 3), also refreshing
    /// the in-memory cache on hit.
    pub async fn get_from_db(&self, domain: &str) -> Result<Option<Certificate>> {
        let domain_owned = domain.to_string();
        let row = self
            .persistence
            .with_retry(move |pool| {
                let domain = domain_owned.clone();
                async move {
                    sqlx::query(
                        "SELECT domain, cert_pem, key_pem, issued_at, expires_at, issuer, status, cert_type FROM certificates WHERE domain = ?1",
                    )
                    .bind(&domain)
                    .fetch_optional(&pool)
                    .await
                }
            })
            .await?;

        match row {
            Some(row) => {
                let cert = row_to_certificate(&row)?;
                self.cache.write().await.insert(cert.domain.clone(), cert.clone());
                Ok(Some(cert))
            }
            None => Ok(None),
        }
    }

    /// Reads a certificate straight off disk without touching the DB or the
    /// in-memory cache, trying `preferred` first and falling back to the
    /// other two types (spec §4.3 lookup order step 2). Used when the
    /// in-memory cache misses, e.g. right after a restart.
    pub async fn read_from_disk(&self, domain: &str, preferred: CertificateType) -> Option<Certificate> {
        let order = match preferred {
            CertificateType::Production => [
                CertificateType::Production,
                CertificateType::Staging,
                CertificateType::SelfSigned,
            ],
            CertificateType::Staging => [
                CertificateType::Staging,
                CertificateType::Production,
                CertificateType::SelfSigned,
            ],
            _ => [CertificateType::SelfSigned, CertificateType::Production, CertificateType::Staging],
        };

        for cert_type in order {
            let cert_path = self.cert_path(domain, cert_type);
            let key_path = self.key_path(domain, cert_type);
            if let (Ok(cert_pem), Ok(key_pem)) = (
                tokio::fs::read_to_string(&cert_path).await,
                tokio::fs::read_to_string(&key_path).await,
            ) {
                let (issued_at, expires_at, issuer) =
                    parse_cert_times(&cert_pem).unwrap_or((SystemTime::now(), SystemTime::now(), "unknown".to_string()));
                return Some(Certificate {
                    domain: domain.to_string(),
                    cert_pem,
                    key_pem,
                    issued_at,
                    expires_at,
                    issuer,
                    status: CertificateStatus::Valid,
                    cert_type,
                });
            }
        }
        None
    }

    /// All cached certificates whose renewal window has been entered.
    pub async fn get_needing_renewal(&self, renew_before: Duration) -> Vec<Certificate> {
        self.cache
            .read()
            .await
            .values()
            .filter(|c| c.needs_renewal(renew_before))
            .cloned()
            .collect()
    }

    pub async fn remove(&self, domain: &str) -> Result<()> {
        self.persistence
            .with_retry({
                let domain = domain.to_string();
                move |pool| {
                    let domain = domain.clone();
                    async move {
                        sqlx::query("DELETE FROM certificates WHERE domain = ?1")
                            .bind(&domain)
                            .execute(&pool)
                            .await
                    }
                }
            })
            .await?;
        self.cache.write().await.remove(domain);
        Ok(())
    }
}

fn system_time_to_rfc3339(t: SystemTime) -> String {
    let unix = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    let odt = time::OffsetDateTime::UNIX_EPOCH + unix;
    odt.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

fn rfc3339_to_system_time(raw: &str) -> Result<SystemTime> {
    let odt = time::OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
        .map_err(|_| CertStoreError::Invalid(format!("bad timestamp: {raw}")))?;
    Ok(SystemTime::UNIX_EPOCH + Duration::from_secs(odt.unix_timestamp().max(0) as u64))
}

fn parse_cert_times(cert_pem: &str) -> Option<(SystemTime, SystemTime, String)> {
    let end_marker = "-----END CERTIFICATE-----";
    let leaf_end = cert_pem.find(end_marker)?;
    let leaf_pem = &cert_pem[..leaf_end + end_marker.len()];
    let (_, pem) = x509_parser::pem::parse_x509_pem(leaf_pem.as_bytes()).ok()?;
    let cert = pem.parse_x509().ok()?;
    let not_before = cert.validity().not_before.to_datetime().unix_timestamp();
    let not_after = cert.validity().not_after.to_datetime().unix_timestamp();
    let issuer = cert
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("unknown")
        .to_string();
    Some((
        UNIX_EPOCH + Duration::from_secs(not_before.max(0) as u64),
        UNIX_EPOCH + Duration::from_secs(not_after.max(0) as u64),
        issuer,
    ))
}

fn row_to_certificate(row: &sqlx::sqlite::SqliteRow) -> Result<Certificate> {
    let domain: String = row.try_get("domain").map_err(|e| CertStoreError::Invalid(e.to_string()))?;
    let cert_pem: String = row.try_get("cert_pem").map_err(|e| CertStoreError::Invalid(e.to_string()))?;
    let key_pem: String = row.try_get("key_pem").map_err(|e| CertStoreError::Invalid(e.to_string()))?;
    let issued_at: String = row.try_get("issued_at").map_err(|e| CertStoreError::Invalid(e.to_string()))?;
    let expires_at: String = row.try_get("expires_at").map_err(|e| CertStoreError::Invalid(e.to_string()))?;
    let issuer: String = row.try_get("issuer").map_err(|e| CertStoreError::Invalid(e.to_string()))?;
    let status: String = row.try_get("status").map_err(|e| CertStoreError::Invalid(e.to_string()))?;
    let cert_type: String = row.try_get("cert_type").map_err(|e| CertStoreError::Invalid(e.to_string()))?;

    Ok(Certificate {
        domain,
        cert_pem,
        key_pem,
        issued_at: rfc3339_to_system_time(&issued_at)?,
        expires_at: rfc3339_to_system_time(&expires_at)?,
        issuer,
        status: match status.as_str() {
            "valid" => CertificateStatus::Valid,
            "failed" => CertificateStatus::Failed,
            _ => CertificateStatus::Pending,
        },
        cert_type: parse_cert_type_label(&cert_type),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, CertStore) {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(SqlitePersistence::connect(":memory:").await.unwrap());
        let store = CertStore::init(dir.path().to_path_buf(), persistence).await.unwrap();
        (dir, store)
    }

    fn cert(domain: &str) -> Certificate {
        Certificate {
            domain: domain.to_string(),
            cert_pem: "CERT".to_string(),
            key_pem: "KEY".to_string(),
            issued_at: SystemTime::now(),
            expires_at: SystemTime::now() + Duration::from_secs(90 * 24 * 3600),
            issuer: "Let's Encrypt".to_string(),
            status: CertificateStatus::Valid,
            cert_type: CertificateType::Production,
        }
    }

    #[tokio::test]
    async fn store_then_get_cached_round_trips() {
        let (_dir, store) = store().await;
        store.store(&cert("app.example.com")).await.unwrap();
        let got = store.get_cached("app.example.com").await.unwrap();
        assert_eq!(got.cert_pem, "CERT");
    }

    #[tokio::test]
    async fn store_then_get_from_db_round_trips() {
        let (_dir, store) = store().await;
        store.store(&cert("app.example.com")).await.unwrap();
        let got = store.get_from_db("app.example.com").await.unwrap().unwrap();
        assert_eq!(got.key_pem, "KEY");
    }

    #[tokio::test]
    async fn writes_type_suffixed_files_on_disk() {
        let (dir, store) = store().await;
        store.store(&cert("app.example.com")).await.unwrap();
        assert!(dir.path().join("app.example.com_letsencrypt-production").exists());
        assert!(dir.path().join("app.example.com_letsencrypt-production+rsa").exists());
    }
}
