//! ACME (RFC 8555) client: account bootstrap, HTTP-01/DNS-01 challenge
//! solving, order finalization. Backed by `instant-acme`, the dependency
//! the teacher already carried for this purpose.

use std::time::{Duration, SystemTime};

use instant_acme::{
    Account, AuthorizationStatus, ChallengeType as InstantChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus, RetryPolicy,
};
use thiserror::Error;

use crate::challenge::ChallengeStore;
use crate::dns01::DnsProvider;

pub mod directory {
    pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
    pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
}

#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("ACME protocol error: {0}")]
    Protocol(String),

    #[error("challenge validation failed for {domain}: {reason}")]
    ChallengeFailed { domain: String, reason: String },

    #[error("order did not reach ready status: {0:?}")]
    OrderFailed(OrderStatus),

    #[error("account error: {0}")]
    Account(String),

    #[error("rate limited by ACME server: {0}")]
    RateLimited(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("no dns-01 provider configured for this domain")]
    NoDnsProvider,
}

impl AcmeError {
    /// Classifies a protocol error string per spec §7's error-kind table.
    pub fn classify(raw: &str) -> Self {
        let lowered = raw.to_ascii_lowercase();
        if lowered.contains("ratelimited") || lowered.contains("rate limit") {
            AcmeError::RateLimited(raw.to_string())
        } else if lowered.contains("unauthorized") {
            AcmeError::Unauthorized(raw.to_string())
        } else {
            AcmeError::Protocol(raw.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeType {
    Http01,
    Dns01,
    TlsAlpn01,
}

impl From<ChallengeType> for InstantChallengeType {
    fn from(value: ChallengeType) -> Self {
        match value {
            ChallengeType::Http01 => InstantChallengeType::Http01,
            ChallengeType::Dns01 => InstantChallengeType::Dns01,
            ChallengeType::TlsAlpn01 => InstantChallengeType::TlsAlpn01,
        }
    }
}

/// Certificate type, inferred from issuer common name (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateType {
    SelfSigned,
    Staging,
    Production,
    Unknown,
}

/// Classifies a certificate's issuer/subject common names per spec §4.3.
pub fn classify_issuer(issuer_cn: &str, subject_cn: &str) -> CertificateType {
    let issuer = issuer_cn.to_ascii_uppercase();
    if issuer_cn == subject_cn {
        return CertificateType::SelfSigned;
    }
    if issuer.contains("STAGING") || issuer.contains("FAKE LE") || issuer.contains("COUNTERFEIT")
        || issuer.contains("FALSE FENNEL")
    {
        return CertificateType::Staging;
    }
    if issuer.contains("LET'S ENCRYPT") || issuer.contains("LETS ENCRYPT") || issuer.contains("R3")
        || issuer.contains("E1")
    {
        return CertificateType::Production;
    }
    CertificateType::Unknown
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateStatus {
    Valid,
    Failed,
    Pending,
}

/// The Certificate record (spec §3).
#[derive(Debug, Clone)]
pub struct Certificate {
    pub domain: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub issued_at: SystemTime,
    pub expires_at: SystemTime,
    pub issuer: String,
    pub status: CertificateStatus,
    pub cert_type: CertificateType,
}

impl Certificate {
    pub fn needs_renewal(&self, renew_before: Duration) -> bool {
        match self.expires_at.duration_since(SystemTime::now()) {
            Ok(remaining) => remaining < renew_before,
            Err(_) => true, // already expired
        }
    }
}

/// ACME client bound to a single directory and account.
pub struct AcmeClient {
    account: Account,
    challenge_type: ChallengeType,
    dns_provider: Option<Box<dyn DnsProvider>>,
}

impl AcmeClient {
    pub async fn staging(email: &str, account_key_pem: Option<&str>) -> Result<Self, AcmeError> {
        Self::new(directory::LETS_ENCRYPT_STAGING, email, account_key_pem).await
    }

    pub async fn production(email: &str, account_key_pem: Option<&str>) -> Result<Self, AcmeError> {
        Self::new(directory::LETS_ENCRYPT_PRODUCTION, email, account_key_pem).await
    }

    async fn new(
        directory_url: &str,
        email: &str,
        account_key_pem: Option<&str>,
    ) -> Result<Self, AcmeError> {
        let account = if let Some(key_pem) = account_key_pem {
            Account::from_credentials_file(key_pem)
                .await
                .map_err(|e| AcmeError::Account(e.to_string()))?
        } else {
            let (account, _credentials) = Account::create(
                &NewAccount {
                    contact: &[&format!("mailto:{email}")],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                directory_url,
                None,
            )
            .await
            .map_err(|e| AcmeError::Account(e.to_string()))?;
            account
        };

        Ok(Self {
            account,
            challenge_type: ChallengeType::Http01,
            dns_provider: None,
        })
    }

    pub fn with_challenge_type(mut self, challenge_type: ChallengeType) -> Self {
        self.challenge_type = challenge_type;
        self
    }

    pub fn with_dns_provider(mut self, provider: Box<dyn DnsProvider>) -> Self {
        self.dns_provider = Some(provider);
        self
    }

    /// Runs the full obtain flow for a single domain against an already
    /// reachable challenge store (HTTP-01) or DNS provider (DNS-01).
    pub async fn obtain_certificate(
        &self,
        domain: &str,
        challenges: &ChallengeStore,
    ) -> Result<Certificate, AcmeError> {
        let identifier = Identifier::Dns(domain.to_string());
        let mut order = self
            .account
            .new_order(&NewOrder::new(&[identifier]))
            .await
            .map_err(|e| AcmeError::classify(&e.to_string()))?;

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| AcmeError::classify(&e.to_string()))?;

        for authz in &authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let wanted: InstantChallengeType = self.challenge_type.into();
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == wanted)
                .ok_or_else(|| AcmeError::ChallengeFailed {
                    domain: domain.to_string(),
                    reason: "server did not offer the requested challenge type".to_string(),
                })?;

            let key_authorization = order.key_authorization(challenge);

            match self.challenge_type {
                ChallengeType::Http01 => {
                    challenges
                        .deploy(&challenge.token, key_authorization.as_str())
                        .await;
                }
                ChallengeType::Dns01 => {
                    let provider = self.dns_provider.as_ref().ok_or(AcmeError::NoDnsProvider)?;
                    let record_value = key_authorization.dns_value();
                    provider
                        .create_txt_record(domain, &record_value)
                        .await
                        .map_err(|e| AcmeError::ChallengeFailed {
                            domain: domain.to_string(),
                            reason: e,
                        })?;
                }
                ChallengeType::TlsAlpn01 => {
                    return Err(AcmeError::ChallengeFailed {
                        domain: domain.to_string(),
                        reason: "tls-alpn-01 is not a provisioning path, only an ALPN identifier".into(),
                    });
                }
            }

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| AcmeError::classify(&e.to_string()))?;
        }

        let status = order
            .poll_ready(&RetryPolicy::default())
            .await
            .map_err(|e| AcmeError::classify(&e.to_string()))?;

        if self.challenge_type == ChallengeType::Http01 {
            for authz in &authorizations {
                let wanted: InstantChallengeType = self.challenge_type.into();
                if let Some(challenge) = authz.challenges.iter().find(|c| c.r#type == wanted) {
                    challenges.cleanup(&challenge.token).await;
                }
            }
        }

        if status != OrderStatus::Ready {
            return Err(AcmeError::OrderFailed(status));
        }

        let private_key_pem = order
            .finalize()
            .await
            .map_err(|e| AcmeError::classify(&e.to_string()))?;

        let cert_chain_pem = order
            .poll_certificate(&RetryPolicy::default())
            .await
            .map_err(|e| AcmeError::classify(&e.to_string()))?;

        let issuer_cn = parse_issuer_cn(&cert_chain_pem).unwrap_or_else(|| "unknown".to_string());

        Ok(Certificate {
            domain: domain.to_string(),
            cert_pem: cert_chain_pem,
            key_pem: private_key_pem,
            issued_at: SystemTime::now(),
            expires_at: SystemTime::now() + Duration::from_secs(90 * 24 * 3600),
            issuer: issuer_cn.clone(),
            status: CertificateStatus::Valid,
            cert_type: classify_issuer(&issuer_cn, domain),
        })
    }
}

fn parse_issuer_cn(cert_chain_pem: &str) -> Option<String> {
    let leaf_end = cert_chain_pem.find("-----END CERTIFICATE-----")?;
    let leaf_pem = &cert_chain_pem[..leaf_end + "-----END CERTIFICATE-----".len()];
    let (_, cert) = x509_parser::pem::parse_x509_pem(leaf_pem.as_bytes()).ok()?;
    let parsed = cert.parse_x509().ok()?;
    parsed
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert_with_expiry(remaining: i64) -> Certificate {
        Certificate {
            domain: "example.com".to_string(),
            cert_pem: String::new(),
            key_pem: String::new(),
            issued_at: SystemTime::now(),
            expires_at: if remaining >= 0 {
                SystemTime::now() + Duration::from_secs(remaining as u64)
            } else {
                SystemTime::now() - Duration::from_secs((-remaining) as u64)
            },
            issuer: "Let's Encrypt".to_string(),
            status: CertificateStatus::Valid,
            cert_type: CertificateType::Production,
        }
    }

    #[test]
    fn certificate_renewal_logic() {
        let renew_before = Duration::from_secs(30 * 24 * 3600);

        let expired = cert_with_expiry(-1);
        assert!(expired.needs_renewal(renew_before));

        let fresh = cert_with_expiry(80 * 24 * 3600);
        assert!(!fresh.needs_renewal(renew_before));

        let near_expiry = cert_with_expiry(10 * 24 * 3600);
        assert!(near_expiry.needs_renewal(renew_before));
    }

    #[test]
    fn classifies_staging_issuer() {
        assert_eq!(
            classify_issuer("(STAGING) Let's Encrypt Authority", "example.com"),
            CertificateType::Staging
        );
    }

    #[test]
    fn classifies_production_issuer() {
        assert_eq!(classify_issuer("R3", "example.com"), CertificateType::Production);
    }

    #[test]
    fn classifies_self_signed_when_issuer_equals_subject() {
        assert_eq!(
            classify_issuer("example.com", "example.com"),
            CertificateType::SelfSigned
        );
    }

    #[test]
    fn classifies_error_strings() {
        assert!(matches!(AcmeError::classify("too many certificates: ratelimited"), AcmeError::RateLimited(_)));
        assert!(matches!(AcmeError::classify("unauthorized: invalid response"), AcmeError::Unauthorized(_)));
    }
}
