//! Wires the Certificate Manager into Pingora's TLS listener as a
//! per-handshake SNI certificate callback, backed by OpenSSL (the teacher's
//! `features = ["proxy", "openssl"]` Pingora build).

use std::sync::Arc;

use openssl::pkey::PKey;
use openssl::ssl::SslRef;
use openssl::x509::X509;
use pingora_core::listeners::TlsAccept;

use crate::manager::CertificateManager;

/// Implements Pingora's handshake-time certificate callback by asking the
/// Certificate Manager for the right certificate per SNI server name.
pub struct SniCertResolver {
    manager: Arc<CertificateManager>,
}

impl SniCertResolver {
    pub fn new(manager: Arc<CertificateManager>) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl TlsAccept for SniCertResolver {
    async fn certificate_callback(&self, ssl: &mut SslRef) {
        let server_name = match ssl.servername(openssl::ssl::NameType::HOST_NAME) {
            Some(name) => name.to_string(),
            None => {
                tracing::warn!("TLS handshake with no SNI server name, dropping");
                return;
            }
        };

        let Some(cert) = self.manager.tls_certificate_for(&server_name).await else {
            tracing::warn!(server_name, "no certificate available for handshake");
            return;
        };

        match install(ssl, &cert.cert_pem, &cert.key_pem) {
            Ok(()) => {}
            Err(err) => {
                tracing::error!(server_name, error = %err, "failed to install certificate into TLS session");
            }
        }
    }
}

fn install(ssl: &mut SslRef, cert_pem: &str, key_pem: &str) -> Result<(), openssl::error::ErrorStack> {
    let cert = X509::from_pem(cert_pem.as_bytes())?;
    let key = PKey::private_key_from_pem(key_pem.as_bytes())?;
    ssl.set_certificate(&cert)?;
    ssl.set_private_key(&key)?;
    Ok(())
}
