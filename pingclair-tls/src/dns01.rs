//! DNS-01 challenge provider capability.
//!
//! The core sees DNS providers through this uniform trait (spec §1); a
//! concrete provider SDK is an external collaborator. Credentials are
//! sourced from the environment as `GORDON_DNS_CRED_{ref}_{KEY}` (spec
//! §4.3/§6).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

/// A DNS-01 provider: create/remove the TXT record ACME validates against.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn create_txt_record(&self, domain: &str, value: &str) -> Result<(), String>;
    async fn delete_txt_record(&self, domain: &str, value: &str) -> Result<(), String>;

    /// How long to wait for the record to propagate before telling ACME
    /// the challenge is ready.
    fn propagation_timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    /// Polling interval while waiting for propagation.
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(5)
    }
}

/// Reads every `GORDON_DNS_CRED_{ref}_{KEY}` environment variable for a
/// given provider reference into a flat credential map keyed by `KEY`.
pub fn credentials_for_ref(provider_ref: &str) -> HashMap<String, String> {
    let prefix = format!("GORDON_DNS_CRED_{}_", provider_ref.to_ascii_uppercase());
    std::env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(&prefix)
                .map(|stripped| (stripped.to_string(), value))
        })
        .collect()
}

/// Verifies that `domain` currently resolves to a routable address before
/// an HTTP-01 attempt is made (spec §4.3 Obtain step 3).
pub async fn resolves_to_routable_address(resolver: &hickory_resolver::Resolver, domain: &str) -> bool {
    match resolver.lookup_ip(domain).await {
        Ok(lookup) => lookup.iter().any(|ip| !ip.is_loopback() && !ip.is_unspecified()),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_env_credentials_for_provider_ref() {
        std::env::set_var("GORDON_DNS_CRED_CF_API_TOKEN", "secret");
        std::env::set_var("GORDON_DNS_CRED_CF_ZONE_ID", "zone123");

        let creds = credentials_for_ref("cf");
        assert_eq!(creds.get("API_TOKEN").map(String::as_str), Some("secret"));
        assert_eq!(creds.get("ZONE_ID").map(String::as_str), Some("zone123"));

        std::env::remove_var("GORDON_DNS_CRED_CF_API_TOKEN");
        std::env::remove_var("GORDON_DNS_CRED_CF_ZONE_ID");
    }
}
