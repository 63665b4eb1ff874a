//! Bridges the Certificate Manager's synchronous `HostPolicy` callback to
//! the Route Table's async API (spec §9's cyclic-dependency resolution).
//!
//! The manager's handshake path cannot await a `RwLock` read against the
//! Route Table without risking the 5-second `TLSCertificateFor` deadline
//! under contention, so instead of holding the table directly it consults a
//! periodically refreshed mirror of the domain set.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use pingclair_core::route_table::RouteTable;
use pingclair_tls::manager::HostPolicy;

const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Synchronous view over `RouteTable::snapshot()`'s domain keys.
pub struct RouteTableHostPolicy {
    domains: Arc<RwLock<HashSet<String>>>,
}

impl RouteTableHostPolicy {
    /// Spawns the background refresh loop and returns the policy handle.
    /// The loop runs for the process lifetime; there is no explicit stop
    /// signal since it only ever reads.
    pub fn spawn(routes: Arc<RouteTable>) -> Arc<Self> {
        let domains = Arc::new(RwLock::new(HashSet::new()));
        let policy = Self { domains: domains.clone() };

        tokio::spawn(async move {
            loop {
                let snapshot: HashSet<String> = routes.snapshot().await.into_keys().collect();
                *domains.write() = snapshot;
                tokio::time::sleep(REFRESH_INTERVAL).await;
            }
        });

        Arc::new(policy)
    }
}

impl HostPolicy for RouteTableHostPolicy {
    fn allow(&self, host: &str) -> bool {
        self.domains.read().contains(host)
    }
}
