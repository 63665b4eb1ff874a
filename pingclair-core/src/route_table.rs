//! Route Table: host-based routing synchronized with persistent storage and
//! with live container events (spec §3, §4.1).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::domain::normalize_domain;
use crate::persistence::{now_rfc3339, PersistenceError, SqlitePersistence};

#[derive(Error, Debug)]
pub enum RouteTableError {
    #[error("the admin domain cannot be mutated through this path")]
    AdminProtected,

    #[error("no route for domain {0:?}")]
    NotFound(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub type Result<T> = std::result::Result<T, RouteTableError>;

/// External protocol a route is served under. Stored for policy only: the
/// proxy always dials the upstream over plaintext HTTP regardless of this
/// value (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "https" => Protocol::Https,
            _ => Protocol::Http,
        }
    }
}

/// Binding of a public domain to an upstream container IP/port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub domain: String,
    pub container_id: String,
    pub container_ip: String,
    pub container_port: String,
    pub protocol: Protocol,
    pub path: String,
    pub active: bool,
}

impl Route {
    /// Renders the upstream dial target. Internal connections are always
    /// plaintext HTTP (spec §3).
    pub fn upstream_url(&self) -> String {
        if self.container_ip.contains(':') && !self.container_ip.starts_with('[') {
            format!("http://[{}]:{}", self.container_ip, self.container_port)
        } else {
            format!("http://{}:{}", self.container_ip, self.container_port)
        }
    }
}

/// Host-based route table. Exclusively owns its in-memory map and mediates
/// all persistent updates (spec §3 ownership rule).
pub struct RouteTable {
    admin_domain: String,
    routes: RwLock<HashMap<String, Route>>,
    persistence: Arc<SqlitePersistence>,
}

impl RouteTable {
    /// Loads the current table from storage. Does not create the admin
    /// route; callers call `upsert_admin` once at startup per spec §4.3
    /// `EnsureAdmin`-style idempotent bootstrap.
    pub async fn load(admin_domain: &str, persistence: Arc<SqlitePersistence>) -> Result<Self> {
        let rows = persistence
            .with_retry(|pool| async move {
                sqlx::query(
                    "SELECT domain, container_id, container_ip, container_port, protocol, path, active FROM routes",
                )
                .fetch_all(&pool)
                .await
            })
            .await?;

        let mut routes = HashMap::new();
        for row in rows {
            let domain: String = row.try_get("domain").map_err(PersistenceError::from)?;
            let route = Route {
                domain: domain.clone(),
                container_id: row.try_get("container_id").map_err(PersistenceError::from)?,
                container_ip: row.try_get("container_ip").map_err(PersistenceError::from)?,
                container_port: row.try_get("container_port").map_err(PersistenceError::from)?,
                protocol: Protocol::parse(&row.try_get::<String, _>("protocol").map_err(PersistenceError::from)?),
                path: row.try_get("path").map_err(PersistenceError::from)?,
                active: row.try_get::<i64, _>("active").map_err(PersistenceError::from)? != 0,
            };
            routes.insert(domain, route);
        }

        Ok(Self {
            admin_domain: normalize_domain(admin_domain),
            routes: RwLock::new(routes),
            persistence,
        })
    }

    pub fn admin_domain(&self) -> &str {
        &self.admin_domain
    }

    /// `Get(domain) → Route?`, case-insensitive and trailing-dot normalized.
    pub async fn get(&self, domain: &str) -> Option<Route> {
        let key = normalize_domain(domain);
        self.routes.read().await.get(&key).cloned()
    }

    /// `Upsert(route)`: persists then updates memory; on conflict by domain,
    /// updates identity/IP/port/protocol and sets `active=true`.
    pub async fn upsert(&self, mut route: Route) -> Result<()> {
        route.domain = normalize_domain(&route.domain);
        if route.domain == self.admin_domain {
            return Err(RouteTableError::AdminProtected);
        }
        self.upsert_unchecked(route).await
    }

    /// The only sanctioned mutator for the admin domain.
    pub async fn upsert_admin(&self, mut route: Route) -> Result<()> {
        route.domain = normalize_domain(&route.domain);
        if route.domain != self.admin_domain {
            return Err(RouteTableError::AdminProtected);
        }
        self.upsert_unchecked(route).await
    }

    async fn upsert_unchecked(&self, mut route: Route) -> Result<()> {
        route.active = true;
        let updated_at = now_rfc3339();
        let persisted = route.clone();
        self.persistence
            .with_retry(move |pool| {
                let route = persisted.clone();
                let updated_at = updated_at.clone();
                async move {
                    sqlx::query(
                        "INSERT INTO routes (domain, container_id, container_ip, container_port, protocol, path, active, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)
                         ON CONFLICT(domain) DO UPDATE SET
                            container_id = excluded.container_id,
                            container_ip = excluded.container_ip,
                            container_port = excluded.container_port,
                            protocol = excluded.protocol,
                            path = excluded.path,
                            active = 1,
                            updated_at = excluded.updated_at",
                    )
                    .bind(&route.domain)
                    .bind(&route.container_id)
                    .bind(&route.container_ip)
                    .bind(&route.container_port)
                    .bind(route.protocol.as_str())
                    .bind(&route.path)
                    .bind(&updated_at)
                    .execute(&pool)
                    .await
                }
            })
            .await?;

        self.routes.write().await.insert(route.domain.clone(), route);
        Ok(())
    }

    /// `Remove(domain)`: refuses to remove the admin domain.
    pub async fn remove(&self, domain: &str) -> Result<()> {
        let key = normalize_domain(domain);
        if key == self.admin_domain {
            return Err(RouteTableError::AdminProtected);
        }

        self.persistence
            .with_retry({
                let key = key.clone();
                move |pool| {
                    let key = key.clone();
                    async move { sqlx::query("DELETE FROM routes WHERE domain = ?1").bind(&key).execute(&pool).await }
                }
            })
            .await?;

        self.routes.write().await.remove(&key);
        Ok(())
    }

    /// `MarkInactive(domains[])`: filters out the admin domain, bulk
    /// transactional flip.
    pub async fn mark_inactive(&self, domains: &[String]) -> Result<()> {
        let targets: Vec<String> = domains
            .iter()
            .map(|d| normalize_domain(d))
            .filter(|d| d != &self.admin_domain)
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        let updated_at = now_rfc3339();
        self.persistence
            .with_retry({
                let targets = targets.clone();
                let updated_at = updated_at.clone();
                move |pool| {
                    let targets = targets.clone();
                    let updated_at = updated_at.clone();
                    async move {
                        let mut tx = pool.begin().await?;
                        for domain in &targets {
                            sqlx::query("UPDATE routes SET active = 0, updated_at = ?2 WHERE domain = ?1")
                                .bind(domain)
                                .bind(&updated_at)
                                .execute(&mut *tx)
                                .await?;
                        }
                        tx.commit().await
                    }
                }
            })
            .await?;

        let mut guard = self.routes.write().await;
        for domain in &targets {
            if let Some(route) = guard.get_mut(domain) {
                route.active = false;
            }
        }
        Ok(())
    }

    /// `ForceUpdateIP(domain, newIP)`: authoritative IP replacement;
    /// re-activates if inactive.
    pub async fn force_update_ip(&self, domain: &str, new_ip: &str) -> Result<()> {
        let key = normalize_domain(domain);
        let updated_at = now_rfc3339();

        self.persistence
            .with_retry({
                let key = key.clone();
                let new_ip = new_ip.to_string();
                let updated_at = updated_at.clone();
                move |pool| {
                    let key = key.clone();
                    let new_ip = new_ip.clone();
                    let updated_at = updated_at.clone();
                    async move {
                        sqlx::query(
                            "UPDATE routes SET container_ip = ?2, active = 1, updated_at = ?3 WHERE domain = ?1",
                        )
                        .bind(&key)
                        .bind(&new_ip)
                        .bind(&updated_at)
                        .execute(&pool)
                        .await
                    }
                }
            })
            .await?;

        let mut guard = self.routes.write().await;
        match guard.get_mut(&key) {
            Some(route) => {
                route.container_ip = new_ip.to_string();
                route.active = true;
                Ok(())
            }
            None => Err(RouteTableError::NotFound(key)),
        }
    }

    /// `Snapshot() → mapping from domain to Route`: consistent copy for
    /// readers.
    pub async fn snapshot(&self) -> HashMap<String, Route> {
        self.routes.read().await.clone()
    }

    /// All domains currently bound to `container_id`, admin domain
    /// excluded. Used by the reactor to build `MarkInactive` batches.
    pub async fn domains_for_container(&self, container_id: &str) -> Vec<String> {
        self.routes
            .read()
            .await
            .values()
            .filter(|r| r.container_id == container_id && r.domain != self.admin_domain)
            .map(|r| r.domain.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn table() -> RouteTable {
        let persistence = Arc::new(SqlitePersistence::connect(":memory:").await.unwrap());
        RouteTable::load("admin.localhost", persistence).await.unwrap()
    }

    fn route(domain: &str) -> Route {
        Route {
            domain: domain.to_string(),
            container_id: "c1".to_string(),
            container_ip: "10.89.0.5".to_string(),
            container_port: "8080".to_string(),
            protocol: Protocol::Http,
            path: "/".to_string(),
            active: true,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let table = table().await;
        table.upsert(route("app.example.com")).await.unwrap();
        let got = table.get("APP.example.com.").await.unwrap();
        assert_eq!(got.container_ip, "10.89.0.5");
        assert!(got.active);
    }

    #[tokio::test]
    async fn upsert_admin_domain_through_generic_path_is_rejected() {
        let table = table().await;
        let err = table.upsert(route("admin.localhost")).await.unwrap_err();
        assert!(matches!(err, RouteTableError::AdminProtected));
    }

    #[tokio::test]
    async fn mark_inactive_never_touches_admin_domain() {
        let table = table().await;
        table.upsert_admin(route("admin.localhost")).await.unwrap();
        table
            .mark_inactive(&["admin.localhost".to_string()])
            .await
            .unwrap();
        assert!(table.get("admin.localhost").await.unwrap().active);
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let table = table().await;
        table.upsert(route("app.example.com")).await.unwrap();
        table.upsert(route("app.example.com")).await.unwrap();
        assert_eq!(table.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn force_update_ip_reactivates_inactive_route() {
        let table = table().await;
        table.upsert(route("app.example.com")).await.unwrap();
        table
            .mark_inactive(&["app.example.com".to_string()])
            .await
            .unwrap();
        table
            .force_update_ip("app.example.com", "10.89.0.9")
            .await
            .unwrap();
        let got = table.get("app.example.com").await.unwrap();
        assert!(got.active);
        assert_eq!(got.container_ip, "10.89.0.9");
    }
}
