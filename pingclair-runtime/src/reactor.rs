//! Container Event Reactor (spec §4.5): turns runtime lifecycle events and
//! container labels into Route Table mutations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pingclair_core::event_bus::{Event, EventBus};
use pingclair_core::route_table::{Protocol, Route, RouteTable};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::runtime::{ContainerInfo, Runtime, RuntimeEvent};

const LABEL_DOMAIN: &str = "gordon.domain";
const LABEL_SERVICE: &str = "gordon.service";
const LABEL_PROXY_PORT: &str = "gordon.proxy.port";
const LABEL_PROXY_SSL: &str = "gordon.proxy.ssl";
const LABEL_MANAGED: &str = "gordon.managed";

const DEFAULT_PORT: &str = "80";

#[derive(Error, Debug)]
pub enum ReactorError {
    #[error(transparent)]
    RouteTable(#[from] pingclair_core::route_table::RouteTableError),

    #[error(transparent)]
    Runtime(#[from] crate::runtime::RuntimeError),
}

/// Drives the reactor state machine off a runtime's event stream.
pub struct EventReactor<R: Runtime> {
    runtime: Arc<R>,
    routes: Arc<RouteTable>,
    events: EventBus,
    container_network: String,
    own_container_id: Option<String>,
    cooldown: Duration,
    recent: Mutex<HashMap<String, Instant>>,
}

impl<R: Runtime> EventReactor<R> {
    pub fn new(
        runtime: Arc<R>,
        routes: Arc<RouteTable>,
        events: EventBus,
        container_network: String,
        own_container_id: Option<String>,
        cooldown: Duration,
    ) -> Self {
        Self {
            runtime,
            routes,
            events,
            container_network,
            own_container_id,
            cooldown,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Drains the runtime's event stream until it closes. Intended to run
    /// as a background task for the process lifetime.
    pub async fn run(&self) {
        while let Some(event) = self.runtime.next_event().await {
            if let Err(err) = self.handle(event).await {
                tracing::warn!(error = %err, "reactor failed to process runtime event");
            }
        }
        tracing::info!("runtime event stream closed, reactor stopping");
    }

    async fn handle(&self, event: RuntimeEvent) -> Result<(), ReactorError> {
        match event {
            RuntimeEvent::Started { container_id } => self.on_start(&container_id).await,
            RuntimeEvent::Stopped { container_id } => self.on_stop(&container_id).await,
        }
    }

    async fn on_start(&self, container_id: &str) -> Result<(), ReactorError> {
        if self.in_cooldown(container_id).await {
            tracing::debug!(container_id, "container within cooldown window, dropping event");
            return Ok(());
        }
        self.arm_cooldown(container_id).await;

        let info = self.runtime.inspect(container_id).await?;
        let live_ip = info.ip_on(&self.container_network).map(str::to_string);

        self.reconcile_existing_routes(container_id, live_ip.as_deref()).await?;
        self.reconcile_labels(&info).await?;

        self.events.publish(Event::ContainerStart {
            container_id: info.id.clone(),
            container_name: info.name.clone(),
            container_ip: live_ip.unwrap_or_default(),
        });
        Ok(())
    }

    async fn on_stop(&self, container_id: &str) -> Result<(), ReactorError> {
        let domains = self.routes.domains_for_container(container_id).await;
        if !domains.is_empty() {
            self.routes.mark_inactive(&domains).await?;
        }

        let name = self
            .runtime
            .inspect(container_id)
            .await
            .map(|info| info.name)
            .unwrap_or_default();

        self.events.publish(Event::ContainerStop {
            container_id: container_id.to_string(),
            container_name: name,
        });
        Ok(())
    }

    /// Step 4 of the state machine: reconcile every route already bound to
    /// this container ID against the live IP just observed.
    async fn reconcile_existing_routes(
        &self,
        container_id: &str,
        live_ip: Option<&str>,
    ) -> Result<(), ReactorError> {
        let snapshot = self.routes.snapshot().await;
        let is_own = self.own_container_id.as_deref() == Some(container_id);

        for (domain, route) in snapshot {
            if route.container_id != container_id {
                continue;
            }
            let Some(live_ip) = live_ip else { continue };

            if domain == self.routes.admin_domain() && is_own {
                self.routes.force_update_ip(&domain, live_ip).await?;
            } else if route.container_ip != live_ip {
                self.routes.force_update_ip(&domain, live_ip).await?;
            } else if !route.active {
                self.routes.force_update_ip(&domain, live_ip).await?;
            }
        }
        Ok(())
    }

    /// Step 6: interpret `gordon.*` labels on a freshly started container to
    /// create or update its managed route.
    async fn reconcile_labels(&self, info: &ContainerInfo) -> Result<(), ReactorError> {
        if info.labels.get(LABEL_MANAGED).map(String::as_str) != Some("true") {
            return Ok(());
        }
        let Some(domain) = info.labels.get(LABEL_DOMAIN) else {
            tracing::warn!(container_id = info.id, "gordon.managed container missing gordon.domain label");
            return Ok(());
        };

        let ip = match info.ip_on(&self.container_network) {
            Some(ip) => ip.to_string(),
            None => {
                tracing::warn!(
                    container_id = info.id,
                    network = self.container_network,
                    "managed container not attached to configured network"
                );
                return Ok(());
            }
        };

        let port = info
            .labels
            .get(LABEL_PROXY_PORT)
            .cloned()
            .unwrap_or_else(|| DEFAULT_PORT.to_string());
        let protocol = match info.labels.get(LABEL_PROXY_SSL).map(String::as_str) {
            Some("true") => Protocol::Https,
            _ => Protocol::Http,
        };

        tracing::info!(
            container_id = info.id,
            domain,
            service = info.labels.get(LABEL_SERVICE).map(String::as_str).unwrap_or("unnamed"),
            "reconciling managed container route"
        );

        let route = Route {
            domain: domain.clone(),
            container_id: info.id.clone(),
            container_ip: ip,
            container_port: port,
            protocol,
            path: "/".to_string(),
            active: true,
        };

        self.routes.upsert(route).await?;
        Ok(())
    }

    async fn in_cooldown(&self, container_id: &str) -> bool {
        let recent = self.recent.lock().await;
        matches!(recent.get(container_id), Some(until) if Instant::now() < *until)
    }

    async fn arm_cooldown(&self, container_id: &str) {
        let until = Instant::now() + self.cooldown;
        self.recent.lock().await.insert(container_id.to_string(), until);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerState, MockRuntime};
    use pingclair_core::persistence::SqlitePersistence;
    use std::collections::HashMap as Map;

    async fn reactor() -> (Arc<MockRuntime>, Arc<RouteTable>, EventReactor<MockRuntime>) {
        let persistence = Arc::new(SqlitePersistence::connect(":memory:").await.unwrap());
        let routes = Arc::new(RouteTable::load("admin.localhost", persistence).await.unwrap());
        let runtime = Arc::new(MockRuntime::new());
        let bus = EventBus::new();
        let reactor = EventReactor::new(
            runtime.clone(),
            routes.clone(),
            bus,
            "pingclair".to_string(),
            None,
            Duration::from_secs(10),
        );
        (runtime, routes, reactor)
    }

    fn managed_container(id: &str, domain: &str, ip: &str) -> ContainerInfo {
        let mut networks = Map::new();
        networks.insert("pingclair".to_string(), ip.to_string());
        let mut labels = Map::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_DOMAIN.to_string(), domain.to_string());
        ContainerInfo {
            id: id.to_string(),
            name: format!("{id}-name"),
            state: ContainerState::Running,
            networks,
            labels,
        }
    }

    #[tokio::test]
    async fn managed_container_start_creates_route() {
        let (runtime, routes, reactor) = reactor().await;
        runtime.insert(managed_container("c1", "app.example.com", "10.89.0.5"));

        reactor.on_start("c1").await.unwrap();

        let route = routes.get("app.example.com").await.unwrap();
        assert_eq!(route.container_ip, "10.89.0.5");
        assert_eq!(route.container_port, "80");
        assert!(route.active);
    }

    #[tokio::test]
    async fn stop_marks_routes_inactive() {
        let (runtime, routes, reactor) = reactor().await;
        runtime.insert(managed_container("c1", "app.example.com", "10.89.0.5"));
        reactor.on_start("c1").await.unwrap();

        runtime.remove("c1");
        reactor.on_stop("c1").await.unwrap();

        assert!(!routes.get("app.example.com").await.unwrap().active);
    }

    #[tokio::test]
    async fn cooldown_drops_repeated_start_events() {
        let (runtime, routes, reactor) = reactor().await;
        runtime.insert(managed_container("c1", "app.example.com", "10.89.0.5"));
        reactor.on_start("c1").await.unwrap();

        runtime.insert(managed_container("c1", "changed.example.com", "10.89.0.9"));
        reactor.on_start("c1").await.unwrap();

        assert!(routes.get("changed.example.com").await.is_none());
        assert_eq!(routes.get("app.example.com").await.unwrap().container_ip, "10.89.0.5");
    }

    #[tokio::test]
    async fn ip_drift_triggers_force_update() {
        let (runtime, routes, reactor) = reactor().await;
        runtime.insert(managed_container("c1", "app.example.com", "10.89.0.5"));
        reactor.on_start("c1").await.unwrap();

        runtime.insert(managed_container("c1", "app.example.com", "10.89.0.6"));
        // bypass cooldown for the test by driving reconcile directly
        reactor
            .reconcile_existing_routes("c1", Some("10.89.0.6"))
            .await
            .unwrap();

        assert_eq!(routes.get("app.example.com").await.unwrap().container_ip, "10.89.0.6");
    }
}
