//! The `Runtime` capability trait: everything the reactor needs to know
//! about containers, without depending on a concrete container engine.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("no such container: {0}")]
    NotFound(String),

    #[error("runtime backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
}

/// A single container's runtime-reported shape, shaped after the Docker
/// Engine API's container-inspect response: IP per network, labels, name.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    /// IP address on a given network name.
    pub networks: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

impl ContainerInfo {
    /// The IP this container reports on the configured network, if attached
    /// to it (spec §4.5 step 3: "verify the reported IP against the
    /// runtime's live IP on the configured network").
    pub fn ip_on(&self, network: &str) -> Option<&str> {
        self.networks.get(network).map(String::as_str)
    }
}

/// A raw lifecycle notification as the runtime reports it, before the
/// reactor has looked anything up or decided anything (spec §4.5: the
/// `ContainerStart`/`ContainerStop` bus events are the reactor's *output*,
/// not its input).
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    Started { container_id: String },
    Stopped { container_id: String },
}

/// The container runtime capability the reactor consumes. A concrete engine
/// client (Docker/Podman) is an external collaborator implementing this
/// trait; the core only ever sees this surface.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo, RuntimeError>;
    async fn list_running(&self) -> Result<Vec<ContainerInfo>, RuntimeError>;

    /// Awaits the next lifecycle event from the runtime's own event stream.
    /// Returns `None` once the runtime connection is closed for good.
    async fn next_event(&self) -> Option<RuntimeEvent>;
}

/// In-memory test double, mutated directly by tests driving the reactor.
pub struct MockRuntime {
    containers: Mutex<HashMap<String, ContainerInfo>>,
    events_tx: mpsc::UnboundedSender<RuntimeEvent>,
    events_rx: AsyncMutex<mpsc::UnboundedReceiver<RuntimeEvent>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            containers: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: AsyncMutex::new(events_rx),
        }
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: ContainerInfo) {
        self.containers.lock().unwrap().insert(info.id.clone(), info);
    }

    pub fn remove(&self, container_id: &str) {
        self.containers.lock().unwrap().remove(container_id);
    }

    /// Pushes a lifecycle event as if the runtime itself had emitted it.
    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo, RuntimeError> {
        self.containers
            .lock()
            .unwrap()
            .get(container_id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))
    }

    async fn list_running(&self) -> Result<Vec<ContainerInfo>, RuntimeError> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.state == ContainerState::Running)
            .cloned()
            .collect())
    }

    async fn next_event(&self) -> Option<RuntimeEvent> {
        self.events_rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(id: &str, network: &str, ip: &str) -> ContainerInfo {
        let mut networks = HashMap::new();
        networks.insert(network.to_string(), ip.to_string());
        ContainerInfo {
            id: id.to_string(),
            name: format!("{id}-name"),
            state: ContainerState::Running,
            networks,
            labels: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn mock_runtime_inspects_inserted_container() {
        let runtime = MockRuntime::new();
        runtime.insert(container("c1", "pingclair", "10.89.0.5"));

        let info = runtime.inspect("c1").await.unwrap();
        assert_eq!(info.ip_on("pingclair"), Some("10.89.0.5"));
    }

    #[tokio::test]
    async fn mock_runtime_errors_on_unknown_container() {
        let runtime = MockRuntime::new();
        assert!(matches!(runtime.inspect("missing").await, Err(RuntimeError::NotFound(_))));
    }

    #[tokio::test]
    async fn mock_runtime_delivers_emitted_events_in_order() {
        let runtime = MockRuntime::new();
        runtime.emit(RuntimeEvent::Started { container_id: "c1".into() });
        runtime.emit(RuntimeEvent::Stopped { container_id: "c1".into() });

        assert!(matches!(runtime.next_event().await, Some(RuntimeEvent::Started { .. })));
        assert!(matches!(runtime.next_event().await, Some(RuntimeEvent::Stopped { .. })));
    }
}
