use crate::error::ProviderError;
use crate::providers::{CreateRequest, ProviderAdapter, ResourceHandle};
use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Infrastructure node types a simulated cloud serves out of the box.
pub const INFRASTRUCTURE_TYPES: [&str; 9] = [
    "cloudify.nodes.Compute",
    "cloudify.nodes.Network",
    "cloudify.nodes.Subnet",
    "cloudify.nodes.Port",
    "cloudify.nodes.Router",
    "cloudify.nodes.SecurityGroup",
    "cloudify.nodes.VirtualIP",
    "cloudify.nodes.Volume",
    "cloudify.aws.nodes.KeyPair",
];

const HANG: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderAction {
    Create,
    Adopt,
    Start,
    Stop,
    Delete,
}

impl fmt::Display for ProviderAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Adopt => "adopt",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Injected misbehaviour for one node and action.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Every call fails with a non-retryable error.
    Fatal { code: String, message: String },
    /// The next `remaining` calls fail with a retryable error.
    Transient { remaining: u32 },
    /// Calls never return.
    Hang,
}

impl Fault {
    pub fn fatal(code: &str, message: &str) -> Self {
        Self::Fatal {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

/// One completed adapter call. Calls abandoned by a timeout are not logged.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub node: String,
    pub action: ProviderAction,
    pub resource_id: String,
    /// Node properties as seen by `create` and `adopt`; empty otherwise.
    pub properties: IndexMap<String, Value>,
    pub started: Instant,
    pub finished: Instant,
    pub error: Option<ProviderError>,
}

impl ProviderCall {
    pub fn overlaps(&self, other: &ProviderCall) -> bool {
        self.started < other.finished && other.started < self.finished
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedResource {
    pub id: String,
    pub name: String,
    pub node: Option<String>,
    pub kind: String,
    pub running: bool,
    pub external: bool,
}

/// In-memory cloud used for dry runs and tests.
#[derive(Debug)]
pub struct SimulatedProvider {
    name: String,
    node_types: Vec<String>,
    latency: Duration,
    strict: bool,
    next_id: AtomicU64,
    resources: DashMap<String, SimulatedResource>,
    faults: DashMap<(String, ProviderAction), Fault>,
    calls: Mutex<Vec<ProviderCall>>,
}

impl SimulatedProvider {
    pub fn new<I, S>(name: &str, node_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            node_types: node_types.into_iter().map(Into::into).collect(),
            latency: Duration::ZERO,
            strict: false,
            next_id: AtomicU64::new(1),
            resources: DashMap::new(),
            faults: DashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn infrastructure(name: &str) -> Self {
        Self::new(name, INFRASTRUCTURE_TYPES)
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Unknown handles and adoption of missing resources become errors.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn fail(&self, node: &str, action: ProviderAction, fault: Fault) {
        self.faults.insert((node.to_string(), action), fault);
    }

    pub fn clear_faults(&self) {
        self.faults.clear();
    }

    /// Registers a resource that exists outside any deployment.
    pub fn seed_resource(&self, id: &str, kind: &str) {
        self.resources.insert(
            id.to_string(),
            SimulatedResource {
                id: id.to_string(),
                name: id.to_string(),
                node: None,
                kind: kind.to_string(),
                running: true,
                external: true,
            },
        );
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn calls_for(&self, node: &str) -> Vec<ProviderCall> {
        self.calls().into_iter().filter(|c| c.node == node).collect()
    }

    /// `(node, action)` for every logged call, in completion order.
    pub fn actions(&self) -> Vec<(String, ProviderAction)> {
        self.calls().into_iter().map(|c| (c.node, c.action)).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn resource(&self, id: &str) -> Option<SimulatedResource> {
        self.resources.get(id).map(|r| r.value().clone())
    }

    pub fn resources(&self) -> Vec<SimulatedResource> {
        self.resources.iter().map(|r| r.value().clone()).collect()
    }

    fn take_fault(&self, node: &str, action: ProviderAction) -> Option<Fault> {
        let mut entry = self.faults.get_mut(&(node.to_string(), action))?;
        match entry.value_mut() {
            Fault::Transient { remaining } if *remaining == 0 => None,
            Fault::Transient { remaining } => {
                *remaining -= 1;
                Some(Fault::Transient { remaining: *remaining })
            }
            other => Some(other.clone()),
        }
    }

    async fn invoke<T>(
        &self,
        node: &str,
        action: ProviderAction,
        resource_id: &str,
        properties: IndexMap<String, Value>,
        apply: impl FnOnce() -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        let started = Instant::now();
        let fault = self.take_fault(node, action);
        if fault == Some(Fault::Hang) {
            tokio::time::sleep(HANG).await;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let result = match fault {
            Some(Fault::Fatal { code, message }) => Err(ProviderError::fatal(code, message)),
            Some(Fault::Transient { .. }) => Err(ProviderError::retryable(
                "RequestLimitExceeded",
                format!("{} of {} throttled", action, node),
            )),
            _ => apply(),
        };
        debug!(provider = %self.name, node, %action, ok = result.is_ok(), "Simulated call");

        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(ProviderCall {
            node: node.to_string(),
            action,
            resource_id: resource_id.to_string(),
            properties,
            started,
            finished: Instant::now(),
            error: result.as_ref().err().cloned(),
        });
        result
    }

    fn with_resource(&self, handle: &ResourceHandle, f: impl FnOnce(&mut SimulatedResource)) -> Result<(), ProviderError> {
        match self.resources.get_mut(&handle.id) {
            Some(mut r) => {
                f(r.value_mut());
                Ok(())
            }
            None if self.strict => Err(not_found(&handle.id)),
            None => Ok(()),
        }
    }
}

fn not_found(id: &str) -> ProviderError {
    ProviderError::fatal("NotFound", format!("resource '{}' does not exist", id))
}

fn handle_node(handle: &ResourceHandle) -> String {
    handle
        .attributes
        .get("node")
        .and_then(Value::as_str)
        .unwrap_or(&handle.id)
        .to_string()
}

#[async_trait]
impl ProviderAdapter for SimulatedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_types(&self) -> Vec<String> {
        self.node_types.clone()
    }

    async fn create(&self, request: &CreateRequest<'_>) -> Result<ResourceHandle, ProviderError> {
        let node = request.node;
        self.invoke(&node.name, ProviderAction::Create, request.resource_id, node.properties.clone(), || {
            let id = format!("{}-{:06}", self.name, self.next_id.fetch_add(1, Ordering::SeqCst));
            self.resources.insert(
                id.clone(),
                SimulatedResource {
                    id: id.clone(),
                    name: request.resource_id.to_string(),
                    node: Some(node.name.clone()),
                    kind: node.node_type.clone(),
                    running: false,
                    external: false,
                },
            );
            Ok(ResourceHandle::new(id, &self.name, &node.node_type)
                .with_attribute("node", node.name.as_str())
                .with_attribute("name", request.resource_id))
        })
        .await
    }

    async fn adopt(&self, request: &CreateRequest<'_>) -> Result<ResourceHandle, ProviderError> {
        let node = request.node;
        self.invoke(&node.name, ProviderAction::Adopt, request.resource_id, node.properties.clone(), || {
            if !self.resources.contains_key(request.resource_id) {
                if self.strict {
                    return Err(not_found(request.resource_id));
                }
                self.seed_resource(request.resource_id, &node.node_type);
            }
            Ok(ResourceHandle::new(request.resource_id, &self.name, &node.node_type)
                .with_attribute("node", node.name.as_str())
                .with_attribute("external", true))
        })
        .await
    }

    async fn start(&self, handle: &ResourceHandle) -> Result<(), ProviderError> {
        let node = handle_node(handle);
        self.invoke(&node, ProviderAction::Start, &handle.id, IndexMap::new(), || {
            self.with_resource(handle, |r| r.running = true)
        })
        .await
    }

    async fn stop(&self, handle: &ResourceHandle) -> Result<(), ProviderError> {
        let node = handle_node(handle);
        self.invoke(&node, ProviderAction::Stop, &handle.id, IndexMap::new(), || {
            self.with_resource(handle, |r| r.running = false)
        })
        .await
    }

    async fn delete(&self, handle: &ResourceHandle) -> Result<(), ProviderError> {
        let node = handle_node(handle);
        self.invoke(&node, ProviderAction::Delete, &handle.id, IndexMap::new(), || {
            match self.resources.remove(&handle.id) {
                Some(_) => Ok(()),
                None if self.strict => Err(not_found(&handle.id)),
                None => Ok(()),
            }
        })
        .await
    }
}
