use crate::error::ProviderError;
use crate::runtime::plan::PlannedNode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

pub mod builtin;
pub mod script;
pub mod simulated;

/// Opaque reference to a provisioned resource, as returned by `create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// Provider-native id (an instance id, a volume id, ...).
    pub id: String,
    pub provider: String,
    pub kind: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl ResourceHandle {
    pub fn new(id: impl Into<String>, provider: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            kind: kind.into(),
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Everything an adapter gets to know when asked to create or adopt a resource.
#[derive(Debug, Clone, Copy)]
pub struct CreateRequest<'a> {
    pub deployment_id: &'a str,
    /// Name the resource is provisioned under, or the id of the resource to
    /// adopt.
    pub resource_id: &'a str,
    pub node: &'a PlannedNode,
}

/// Plugin interface: every provider backend implements this trait.
#[async_trait]
pub trait ProviderAdapter: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Node types this adapter handles, subtypes included.
    fn node_types(&self) -> Vec<String>;

    async fn create(&self, request: &CreateRequest<'_>) -> Result<ResourceHandle, ProviderError>;

    /// Takes over a resource that exists outside this deployment.
    async fn adopt(&self, request: &CreateRequest<'_>) -> Result<ResourceHandle, ProviderError> {
        Ok(ResourceHandle::new(request.resource_id, self.name(), &request.node.node_type).with_attribute("external", true))
    }

    async fn start(&self, handle: &ResourceHandle) -> Result<(), ProviderError>;

    async fn stop(&self, handle: &ResourceHandle) -> Result<(), ProviderError>;

    async fn delete(&self, handle: &ResourceHandle) -> Result<(), ProviderError>;
}

/// Maps node types to adapters. A node is served by the adapter registered
/// for the most specific type in its ancestry.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    by_type: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the logical adapter for abstract `cloudify.nodes.Root` nodes.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(builtin::LogicalAdapter));
        registry
    }

    /// Later registrations win for types claimed twice.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        for node_type in adapter.node_types() {
            self.by_type.insert(node_type, Arc::clone(&adapter));
        }
    }

    pub fn resolve(&self, node: &PlannedNode) -> Option<Arc<dyn ProviderAdapter>> {
        node.type_hierarchy
            .iter()
            .chain(std::iter::once(&node.node_type))
            .find_map(|t| self.by_type.get(t))
            .cloned()
    }
}
