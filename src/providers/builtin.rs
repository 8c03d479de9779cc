use crate::error::ProviderError;
use crate::providers::{CreateRequest, ProviderAdapter, ResourceHandle};
use async_trait::async_trait;
use tracing::debug;

/// Adapter for abstract nodes that exist only to carry scripts and ordering.
/// It never leaves the process.
#[derive(Debug)]
pub struct LogicalAdapter;

#[async_trait]
impl ProviderAdapter for LogicalAdapter {
    fn name(&self) -> &str {
        "logical"
    }

    fn node_types(&self) -> Vec<String> {
        vec!["cloudify.nodes.Root".to_string()]
    }

    async fn create(&self, request: &CreateRequest<'_>) -> Result<ResourceHandle, ProviderError> {
        debug!(node = %request.node.name, "Logical create");
        Ok(ResourceHandle::new(request.resource_id, self.name(), &request.node.node_type))
    }

    async fn start(&self, _handle: &ResourceHandle) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn stop(&self, _handle: &ResourceHandle) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn delete(&self, _handle: &ResourceHandle) -> Result<(), ProviderError> {
        Ok(())
    }
}
