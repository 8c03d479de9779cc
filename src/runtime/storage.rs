use crate::providers::ResourceHandle;
use crate::runtime::plan::{ExecutionPlan, Graph};
use crate::runtime::report::ExecutionSummary;
use crate::runtime::state::NodeState;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use uuid::Uuid;

/// Runtime record of one node of a deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub state: NodeState,
    pub handle: Option<ResourceHandle>,
    /// Adopted rather than created; never stopped or deleted.
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub runtime_properties: Map<String, Value>,
}

/// A graph bound to a deployment id, with the state of every node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub blueprint: Option<PathBuf>,
    pub graph: Graph,
    pub instances: IndexMap<String, NodeInstance>,
    pub last_plan: Option<ExecutionPlan>,
    pub last_run: Option<ExecutionSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(id: impl Into<String>, graph: Graph) -> Self {
        let instances = graph
            .order()
            .into_iter()
            .map(|name| (name.to_string(), NodeInstance::default()))
            .collect();
        let now = Utc::now();
        Self {
            id: id.into(),
            blueprint: None,
            graph,
            instances,
            last_plan: None,
            last_run: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_blueprint(mut self, path: impl Into<PathBuf>) -> Self {
        self.blueprint = Some(path.into());
        self
    }

    pub fn generate_id(prefix: &str) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", prefix, &suffix[..8])
    }

    /// Swaps in a freshly built graph, keeping the state of nodes that still
    /// exist. Nodes dropped from the graph must already be torn down.
    pub fn rebind(&mut self, graph: Graph) -> Result<()> {
        if let Some((name, orphan)) = self.instances.iter().find(|(name, i)| {
            graph.node(name).is_none() && !matches!(i.state, NodeState::Uninitialized | NodeState::Deleted)
        }) {
            bail!(
                "node '{}' of deployment '{}' is {} but no longer in the blueprint; uninstall it first",
                name,
                self.id,
                orphan.state
            );
        }
        let instances = graph
            .order()
            .into_iter()
            .map(|name| (name.to_string(), self.instances.get(name).cloned().unwrap_or_default()))
            .collect();
        self.graph = graph;
        self.instances = instances;
        Ok(())
    }

    pub fn instance(&self, node: &str) -> Option<&NodeInstance> {
        self.instances.get(node)
    }

    pub fn state(&self, node: &str) -> NodeState {
        self.instances.get(node).map(|i| i.state).unwrap_or_default()
    }

    /// Nothing left that an uninstall would have to tear down.
    pub fn is_torn_down(&self) -> bool {
        self.instances
            .values()
            .all(|i| matches!(i.state, NodeState::Uninitialized | NodeState::Deleted))
    }
}

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn save(&self, deployment: &Deployment) -> Result<()>;
    async fn load(&self, id: &str) -> Result<Option<Deployment>>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<String>>;
}

#[derive(Default)]
pub struct InMemoryDeploymentStore {
    deployments: DashMap<String, Deployment>,
}

impl InMemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for InMemoryDeploymentStore {
    async fn save(&self, deployment: &Deployment) -> Result<()> {
        self.deployments.insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Deployment>> {
        Ok(self.deployments.get(id).map(|d| d.value().clone()))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.deployments.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.deployments.iter().map(|d| d.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

/// One JSON document per deployment under a state directory.
pub struct FileDeploymentStore {
    dir: PathBuf,
}

impl FileDeploymentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            bail!("invalid deployment id '{}'", id);
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

#[async_trait]
impl DeploymentStore for FileDeploymentStore {
    async fn save(&self, deployment: &Deployment) -> Result<()> {
        let path = self.path_for(&deployment.id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let json = serde_json::to_vec_pretty(deployment)?;
        // Atomic replace.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Deployment>> {
        let path = self.path_for(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let deployment = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt deployment record {}", path.display()))?;
                Ok(Some(deployment))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete {}", path.display())),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e).with_context(|| format!("failed to list {}", self.dir.display())),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
