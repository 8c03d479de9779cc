use crate::error::PlanError;
use crate::runtime::blueprint::{LifecycleOperation, Relationship, is_script_path};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Install,
    Uninstall,
}

impl Phase {
    pub fn operations(&self) -> &'static [LifecycleOperation] {
        match self {
            Self::Install => &LifecycleOperation::INSTALL,
            Self::Uninstall => &LifecycleOperation::UNINSTALL,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => f.write_str("install"),
            Self::Uninstall => f.write_str("uninstall"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedOperation {
    pub implementation: String,
    #[serde(default)]
    pub inputs: IndexMap<String, Value>,
}

impl ResolvedOperation {
    pub fn is_script(&self) -> bool {
        is_script_path(&self.implementation)
    }
}

/// A node with every input reference substituted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedNode {
    pub name: String,
    pub node_type: String,
    /// Most specific type first.
    pub type_hierarchy: Vec<String>,
    pub properties: IndexMap<String, Value>,
    pub operations: IndexMap<LifecycleOperation, ResolvedOperation>,
    pub relationships: Vec<Relationship>,
}

impl PlannedNode {
    /// The lifecycle script for `operation`, if the node maps one.
    pub fn script(&self, operation: LifecycleOperation) -> Option<&ResolvedOperation> {
        self.operations.get(&operation).filter(|op| op.is_script())
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    pub fn uses_external_resource(&self) -> bool {
        self.properties
            .get("use_external_resource")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// The acyclic, fully resolved dependency graph of a deployment.
///
/// Only the graph builder constructs one, and a deserialized graph is checked
/// again, so holding a `Graph` means the relationship ordering is sound. Nodes
/// are stored in topological order: every node comes after everything it
/// depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGraph")]
pub struct Graph {
    dsl_version: String,
    base_dir: Option<PathBuf>,
    inputs: IndexMap<String, Value>,
    nodes: IndexMap<String, PlannedNode>,
    dependencies: IndexMap<String, Vec<String>>,
    dependents: IndexMap<String, Vec<String>>,
}

/// A graph as read from storage, before its ordering is checked.
#[derive(Deserialize)]
struct RawGraph {
    dsl_version: String,
    base_dir: Option<PathBuf>,
    inputs: IndexMap<String, Value>,
    nodes: IndexMap<String, PlannedNode>,
    dependencies: IndexMap<String, Vec<String>>,
}

impl TryFrom<RawGraph> for Graph {
    type Error = PlanError;

    /// Dependents are derived again from the dependencies.
    fn try_from(raw: RawGraph) -> Result<Self, PlanError> {
        let mut dependencies = IndexMap::with_capacity(raw.nodes.len());
        for (position, name) in raw.nodes.keys().enumerate() {
            let deps = raw.dependencies.get(name).cloned().unwrap_or_default();
            for dep in &deps {
                match raw.nodes.get_index_of(dep) {
                    None => {
                        return Err(PlanError::UnresolvedReference {
                            node: name.clone(),
                            target: dep.clone(),
                        });
                    }
                    Some(index) if index >= position => {
                        return Err(PlanError::Unordered {
                            node: name.clone(),
                            dependency: dep.clone(),
                        });
                    }
                    Some(_) => {}
                }
            }
            dependencies.insert(name.clone(), deps);
        }
        Ok(Self::new(raw.dsl_version, raw.base_dir, raw.inputs, raw.nodes, dependencies))
    }
}

impl Graph {
    pub(crate) fn new(
        dsl_version: String,
        base_dir: Option<PathBuf>,
        inputs: IndexMap<String, Value>,
        nodes: IndexMap<String, PlannedNode>,
        dependencies: IndexMap<String, Vec<String>>,
    ) -> Self {
        let mut dependents: IndexMap<String, Vec<String>> =
            nodes.keys().map(|k| (k.clone(), Vec::new())).collect();
        for (node, deps) in &dependencies {
            for dep in deps {
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(node.clone());
                }
            }
        }
        Self {
            dsl_version,
            base_dir,
            inputs,
            nodes,
            dependencies,
            dependents,
        }
    }

    pub fn base_dir(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    pub fn inputs(&self) -> &IndexMap<String, Value> {
        &self.inputs
    }

    pub fn node(&self, name: &str) -> Option<&PlannedNode> {
        self.nodes.get(name)
    }

    /// Nodes in topological order.
    pub fn nodes(&self) -> impl DoubleEndedIterator<Item = &PlannedNode> {
        self.nodes.values()
    }

    pub fn order(&self) -> Vec<&str> {
        self.nodes.keys().map(String::as_str).collect()
    }

    pub fn dependencies(&self, name: &str) -> &[String] {
        self.dependencies.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents(&self, name: &str) -> &[String] {
        self.dependents.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The sequential view of a phase: nodes in dependency order for install,
    /// reversed for uninstall, each expanded into its lifecycle operations.
    pub fn plan(&self, phase: Phase) -> ExecutionPlan {
        let order: Vec<&String> = match phase {
            Phase::Install => self.nodes.keys().collect(),
            Phase::Uninstall => self.nodes.keys().rev().collect(),
        };
        let steps = order
            .into_iter()
            .flat_map(|node| {
                phase.operations().iter().map(move |op| PlanStep {
                    node: node.clone(),
                    operation: *op,
                })
            })
            .collect();
        ExecutionPlan { phase, steps }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub node: String,
    pub operation: LifecycleOperation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub phase: Phase,
    pub steps: Vec<PlanStep>,
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} plan ({} steps)", self.phase, self.steps.len())?;
        for (i, step) in self.steps.iter().enumerate() {
            writeln!(f, "  {:>3}. {}.{}", i + 1, step.node, step.operation)?;
        }
        Ok(())
    }
}
