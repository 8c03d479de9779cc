use crate::compiler::inputs::resolve_inputs;
use crate::error::PlanError;
use crate::runtime::blueprint::{Blueprint, Node, PropertyValue};
use crate::runtime::plan::{Graph, PlannedNode, ResolvedOperation};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Builds the dependency graph of a blueprint for a given set of inputs.
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    inputs: HashMap<String, Value>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Visited,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inputs(inputs: HashMap<String, Value>) -> Self {
        Self { inputs }
    }

    pub fn input(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.inputs.insert(key.to_string(), value.into());
        self
    }

    pub fn compile(&self, blueprint: &Blueprint) -> Result<Graph, PlanError> {
        // 1. Edges
        let dependencies = ordering_edges(blueprint)?;

        // 2. Order
        let order = topological_order(&dependencies)?;

        // 3. Inputs, resolved once for every node
        let inputs = resolve_inputs(&blueprint.inputs, &self.inputs)?;

        // 4. Substitution
        let mut nodes = IndexMap::with_capacity(order.len());
        for name in &order {
            let node = &blueprint.nodes[name.as_str()];
            nodes.insert(name.clone(), plan_node(node, blueprint, &inputs)?);
        }
        debug!(order = ?order, "Built dependency graph");

        let dependencies = order
            .iter()
            .map(|n| {
                let deps: Vec<String> = dependencies[n.as_str()].iter().map(|d| d.to_string()).collect();
                (n.clone(), deps)
            })
            .collect();

        Ok(Graph::new(
            blueprint.dsl_version.clone(),
            blueprint.base_dir.clone(),
            inputs,
            nodes,
            dependencies,
        ))
    }
}

/// Dependencies per node, in declaration order and without duplicates.
fn ordering_edges(blueprint: &Blueprint) -> Result<IndexMap<&str, Vec<&str>>, PlanError> {
    let mut edges = IndexMap::with_capacity(blueprint.nodes.len());
    for (name, node) in &blueprint.nodes {
        let mut deps: Vec<&str> = Vec::new();
        for rel in &node.relationships {
            if !blueprint.nodes.contains_key(&rel.target) {
                return Err(PlanError::UnresolvedReference {
                    node: name.clone(),
                    target: rel.target.clone(),
                });
            }
            if rel.kind.orders() && !deps.contains(&rel.target.as_str()) {
                deps.push(&rel.target);
            }
        }
        edges.insert(name.as_str(), deps);
    }
    Ok(edges)
}

fn topological_order(edges: &IndexMap<&str, Vec<&str>>) -> Result<Vec<String>, PlanError> {
    let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(edges.len());
    let mut stack = Vec::new();
    let mut order = Vec::with_capacity(edges.len());
    for name in edges.keys() {
        visit(*name, edges, &mut marks, &mut stack, &mut order)?;
    }
    Ok(order)
}

fn visit<'a>(
    name: &'a str,
    edges: &IndexMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
    order: &mut Vec<String>,
) -> Result<(), PlanError> {
    match marks.get(name) {
        Some(Mark::Visited) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = stack.iter().position(|n| *n == name).unwrap_or(0);
            let mut path: Vec<String> = stack[start..].iter().map(|n| n.to_string()).collect();
            path.push(name.to_string());
            return Err(PlanError::Cycle { path });
        }
        None => {}
    }

    marks.insert(name, Mark::Visiting);
    stack.push(name);
    if let Some(deps) = edges.get(name) {
        for dep in deps {
            visit(*dep, edges, marks, stack, order)?;
        }
    }
    stack.pop();
    marks.insert(name, Mark::Visited);
    order.push(name.to_string());
    Ok(())
}

fn plan_node(node: &Node, blueprint: &Blueprint, inputs: &IndexMap<String, Value>) -> Result<PlannedNode, PlanError> {
    let resolve = |value: &PropertyValue| value.resolve(inputs).map_err(PlanError::MissingInput);

    let mut properties = IndexMap::with_capacity(node.properties.len());
    for (key, value) in &node.properties {
        properties.insert(key.clone(), resolve(value)?);
    }

    let mut operations = IndexMap::with_capacity(node.operations.len());
    for (kind, op) in &node.operations {
        let mut op_inputs = IndexMap::with_capacity(op.inputs.len());
        for (key, value) in &op.inputs {
            op_inputs.insert(key.clone(), resolve(value)?);
        }
        operations.insert(
            *kind,
            ResolvedOperation {
                implementation: op.implementation.clone(),
                inputs: op_inputs,
            },
        );
    }

    let type_hierarchy = blueprint
        .types
        .node_type(&node.node_type)
        .map(|t| t.hierarchy.clone())
        .unwrap_or_else(|| vec![node.node_type.clone()]);

    Ok(PlannedNode {
        name: node.name.clone(),
        node_type: node.node_type.clone(),
        type_hierarchy,
        properties,
        operations,
        relationships: node.relationships.clone(),
    })
}
