use crate::dsl::{
    BlueprintDocument, InputDecl, NodeTemplateDecl, OperationDecl, RelationshipDecl,
};
use indexmap::IndexMap;
use serde_json::{Value, json};

pub const LIFECYCLE_INTERFACE: &str = "cloudify.interfaces.lifecycle";

/// Programmatic construction of blueprint documents.
pub struct BlueprintBuilder {
    version: String,
    imports: Vec<String>,
    inputs: IndexMap<String, InputDecl>,
    pub nodes: IndexMap<String, NodeTemplateDecl>,
}

impl BlueprintBuilder {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            imports: Vec::new(),
            inputs: IndexMap::new(),
            nodes: IndexMap::new(),
        }
    }

    pub fn import(mut self, reference: &str) -> Self {
        self.imports.push(reference.to_string());
        self
    }

    pub fn input(mut self, name: &str, input_type: &str) -> Self {
        self.inputs.insert(
            name.to_string(),
            InputDecl {
                input_type: Some(input_type.to_string()),
                ..Default::default()
            },
        );
        self
    }

    pub fn input_with_default(mut self, name: &str, input_type: &str, default: impl Into<Value>) -> Self {
        self.inputs.insert(
            name.to_string(),
            InputDecl {
                input_type: Some(input_type.to_string()),
                default: Some(default.into()),
                ..Default::default()
            },
        );
        self
    }

    pub fn node(self, name: &str, node_type: &str) -> NodeBuilder {
        NodeBuilder {
            blueprint_builder: self,
            name: name.to_string(),
            template: NodeTemplateDecl {
                node_type: node_type.to_string(),
                properties: IndexMap::new(),
                interfaces: IndexMap::new(),
                relationships: Vec::new(),
            },
        }
    }

    pub fn build(self) -> BlueprintDocument {
        BlueprintDocument {
            tosca_definitions_version: Some(self.version),
            description: None,
            imports: self.imports,
            inputs: self.inputs,
            node_types: IndexMap::new(),
            relationships: IndexMap::new(),
            node_templates: Some(self.nodes),
        }
    }
}

pub struct NodeBuilder {
    blueprint_builder: BlueprintBuilder,
    name: String,
    template: NodeTemplateDecl,
}

impl NodeBuilder {
    pub fn property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.template.properties.insert(key.to_string(), value.into());
        self
    }

    /// Sets `key: { get_input: input }`.
    pub fn input_ref(mut self, key: &str, input: &str) -> Self {
        self.template
            .properties
            .insert(key.to_string(), json!({ "get_input": input }));
        self
    }

    pub fn lifecycle(mut self, operation: &str, implementation: &str) -> Self {
        self.template
            .interfaces
            .entry(LIFECYCLE_INTERFACE.to_string())
            .or_default()
            .insert(
                operation.to_string(),
                OperationDecl::Implementation(implementation.to_string()),
            );
        self
    }

    pub fn relationship(mut self, relationship_type: &str, target: &str) -> Self {
        self.template.relationships.push(RelationshipDecl {
            relationship_type: relationship_type.to_string(),
            target: target.to_string(),
        });
        self
    }

    pub fn depends_on(self, target: &str) -> Self {
        self.relationship("cloudify.relationships.depends_on", target)
    }

    pub fn contained_in(self, target: &str) -> Self {
        self.relationship("cloudify.relationships.contained_in", target)
    }

    pub fn build(mut self) -> BlueprintBuilder {
        self.blueprint_builder.nodes.insert(self.name, self.template);
        self.blueprint_builder
    }
}
