pub mod builder;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A blueprint document exactly as it appears in YAML.
///
/// The same shape is used for the root document and for imported type
/// libraries; which keys are mandatory is decided by the loader.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BlueprintDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tosca_definitions_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub inputs: IndexMap<String, InputDecl>,
    #[serde(default)]
    pub node_types: IndexMap<String, NodeTypeDecl>,
    #[serde(default)]
    pub relationships: IndexMap<String, RelationshipTypeDecl>,
    /// `None` when the key is absent, which the root document must not be.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_templates: Option<IndexMap<String, NodeTemplateDecl>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InputDecl {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeTypeDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<String>,
    #[serde(default)]
    pub properties: IndexMap<String, PropertyDecl>,
    #[serde(default)]
    pub interfaces: IndexMap<String, IndexMap<String, OperationDecl>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PropertyDecl {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Defaults to true, as in the Cloudify DSL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelationshipTypeDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<String>,
}

/// An interface operation: either a bare implementation string or a mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OperationDecl {
    Implementation(String),
    Detailed {
        implementation: String,
        #[serde(default)]
        inputs: IndexMap<String, Value>,
    },
}

impl OperationDecl {
    pub fn implementation(&self) -> &str {
        match self {
            Self::Implementation(s) => s,
            Self::Detailed { implementation, .. } => implementation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeTemplateDecl {
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub properties: IndexMap<String, Value>,
    #[serde(default)]
    pub interfaces: IndexMap<String, IndexMap<String, OperationDecl>>,
    #[serde(default)]
    pub relationships: Vec<RelationshipDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationshipDecl {
    #[serde(rename = "type")]
    pub relationship_type: String,
    pub target: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_decl_shapes() {
        let yaml = r#"
cloudify.interfaces.lifecycle:
  start: scripts/start.sh
  configure:
    implementation: scripts/configure.sh
    inputs:
      port: 8080
"#;
        let parsed: IndexMap<String, IndexMap<String, OperationDecl>> =
            serde_yaml::from_str(yaml).unwrap();
        let ops = &parsed["cloudify.interfaces.lifecycle"];
        assert_eq!(ops["start"], OperationDecl::Implementation("scripts/start.sh".into()));
        assert_eq!(ops["configure"].implementation(), "scripts/configure.sh");
    }

    #[test]
    fn test_missing_node_templates_is_none() {
        let doc: BlueprintDocument =
            serde_yaml::from_str("tosca_definitions_version: cloudify_dsl_1_2\n").unwrap();
        assert!(doc.node_templates.is_none());
        assert!(doc.imports.is_empty());
    }
}
