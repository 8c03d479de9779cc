use crate::dsl::{NodeTypeDecl, OperationDecl, RelationshipTypeDecl};
use crate::error::LoadError;
use crate::runtime::blueprint::{LifecycleOperation, RelationshipKind, is_lifecycle_interface};
use indexmap::{IndexMap, IndexSet};
use serde_json::Value;

const BUILTIN: &str = "<builtin>";

/// Relationship types every blueprint can use without importing anything.
const BUILTIN_RELATIONSHIPS: &[(&str, Option<&str>)] = &[
    ("cloudify.relationships.depends_on", None),
    ("cloudify.relationships.contained_in", Some("cloudify.relationships.depends_on")),
    ("cloudify.relationships.connected_to", Some("cloudify.relationships.depends_on")),
    ("depends_on", None),
    ("contained_in", Some("depends_on")),
    ("connected_to", Some("depends_on")),
];

#[derive(Debug, Clone, PartialEq)]
pub struct PropertySchema {
    pub default: Option<Value>,
    pub required: bool,
}

/// A node type with its whole ancestry folded in.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTypeDef {
    pub name: String,
    /// Self first, root last.
    pub hierarchy: Vec<String>,
    pub properties: IndexMap<String, PropertySchema>,
    pub operations: IndexMap<LifecycleOperation, OperationDecl>,
    pub source: String,
}

#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    node_types: IndexMap<String, NodeTypeDef>,
    relationship_types: IndexMap<String, Vec<String>>,
}

impl TypeRegistry {
    pub fn node_type(&self, name: &str) -> Option<&NodeTypeDef> {
        self.node_types.get(name)
    }

    pub fn node_type_names(&self) -> impl Iterator<Item = &str> {
        self.node_types.keys().map(String::as_str)
    }

    pub fn is_a(&self, node_type: &str, ancestor: &str) -> bool {
        self.node_types
            .get(node_type)
            .is_some_and(|t| t.hierarchy.iter().any(|h| h == ancestor))
    }

    /// Classifies a relationship type by the closest well-known ancestor.
    pub fn relationship_kind(&self, name: &str) -> Option<RelationshipKind> {
        let hierarchy = self.relationship_types.get(name)?;
        let kind = hierarchy
            .iter()
            .find_map(|t| match t.rsplit('.').next().unwrap_or(t) {
                "contained_in" => Some(RelationshipKind::ContainedIn),
                "connected_to" => Some(RelationshipKind::ConnectedTo),
                "depends_on" => Some(RelationshipKind::DependsOn),
                _ => None,
            })
            .unwrap_or(RelationshipKind::Other);
        Some(kind)
    }
}

/// Collects type declarations from every document, then flattens them once.
pub struct TypeRegistryBuilder {
    node_types: IndexMap<String, (NodeTypeDecl, String)>,
    relationship_types: IndexMap<String, (RelationshipTypeDecl, String)>,
}

impl TypeRegistryBuilder {
    pub fn new() -> Self {
        let mut relationship_types = IndexMap::new();
        for (name, parent) in BUILTIN_RELATIONSHIPS {
            relationship_types.insert(
                name.to_string(),
                (
                    RelationshipTypeDecl {
                        derived_from: parent.map(str::to_string),
                    },
                    BUILTIN.to_string(),
                ),
            );
        }
        Self {
            node_types: IndexMap::new(),
            relationship_types,
        }
    }

    pub fn add_node_type(&mut self, name: &str, decl: NodeTypeDecl, source: &str) -> Result<(), LoadError> {
        register(&mut self.node_types, name, decl, source)
    }

    pub fn add_relationship_type(
        &mut self,
        name: &str,
        decl: RelationshipTypeDecl,
        source: &str,
    ) -> Result<(), LoadError> {
        register(&mut self.relationship_types, name, decl, source)
    }

    pub fn finish(self) -> Result<TypeRegistry, LoadError> {
        let mut node_types = IndexMap::with_capacity(self.node_types.len());
        for name in self.node_types.keys() {
            flatten_node_type(name, &self.node_types, &mut node_types, &mut IndexSet::new())?;
        }
        // Keep declaration order rather than resolution order.
        node_types.sort_by(|a, _, b, _| {
            self.node_types
                .get_index_of(a)
                .cmp(&self.node_types.get_index_of(b))
        });

        let mut relationship_types = IndexMap::with_capacity(self.relationship_types.len());
        for name in self.relationship_types.keys() {
            let mut chain = Vec::new();
            let mut current = Some(name.as_str());
            while let Some(n) = current {
                if chain.iter().any(|c| c == n) {
                    return Err(LoadError::schema(format!(
                        "relationship type '{}' derives from itself",
                        name
                    )));
                }
                let (decl, _) = self.relationship_types.get(n).ok_or_else(|| {
                    LoadError::schema(format!(
                        "relationship type '{}' derives from unknown type '{}'",
                        chain.last().map(String::as_str).unwrap_or(name),
                        n
                    ))
                })?;
                chain.push(n.to_string());
                current = decl.derived_from.as_deref();
            }
            relationship_types.insert(name.clone(), chain);
        }

        Ok(TypeRegistry {
            node_types,
            relationship_types,
        })
    }
}

impl Default for TypeRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn register<D: PartialEq>(
    table: &mut IndexMap<String, (D, String)>,
    name: &str,
    decl: D,
    source: &str,
) -> Result<(), LoadError> {
    match table.get(name) {
        Some((existing, _)) if *existing == decl => Ok(()),
        Some((_, existing_source)) => Err(LoadError::ImportConflict {
            type_name: name.to_string(),
            existing: existing_source.clone(),
            incoming: source.to_string(),
        }),
        None => {
            table.insert(name.to_string(), (decl, source.to_string()));
            Ok(())
        }
    }
}

fn flatten_node_type(
    name: &str,
    raw: &IndexMap<String, (NodeTypeDecl, String)>,
    done: &mut IndexMap<String, NodeTypeDef>,
    visiting: &mut IndexSet<String>,
) -> Result<NodeTypeDef, LoadError> {
    if let Some(def) = done.get(name) {
        return Ok(def.clone());
    }
    if !visiting.insert(name.to_string()) {
        return Err(LoadError::schema(format!(
            "node type inheritance cycle: {} -> {}",
            visiting.iter().cloned().collect::<Vec<_>>().join(" -> "),
            name
        )));
    }
    let (decl, source) = raw
        .get(name)
        .ok_or_else(|| LoadError::schema(format!("unknown node type '{}'", name)))?;

    let mut def = match &decl.derived_from {
        Some(parent) => {
            if !raw.contains_key(parent) {
                return Err(LoadError::schema(format!(
                    "node type '{}' derives from unknown type '{}'",
                    name, parent
                )));
            }
            let mut parent_def = flatten_node_type(parent, raw, done, visiting)?;
            parent_def.hierarchy.insert(0, name.to_string());
            parent_def
        }
        None => NodeTypeDef {
            name: name.to_string(),
            hierarchy: vec![name.to_string()],
            properties: IndexMap::new(),
            operations: IndexMap::new(),
            source: source.clone(),
        },
    };
    def.name = name.to_string();
    def.source = source.clone();

    for (key, prop) in &decl.properties {
        def.properties.insert(
            key.clone(),
            PropertySchema {
                default: prop.default.clone(),
                required: prop.required.unwrap_or(true),
            },
        );
    }
    for (interface, ops) in &decl.interfaces {
        if !is_lifecycle_interface(interface) {
            continue;
        }
        for (op_name, op) in ops {
            if let Some(op_kind) = LifecycleOperation::from_name(op_name) {
                def.operations.insert(op_kind, op.clone());
            }
        }
    }

    visiting.shift_remove(name);
    done.insert(name.to_string(), def.clone());
    Ok(def)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::PropertyDecl;
    use serde_json::json;

    fn decl(parent: Option<&str>, props: &[(&str, Option<Value>)]) -> NodeTypeDecl {
        NodeTypeDecl {
            derived_from: parent.map(str::to_string),
            properties: props
                .iter()
                .map(|(k, d)| {
                    (
                        k.to_string(),
                        PropertyDecl {
                            default: d.clone(),
                            ..Default::default()
                        },
                    )
                })
                .collect(),
            interfaces: IndexMap::new(),
        }
    }

    #[test]
    fn test_flattening_merges_ancestry() {
        let mut builder = TypeRegistryBuilder::new();
        builder
            .add_node_type("Root", decl(None, &[("resource_id", Some(json!("")))]), "core")
            .unwrap();
        builder
            .add_node_type("Compute", decl(Some("Root"), &[("ip", Some(json!("")))]), "core")
            .unwrap();
        builder
            .add_node_type("Instance", decl(Some("Compute"), &[("image_id", None)]), "aws")
            .unwrap();
        let registry = builder.finish().unwrap();

        let instance = registry.node_type("Instance").unwrap();
        assert_eq!(instance.hierarchy, vec!["Instance", "Compute", "Root"]);
        assert_eq!(
            instance.properties.keys().collect::<Vec<_>>(),
            vec!["resource_id", "ip", "image_id"]
        );
        assert!(instance.properties["image_id"].required);
        assert!(registry.is_a("Instance", "Root"));
        assert_eq!(
            registry.node_type_names().collect::<Vec<_>>(),
            vec!["Root", "Compute", "Instance"]
        );
    }

    #[test]
    fn test_identical_redefinition_is_accepted() {
        let mut builder = TypeRegistryBuilder::new();
        builder.add_node_type("Root", decl(None, &[]), "a.yaml").unwrap();
        builder.add_node_type("Root", decl(None, &[]), "b.yaml").unwrap();
        let err = builder
            .add_node_type("Root", decl(None, &[("x", None)]), "c.yaml")
            .unwrap_err();
        assert!(matches!(
            err,
            LoadError::ImportConflict { ref existing, ref incoming, .. }
                if existing == "a.yaml" && incoming == "c.yaml"
        ));
    }

    #[test]
    fn test_unknown_parent_and_cycles() {
        let mut builder = TypeRegistryBuilder::new();
        builder.add_node_type("A", decl(Some("Missing"), &[]), "x").unwrap();
        assert!(matches!(builder.finish(), Err(LoadError::Schema(_))));

        let mut builder = TypeRegistryBuilder::new();
        builder.add_node_type("A", decl(Some("B"), &[]), "x").unwrap();
        builder.add_node_type("B", decl(Some("A"), &[]), "x").unwrap();
        let err = builder.finish().unwrap_err();
        assert!(err.to_string().contains("inheritance cycle"));
    }

    #[test]
    fn test_relationship_kinds() {
        let mut builder = TypeRegistryBuilder::new();
        builder
            .add_relationship_type(
                "custom.hosted_on",
                RelationshipTypeDecl {
                    derived_from: Some("cloudify.relationships.contained_in".into()),
                },
                "x",
            )
            .unwrap();
        builder
            .add_relationship_type("custom.peer", RelationshipTypeDecl::default(), "x")
            .unwrap();
        let registry = builder.finish().unwrap();

        assert_eq!(
            registry.relationship_kind("custom.hosted_on"),
            Some(RelationshipKind::ContainedIn)
        );
        assert_eq!(
            registry.relationship_kind("cloudify.relationships.connected_to"),
            Some(RelationshipKind::ConnectedTo)
        );
        assert_eq!(registry.relationship_kind("custom.peer"), Some(RelationshipKind::Other));
        assert_eq!(registry.relationship_kind("nope"), None);
    }
}
