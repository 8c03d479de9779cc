use crate::compiler::registry::{TypeRegistry, TypeRegistryBuilder};
use crate::dsl::{BlueprintDocument, InputDecl, NodeTemplateDecl, OperationDecl};
use crate::error::LoadError;
use crate::runtime::blueprint::{
    Blueprint, Input, InputType, LifecycleOperation, Node, Operation, PropertyValue, Relationship,
    is_lifecycle_interface,
};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CLOUDIFY_TYPES: &str = include_str!("types/cloudify.yaml");
const AWS_PLUGIN_TYPES: &str = include_str!("types/aws-plugin.yaml");

pub const CLOUDIFY_TYPES_URL: &str = "http://www.getcloudify.org/spec/cloudify/3.3/types.yaml";
pub const AWS_PLUGIN_URL: &str = "http://www.getcloudify.org/spec/aws-plugin/1.3.1/plugin.yaml";

/// A located import, ready to be parsed.
#[derive(Debug, Clone)]
pub struct ResolvedImport {
    /// Identity used to import each document only once.
    pub key: String,
    pub content: String,
    /// Directory relative imports inside this document resolve against.
    pub base_dir: Option<PathBuf>,
}

pub trait ImportResolver {
    fn resolve(
        &self,
        reference: &str,
        importer: &str,
        base_dir: Option<&Path>,
    ) -> Result<ResolvedImport, LoadError>;
}

/// Type libraries shipped with the crate, keyed by the URL they stand in for.
pub fn bundled_import(reference: &str) -> Option<&'static str> {
    if !(reference.starts_with("http://") || reference.starts_with("https://")) {
        return None;
    }
    if reference.contains("/spec/cloudify/") && reference.ends_with("/types.yaml") {
        Some(CLOUDIFY_TYPES)
    } else if reference.contains("/spec/aws-plugin/") && reference.ends_with("/plugin.yaml") {
        Some(AWS_PLUGIN_TYPES)
    } else {
        None
    }
}

/// Resolves URLs against the bundled libraries and everything else against
/// the filesystem, relative to the importing document.
#[derive(Debug, Clone, Default)]
pub struct FsImportResolver {
    /// Extra directories searched when a relative import is not found next to
    /// its importer.
    pub search_paths: Vec<PathBuf>,
}

impl ImportResolver for FsImportResolver {
    fn resolve(
        &self,
        reference: &str,
        importer: &str,
        base_dir: Option<&Path>,
    ) -> Result<ResolvedImport, LoadError> {
        if let Some(content) = bundled_import(reference) {
            return Ok(ResolvedImport {
                key: reference.to_string(),
                content: content.to_string(),
                base_dir: None,
            });
        }
        let unresolved = || LoadError::UnresolvedImport {
            reference: reference.to_string(),
            importer: importer.to_string(),
        };
        if reference.contains("://") {
            return Err(unresolved());
        }

        let reference_path = Path::new(reference);
        let candidates = base_dir
            .into_iter()
            .chain(self.search_paths.iter().map(PathBuf::as_path))
            .map(|dir| dir.join(reference_path))
            .chain(std::iter::once(reference_path.to_path_buf()));

        for candidate in candidates {
            if candidate.is_file() {
                let content = fs::read_to_string(&candidate).map_err(|source| LoadError::Io {
                    path: candidate.clone(),
                    source,
                })?;
                let key = candidate
                    .canonicalize()
                    .unwrap_or_else(|_| candidate.clone())
                    .to_string_lossy()
                    .into_owned();
                return Ok(ResolvedImport {
                    key,
                    content,
                    base_dir: candidate.parent().map(Path::to_path_buf),
                });
            }
        }
        Err(unresolved())
    }
}

pub fn load_blueprint_from_yaml(file_path: impl AsRef<Path>) -> Result<Blueprint, LoadError> {
    Loader::new(FsImportResolver::default()).load_file(file_path.as_ref())
}

pub fn load_blueprint_from_str(content: &str, base_dir: Option<&Path>) -> Result<Blueprint, LoadError> {
    Loader::new(FsImportResolver::default()).load_str(content, "<inline>", base_dir)
}

pub struct Loader<R> {
    resolver: R,
}

struct LoadState {
    types: TypeRegistryBuilder,
    inputs: IndexMap<String, (InputDecl, String)>,
    templates: IndexMap<String, NodeTemplateDecl>,
    visited: HashSet<String>,
}

impl<R: ImportResolver> Loader<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    pub fn load_file(&self, path: &Path) -> Result<Blueprint, LoadError> {
        let content = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        // Imports are keyed by canonical path, so the root must be too.
        let path = path.canonicalize().map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().map(Path::to_path_buf);
        self.load_str(&content, &path.to_string_lossy(), base_dir.as_deref())
    }

    pub fn load_str(&self, content: &str, origin: &str, base_dir: Option<&Path>) -> Result<Blueprint, LoadError> {
        let document = parse_document(content, origin)?;
        self.load_document(document, origin, base_dir)
    }

    pub fn load_document(
        &self,
        document: BlueprintDocument,
        origin: &str,
        base_dir: Option<&Path>,
    ) -> Result<Blueprint, LoadError> {
        let dsl_version = document
            .tosca_definitions_version
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| LoadError::schema(format!("{} is missing tosca_definitions_version", origin)))?;
        if document.node_templates.is_none() {
            return Err(LoadError::schema(format!("{} is missing node_templates", origin)));
        }

        let mut state = LoadState {
            types: TypeRegistryBuilder::new(),
            inputs: IndexMap::new(),
            templates: IndexMap::new(),
            visited: HashSet::from([origin.to_string()]),
        };
        let description = document.description.clone();
        let imports = document.imports.clone();
        self.merge_document(document, origin, base_dir, &dsl_version, &mut state)?;

        let types = state.types.finish()?;

        let mut inputs = IndexMap::with_capacity(state.inputs.len());
        for (name, (decl, _)) in state.inputs {
            let input_type = InputType::parse(decl.input_type.as_deref())?;
            inputs.insert(
                name.clone(),
                Input {
                    name,
                    input_type,
                    default: decl.default,
                    description: decl.description,
                },
            );
        }

        let mut nodes = IndexMap::with_capacity(state.templates.len());
        for (name, template) in state.templates {
            let node = build_node(&name, template, &types)?;
            if let Some(missing) = node.input_refs().into_iter().find(|r| !inputs.contains_key(*r)) {
                return Err(LoadError::schema(format!(
                    "node '{}' references undeclared input '{}'",
                    name, missing
                )));
            }
            nodes.insert(name, node);
        }

        Ok(Blueprint {
            dsl_version,
            description,
            imports,
            inputs,
            nodes,
            types,
            base_dir: base_dir.map(Path::to_path_buf),
        })
    }

    fn merge_document(
        &self,
        document: BlueprintDocument,
        origin: &str,
        base_dir: Option<&Path>,
        dsl_version: &str,
        state: &mut LoadState,
    ) -> Result<(), LoadError> {
        for reference in &document.imports {
            let resolved = self.resolver.resolve(reference, origin, base_dir)?;
            if !state.visited.insert(resolved.key.clone()) {
                debug!(import = %resolved.key, "Import already loaded, skipping");
                continue;
            }
            debug!(import = %resolved.key, importer = origin, "Loading import");
            let imported = parse_document(&resolved.content, &resolved.key)?;
            if let Some(version) = &imported.tosca_definitions_version
                && version != dsl_version
            {
                return Err(LoadError::schema(format!(
                    "{} declares DSL version '{}' but the blueprint uses '{}'",
                    resolved.key, version, dsl_version
                )));
            }
            self.merge_document(imported, &resolved.key, resolved.base_dir.as_deref(), dsl_version, state)?;
        }

        for (name, decl) in document.relationships {
            state.types.add_relationship_type(&name, decl, origin)?;
        }
        for (name, decl) in document.node_types {
            state.types.add_node_type(&name, decl, origin)?;
        }
        for (name, decl) in document.inputs {
            match state.inputs.get(&name) {
                Some((existing, _)) if *existing == decl => {}
                Some((_, existing_source)) => {
                    return Err(LoadError::schema(format!(
                        "input '{}' is declared differently in {} and {}",
                        name, existing_source, origin
                    )));
                }
                None => {
                    state.inputs.insert(name, (decl, origin.to_string()));
                }
            }
        }
        for (name, template) in document.node_templates.unwrap_or_default() {
            if state.templates.contains_key(&name) {
                return Err(LoadError::schema(format!(
                    "node template '{}' is defined more than once (again in {})",
                    name, origin
                )));
            }
            state.templates.insert(name, template);
        }
        Ok(())
    }
}

fn parse_document(content: &str, origin: &str) -> Result<BlueprintDocument, LoadError> {
    serde_yaml::from_str(content).map_err(|source| LoadError::Parse {
        origin: origin.to_string(),
        source,
    })
}

fn build_node(name: &str, template: NodeTemplateDecl, types: &TypeRegistry) -> Result<Node, LoadError> {
    let type_def = types.node_type(&template.node_type).ok_or_else(|| {
        LoadError::schema(format!(
            "node '{}' has unknown type '{}'",
            name, template.node_type
        ))
    })?;

    let mut raw_properties = template.properties;
    let mut properties = IndexMap::new();
    for (key, schema) in &type_def.properties {
        match raw_properties.shift_remove(key) {
            Some(value) => {
                properties.insert(key.clone(), PropertyValue::parse(value)?);
            }
            None => match &schema.default {
                Some(default) => {
                    properties.insert(key.clone(), PropertyValue::parse(default.clone())?);
                }
                None if schema.required => {
                    return Err(LoadError::schema(format!(
                        "property '{}' of node '{}' is required by type '{}'",
                        key, name, type_def.name
                    )));
                }
                None => {}
            },
        }
    }
    // Properties the type does not declare are passed through untouched.
    for (key, value) in raw_properties {
        properties.insert(key, PropertyValue::parse(value)?);
    }

    let mut declared = type_def.operations.clone();
    for (interface, ops) in template.interfaces {
        if !is_lifecycle_interface(&interface) {
            debug!(node = name, interface = %interface, "Ignoring non-lifecycle interface");
            continue;
        }
        for (op_name, op) in ops {
            match LifecycleOperation::from_name(&op_name) {
                Some(kind) => {
                    declared.insert(kind, op);
                }
                None => warn!(node = name, operation = %op_name, "Unsupported lifecycle operation"),
            }
        }
    }
    let mut operations = IndexMap::with_capacity(declared.len());
    for (kind, decl) in declared {
        let (implementation, raw_inputs) = match decl {
            OperationDecl::Implementation(i) => (i, IndexMap::new()),
            OperationDecl::Detailed { implementation, inputs } => (implementation, inputs),
        };
        let mut inputs = IndexMap::with_capacity(raw_inputs.len());
        for (k, v) in raw_inputs {
            inputs.insert(k, PropertyValue::parse(v)?);
        }
        operations.insert(kind, Operation { implementation, inputs });
    }
    operations.sort_keys();

    let mut relationships = Vec::with_capacity(template.relationships.len());
    for rel in template.relationships {
        let kind = types.relationship_kind(&rel.relationship_type).ok_or_else(|| {
            LoadError::schema(format!(
                "node '{}' uses unknown relationship type '{}'",
                name, rel.relationship_type
            ))
        })?;
        relationships.push(Relationship {
            relationship_type: rel.relationship_type,
            kind,
            target: rel.target,
        });
    }

    Ok(Node {
        name: name.to_string(),
        node_type: template.node_type,
        properties,
        operations,
        relationships,
    })
}
