use crate::compiler::registry::TypeRegistry;
use crate::error::LoadError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

/// A loaded blueprint with all imports merged in. Immutable once built.
#[derive(Debug, Clone)]
pub struct Blueprint {
    pub dsl_version: String,
    pub description: Option<String>,
    pub imports: Vec<String>,
    pub inputs: IndexMap<String, Input>,
    pub nodes: IndexMap<String, Node>,
    pub types: TypeRegistry,
    /// Directory of the root document; lifecycle scripts resolve against it.
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Input {
    pub name: String,
    pub input_type: InputType,
    pub default: Option<Value>,
    pub description: Option<String>,
}

impl Input {
    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Integer,
    Float,
    Boolean,
    List,
    Dict,
    Any,
}

impl InputType {
    pub fn parse(declared: Option<&str>) -> Result<Self, LoadError> {
        match declared {
            None => Ok(Self::Any),
            Some("string") => Ok(Self::String),
            Some("integer") => Ok(Self::Integer),
            Some("float") => Ok(Self::Float),
            Some("boolean") => Ok(Self::Boolean),
            Some("list") => Ok(Self::List),
            Some("dict") => Ok(Self::Dict),
            Some(other) => Err(LoadError::schema(format!("unknown input type '{}'", other))),
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::List => value.is_array(),
            Self::Dict => value.is_object(),
            Self::Any => true,
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::List => "list",
            Self::Dict => "dict",
            Self::Any => "any",
        };
        f.write_str(s)
    }
}

/// A property value that may defer to a blueprint input.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Literal(Value),
    InputRef(String),
    List(Vec<PropertyValue>),
    Map(IndexMap<String, PropertyValue>),
}

impl PropertyValue {
    /// Classifies a raw YAML value. `{get_input: name}` becomes an `InputRef`.
    pub fn parse(raw: Value) -> Result<Self, LoadError> {
        match raw {
            Value::Object(map) => {
                if map.len() == 1
                    && let Some(target) = map.get("get_input")
                {
                    return match target {
                        Value::String(name) => Ok(Self::InputRef(name.clone())),
                        other => Err(LoadError::schema(format!(
                            "get_input expects an input name, got {}",
                            other
                        ))),
                    };
                }
                let mut out = IndexMap::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k, Self::parse(v)?);
                }
                Ok(Self::Map(out))
            }
            Value::Array(items) => Ok(Self::List(
                items.into_iter().map(Self::parse).collect::<Result<_, _>>()?,
            )),
            scalar => Ok(Self::Literal(scalar)),
        }
    }

    pub fn collect_input_refs<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Literal(_) => {}
            Self::InputRef(name) => out.push(name),
            Self::List(items) => items.iter().for_each(|i| i.collect_input_refs(out)),
            Self::Map(map) => map.values().for_each(|v| v.collect_input_refs(out)),
        }
    }

    /// Substitutes input references. Returns the first unresolved name on failure.
    pub fn resolve(&self, inputs: &IndexMap<String, Value>) -> Result<Value, String> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::InputRef(name) => inputs.get(name).cloned().ok_or_else(|| name.clone()),
            Self::List(items) => Ok(Value::Array(
                items.iter().map(|i| i.resolve(inputs)).collect::<Result<_, _>>()?,
            )),
            Self::Map(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), v.resolve(inputs)?);
                }
                Ok(Value::Object(out))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleOperation {
    Create,
    Configure,
    Start,
    Stop,
    Delete,
}

impl LifecycleOperation {
    pub const INSTALL: [Self; 3] = [Self::Create, Self::Configure, Self::Start];
    pub const UNINSTALL: [Self; 2] = [Self::Stop, Self::Delete];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "create" => Some(Self::Create),
            "configure" => Some(Self::Configure),
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Configure => "configure",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for LifecycleOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interface names whose operations drive the node lifecycle.
pub fn is_lifecycle_interface(name: &str) -> bool {
    name == "lifecycle" || name.ends_with(".lifecycle")
}

/// Script implementations run as subprocesses; anything else (plugin task
/// references such as `aws.cloudify_aws.ec2.instance.create`) belongs to the
/// provider adapter.
pub fn is_script_path(implementation: &str) -> bool {
    implementation.contains('/')
        || [".sh", ".bash", ".py", ".ps1"]
            .iter()
            .any(|ext| implementation.ends_with(ext))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub implementation: String,
    pub inputs: IndexMap<String, PropertyValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    ContainedIn,
    ConnectedTo,
    DependsOn,
    Other,
}

impl RelationshipKind {
    /// Whether the relationship forces the target to be provisioned first.
    pub fn orders(&self) -> bool {
        !matches!(self, Self::Other)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub relationship_type: String,
    pub kind: RelationshipKind,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub node_type: String,
    pub properties: IndexMap<String, PropertyValue>,
    pub operations: IndexMap<LifecycleOperation, Operation>,
    pub relationships: Vec<Relationship>,
}

impl Node {
    pub fn input_refs(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        for value in self.properties.values() {
            value.collect_input_refs(&mut refs);
        }
        for op in self.operations.values() {
            for value in op.inputs.values() {
                value.collect_input_refs(&mut refs);
            }
        }
        refs
    }
}
