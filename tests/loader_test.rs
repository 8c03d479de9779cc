use cumulus::compiler::loader::{self, AWS_PLUGIN_URL, CLOUDIFY_TYPES_URL, FsImportResolver, Loader};
use cumulus::dsl::builder::BlueprintBuilder;
use cumulus::error::LoadError;
use cumulus::runtime::blueprint::{InputType, LifecycleOperation, PropertyValue, RelationshipKind};
use serde_json::json;
use std::fs;

const EC2_BLUEPRINT: &str = r#"
tosca_definitions_version: cloudify_dsl_1_3
imports:
  - http://www.getcloudify.org/spec/cloudify/3.3/types.yaml
  - http://www.getcloudify.org/spec/aws-plugin/1.3.1/plugin.yaml
inputs:
  image:
    type: string
node_templates:
  vm:
    type: cloudify.aws.nodes.Instance
    properties:
      image_id: { get_input: image }
      instance_type: t2.micro
    interfaces:
      cloudify.interfaces.lifecycle:
        start: scripts/start.sh
"#;

#[test]
fn test_load_yaml_matches_builder() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let dir = temp_dir.path().canonicalize().unwrap();
    let file_path = dir.join("ec2.yaml");
    fs::write(&file_path, EC2_BLUEPRINT).expect("Failed to write temp file");

    let loaded = loader::load_blueprint_from_yaml(&file_path).expect("Failed to load blueprint");

    let document = BlueprintBuilder::new("cloudify_dsl_1_3")
        .import(CLOUDIFY_TYPES_URL)
        .import(AWS_PLUGIN_URL)
        .input("image", "string")
        .node("vm", "cloudify.aws.nodes.Instance")
        .input_ref("image_id", "image")
        .property("instance_type", "t2.micro")
        .lifecycle("start", "scripts/start.sh")
        .build()
        .build();
    let built = Loader::new(FsImportResolver::default())
        .load_document(document, "<builder>", Some(dir.as_path()))
        .expect("Failed to load built document");

    assert_eq!(loaded.dsl_version, "cloudify_dsl_1_3");
    assert_eq!(loaded.inputs, built.inputs);
    assert_eq!(loaded.nodes, built.nodes);
    assert_eq!(loaded.base_dir.as_deref(), Some(dir.as_path()));
}

#[test]
fn test_type_defaults_and_operations_are_merged() {
    let blueprint = loader::load_blueprint_from_str(EC2_BLUEPRINT, None).unwrap();
    let vm = &blueprint.nodes["vm"];

    assert_eq!(vm.properties["image_id"], PropertyValue::InputRef("image".into()));
    assert_eq!(vm.properties["use_external_resource"], PropertyValue::Literal(json!(false)));
    assert_eq!(vm.properties["resource_id"], PropertyValue::Literal(json!("")));
    assert_eq!(vm.properties["os_family"], PropertyValue::Literal(json!("linux")));
    assert!(!vm.properties.contains_key("name"));

    // The template's start script replaces the plugin operation; the others stay.
    assert_eq!(vm.operations[&LifecycleOperation::Start].implementation, "scripts/start.sh");
    assert_eq!(
        vm.operations[&LifecycleOperation::Create].implementation,
        "aws.cloudify_aws.ec2.instance.run_instances"
    );
    assert!(!vm.operations.contains_key(&LifecycleOperation::Configure));

    assert!(blueprint.types.is_a("cloudify.aws.nodes.Instance", "cloudify.nodes.Compute"));
    assert_eq!(blueprint.inputs["image"].input_type, InputType::String);
    assert!(blueprint.inputs["image"].is_required());
}

#[test]
fn test_missing_required_property_is_a_schema_error() {
    let yaml = r#"
tosca_definitions_version: cloudify_dsl_1_3
imports:
  - http://www.getcloudify.org/spec/cloudify/3.3/types.yaml
  - http://www.getcloudify.org/spec/aws-plugin/1.3.1/plugin.yaml
node_templates:
  vm:
    type: cloudify.aws.nodes.Instance
    properties:
      image_id: ami-123
"#;
    match loader::load_blueprint_from_str(yaml, None) {
        Err(LoadError::Schema(msg)) => assert!(msg.contains("instance_type"), "{}", msg),
        other => panic!("expected schema error, got {:?}", other.map(|b| b.nodes.len())),
    }
}

#[test]
fn test_undeclared_input_reference_is_rejected() {
    let yaml = r#"
tosca_definitions_version: cloudify_dsl_1_3
imports:
  - http://www.getcloudify.org/spec/cloudify/3.3/types.yaml
node_templates:
  app:
    type: cloudify.nodes.ApplicationModule
    interfaces:
      cloudify.interfaces.lifecycle:
        configure:
          implementation: scripts/configure.sh
          inputs:
            settings:
              - { get_input: missing }
"#;
    let err = loader::load_blueprint_from_str(yaml, None).unwrap_err();
    assert!(matches!(err, LoadError::Schema(ref m) if m.contains("missing")), "{}", err);
}

#[test]
fn test_structural_errors() {
    let no_version = "node_templates: {}\n";
    assert!(matches!(
        loader::load_blueprint_from_str(no_version, None),
        Err(LoadError::Schema(_))
    ));

    let no_templates = "tosca_definitions_version: cloudify_dsl_1_3\n";
    assert!(matches!(
        loader::load_blueprint_from_str(no_templates, None),
        Err(LoadError::Schema(_))
    ));

    let malformed = "tosca_definitions_version: [unclosed\n";
    assert!(matches!(
        loader::load_blueprint_from_str(malformed, None),
        Err(LoadError::Parse { .. })
    ));

    let unknown_type = r#"
tosca_definitions_version: cloudify_dsl_1_3
node_templates:
  vm:
    type: cloudify.nodes.Compute
"#;
    assert!(matches!(
        loader::load_blueprint_from_str(unknown_type, None),
        Err(LoadError::Schema(ref m)) if m.contains("unknown type")
    ));
}

#[test]
fn test_relative_imports_compose_types() {
    let temp_dir = tempfile::tempdir().unwrap();
    fs::create_dir(temp_dir.path().join("types")).unwrap();
    fs::write(
        temp_dir.path().join("types/app.yaml"),
        r#"
imports:
  - http://www.getcloudify.org/spec/cloudify/3.3/types.yaml
relationships:
  app.relationships.hosted_on:
    derived_from: cloudify.relationships.contained_in
node_types:
  app.nodes.Service:
    derived_from: cloudify.nodes.SoftwareComponent
    properties:
      replicas:
        default: 1
"#,
    )
    .unwrap();
    let root = temp_dir.path().join("blueprint.yaml");
    fs::write(
        &root,
        r#"
tosca_definitions_version: cloudify_dsl_1_3
imports:
  - http://www.getcloudify.org/spec/cloudify/3.3/types.yaml
  - types/app.yaml
node_templates:
  host:
    type: cloudify.nodes.Compute
  svc:
    type: app.nodes.Service
    relationships:
      - type: app.relationships.hosted_on
        target: host
"#,
    )
    .unwrap();

    let blueprint = loader::load_blueprint_from_yaml(&root).unwrap();
    let svc = &blueprint.nodes["svc"];
    assert_eq!(svc.properties["replicas"], PropertyValue::Literal(json!(1)));
    assert_eq!(svc.relationships[0].kind, RelationshipKind::ContainedIn);
    assert_eq!(svc.relationships[0].target, "host");
}

#[test]
fn test_conflicting_type_definitions() {
    let temp_dir = tempfile::tempdir().unwrap();
    let types = |port: u16| {
        format!(
            "node_types:\n  my.nodes.Web:\n    properties:\n      port:\n        default: {}\n",
            port
        )
    };
    fs::write(temp_dir.path().join("a.yaml"), types(80)).unwrap();
    fs::write(temp_dir.path().join("b.yaml"), types(8080)).unwrap();
    fs::write(temp_dir.path().join("c.yaml"), types(80)).unwrap();

    let root = |imports: &str| {
        format!(
            "tosca_definitions_version: cloudify_dsl_1_3\nimports: [{}]\nnode_templates:\n  web:\n    type: my.nodes.Web\n",
            imports
        )
    };

    let err = loader::load_blueprint_from_str(&root("a.yaml, b.yaml"), Some(temp_dir.path())).unwrap_err();
    match err {
        LoadError::ImportConflict { type_name, .. } => assert_eq!(type_name, "my.nodes.Web"),
        other => panic!("expected import conflict, got {}", other),
    }

    // Identical redefinitions are accepted.
    let blueprint = loader::load_blueprint_from_str(&root("a.yaml, c.yaml"), Some(temp_dir.path())).unwrap();
    assert_eq!(blueprint.nodes["web"].properties["port"], PropertyValue::Literal(json!(80)));
}

#[test]
fn test_unresolvable_and_mismatched_imports() {
    let yaml = r#"
tosca_definitions_version: cloudify_dsl_1_3
imports:
  - http://example.com/unknown/plugin.yaml
node_templates: {}
"#;
    assert!(matches!(
        loader::load_blueprint_from_str(yaml, None),
        Err(LoadError::UnresolvedImport { .. })
    ));

    let temp_dir = tempfile::tempdir().unwrap();
    fs::write(
        temp_dir.path().join("old.yaml"),
        "tosca_definitions_version: cloudify_dsl_1_0\nnode_types: {}\n",
    )
    .unwrap();
    let yaml = "tosca_definitions_version: cloudify_dsl_1_3\nimports: [old.yaml]\nnode_templates: {}\n";
    let err = loader::load_blueprint_from_str(yaml, Some(temp_dir.path())).unwrap_err();
    assert!(matches!(err, LoadError::Schema(ref m) if m.contains("cloudify_dsl_1_0")), "{}", err);
}

#[test]
fn test_import_cycle_back_to_root_is_loaded_once() {
    let temp_dir = tempfile::tempdir().unwrap();
    fs::write(
        temp_dir.path().join("types.yaml"),
        "tosca_definitions_version: cloudify_dsl_1_3\nimports: [blueprint.yaml]\nnode_types:\n  my.nodes.Web: {}\n",
    )
    .unwrap();
    let root = temp_dir.path().join("blueprint.yaml");
    fs::write(
        &root,
        "tosca_definitions_version: cloudify_dsl_1_3\nimports: [types.yaml]\nnode_templates:\n  web:\n    type: my.nodes.Web\n",
    )
    .unwrap();

    let blueprint = loader::load_blueprint_from_yaml(&root).unwrap();
    assert_eq!(blueprint.nodes.len(), 1);
    assert_eq!(blueprint.nodes["web"].node_type, "my.nodes.Web");

    // The same file reached through a non-canonical path.
    let indirect = temp_dir.path().join(".").join("blueprint.yaml");
    assert!(loader::load_blueprint_from_yaml(&indirect).is_ok());
}
