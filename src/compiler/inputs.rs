use crate::error::PlanError;
use crate::runtime::blueprint::{Input, InputType};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;

/// Produces the effective value of every declared input: the supplied value
/// when present, otherwise the declared default.
pub fn resolve_inputs(
    declared: &IndexMap<String, Input>,
    supplied: &HashMap<String, Value>,
) -> Result<IndexMap<String, Value>, PlanError> {
    if let Some(unknown) = supplied.keys().find(|k| !declared.contains_key(*k)) {
        return Err(PlanError::UnknownInput(unknown.clone()));
    }

    let mut resolved = IndexMap::with_capacity(declared.len());
    for (name, input) in declared {
        let value = match supplied.get(name) {
            Some(v) => coerce(input.input_type, v.clone()),
            None => input
                .default
                .clone()
                .ok_or_else(|| PlanError::MissingInput(name.clone()))?,
        };
        if !input.input_type.accepts(&value) {
            return Err(PlanError::InputTypeMismatch {
                name: name.clone(),
                expected: input.input_type.to_string(),
                value,
            });
        }
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

/// Command-line values arrive as best-effort JSON, so `--input tag=7` yields a
/// number even for a string input. Scalars are turned back into strings there.
fn coerce(input_type: InputType, value: Value) -> Value {
    match (input_type, value) {
        (InputType::String, Value::Number(n)) => Value::String(n.to_string()),
        (InputType::String, Value::Bool(b)) => Value::String(b.to_string()),
        (_, v) => v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(name: &str, input_type: InputType, default: Option<Value>) -> (String, Input) {
        (
            name.to_string(),
            Input {
                name: name.to_string(),
                input_type,
                default,
                description: None,
            },
        )
    }

    #[test]
    fn test_defaults_and_overrides() {
        let declared: IndexMap<_, _> = [
            input("image", InputType::String, None),
            input("size", InputType::String, Some(json!("t2.micro"))),
        ]
        .into_iter()
        .collect();
        let supplied = HashMap::from([("image".to_string(), json!("centos-7"))]);

        let resolved = resolve_inputs(&declared, &supplied).unwrap();
        assert_eq!(resolved["image"], json!("centos-7"));
        assert_eq!(resolved["size"], json!("t2.micro"));
    }

    #[test]
    fn test_missing_unknown_and_mistyped() {
        let declared: IndexMap<_, _> = [input("count", InputType::Integer, None)].into_iter().collect();

        let err = resolve_inputs(&declared, &HashMap::new()).unwrap_err();
        assert!(matches!(err, PlanError::MissingInput(ref n) if n == "count"));

        let supplied = HashMap::from([("other".to_string(), json!(1))]);
        assert!(matches!(
            resolve_inputs(&declared, &supplied),
            Err(PlanError::UnknownInput(_))
        ));

        let supplied = HashMap::from([("count".to_string(), json!("three"))]);
        assert!(matches!(
            resolve_inputs(&declared, &supplied),
            Err(PlanError::InputTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_string_inputs_accept_scalar_cli_values() {
        let declared: IndexMap<_, _> = [input("tag", InputType::String, None)].into_iter().collect();
        let supplied = HashMap::from([("tag".to_string(), json!(7))]);
        assert_eq!(resolve_inputs(&declared, &supplied).unwrap()["tag"], json!("7"));
    }
}
