//! Converts the IaC tool's `show -json` output into the arena-backed
//! [`StateDocument`] the Invariant Evaluator walks. This is the one
//! place in the guest runner that knows about the IaC tool's own JSON
//! shape; everything downstream only ever sees the arena.

use std::collections::BTreeMap;

use serde::Deserialize;
use validation_common::state::{AttributeValue, StateDocument, StateNode};

use crate::error::{GuestError, Stage};

const STAGE: Stage = Stage::Evaluation;

#[derive(Debug, Deserialize)]
struct ShowOutput {
    values: Option<ValuesRoot>,
}

#[derive(Debug, Deserialize)]
struct ValuesRoot {
    root_module: Module,
}

#[derive(Debug, Deserialize, Default)]
struct Module {
    #[serde(default)]
    resources: Vec<Resource>,
    #[serde(default)]
    child_modules: Vec<Module>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    #[serde(rename = "type")]
    resource_type: String,
    name: String,
    #[serde(default)]
    values: serde_json::Map<String, serde_json::Value>,
}

pub fn parse(bytes: &[u8]) -> Result<StateDocument, GuestError> {
    let parsed: ShowOutput = serde_json::from_slice(bytes)
        .map_err(|e| GuestError::new(STAGE, anyhow::anyhow!("malformed terraform show -json output: {e}")))?;

    let mut doc = StateDocument::new();
    if let Some(values) = parsed.values {
        collect_module(&values.root_module, &mut doc);
    }
    Ok(doc)
}

/// Flattens every resource reachable from `module` (including nested
/// child modules) into the arena as a root node, in the stable order
/// the tool itself reported them, per §4.5 "stable iteration order".
fn collect_module(module: &Module, doc: &mut StateDocument) {
    for resource in &module.resources {
        let attributes: BTreeMap<String, AttributeValue> = resource
            .values
            .iter()
            .map(|(k, v)| (k.clone(), convert(v)))
            .collect();
        let idx = doc.push(StateNode {
            resource_type: resource.resource_type.clone(),
            name: resource.name.clone(),
            attributes,
            children: vec![],
        });
        doc.roots.push(idx);
    }
    for child in &module.child_modules {
        collect_module(child, doc);
    }
}

fn convert(value: &serde_json::Value) -> AttributeValue {
    match value {
        serde_json::Value::Null => AttributeValue::Null,
        serde_json::Value::Bool(b) => AttributeValue::Bool(*b),
        serde_json::Value::Number(n) => AttributeValue::Number(n.as_f64().unwrap_or_default()),
        serde_json::Value::String(s) => AttributeValue::String(s.clone()),
        serde_json::Value::Array(items) => AttributeValue::List(items.iter().map(convert).collect()),
        serde_json::Value::Object(map) => {
            AttributeValue::Map(map.iter().map(|(k, v)| (k.clone(), convert(v))).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_root_and_child_module_resources() {
        let json = serde_json::json!({
            "values": {
                "root_module": {
                    "resources": [
                        {"type": "random_id", "name": "example", "values": {"byte_length": 4}}
                    ],
                    "child_modules": [
                        {
                            "resources": [
                                {"type": "google_compute_instance", "name": "main", "values": {"name": "vm-a"}}
                            ],
                            "child_modules": []
                        }
                    ]
                }
            }
        });
        let doc = parse(json.to_string().as_bytes()).unwrap();
        assert_eq!(doc.len(), 2);
        let names: Vec<String> = doc.roots.iter().map(|idx| doc.qualified_name(*idx).unwrap()).collect();
        assert_eq!(names, vec!["random_id.example", "google_compute_instance.main"]);
    }

    #[test]
    fn missing_values_produces_empty_document() {
        let doc = parse(b"{}").unwrap();
        assert!(doc.is_empty());
    }

    #[test]
    fn malformed_json_is_an_evaluation_stage_error() {
        let err = parse(b"not json").unwrap_err();
        assert_eq!(err.stage, Stage::Evaluation);
    }
}
