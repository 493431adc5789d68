//! The Invariant Evaluator (spec §4.5). Pure and synchronous: no I/O, no
//! network, no filesystem access. Given a [`StateDocument`] and an
//! ordered list of [`Invariant`]s it produces a [`ValidationResult`]
//! whose `score` is `passed / total`, fail-closed when `total == 0`.

use std::panic::{self, AssertUnwindSafe};

use validation_common::invariant::Invariant;
use validation_common::model::{InvariantDetail, ValidationResult};
use validation_common::state::{AttributeValue, NodeIndex, StateDocument};

/// Evaluates every invariant in declared order against `state`.
/// Evaluation never short-circuits: a failing invariant does not stop
/// the remaining invariants from being evaluated, so `detail` always has
/// one entry per invariant.
pub fn evaluate(state: &StateDocument, invariants: &[Invariant], logs_ref: String) -> ValidationResult {
    let detail: Vec<InvariantDetail> = invariants
        .iter()
        .map(|invariant| evaluate_one(state, invariant))
        .collect();
    ValidationResult::from_detail(detail, logs_ref)
}

fn evaluate_one(state: &StateDocument, invariant: &Invariant) -> InvariantDetail {
    let id = invariant.id().to_string();
    let caught = panic::catch_unwind(AssertUnwindSafe(|| match_invariant(state, invariant)));
    match caught {
        Ok(outcome) => InvariantDetail {
            id,
            passed: outcome.passed,
            reason: outcome.reason,
            expected: outcome.expected,
            observed: outcome.observed,
        },
        Err(_) => InvariantDetail {
            id,
            passed: false,
            reason: "exception".to_string(),
            expected: None,
            observed: None,
        },
    }
}

struct Outcome {
    passed: bool,
    reason: String,
    expected: Option<serde_json::Value>,
    observed: Option<serde_json::Value>,
}

impl Outcome {
    fn pass(reason: &str) -> Self {
        Self {
            passed: true,
            reason: reason.to_string(),
            expected: None,
            observed: None,
        }
    }

    fn fail(reason: &str) -> Self {
        Self {
            passed: false,
            reason: reason.to_string(),
            expected: None,
            observed: None,
        }
    }

    fn fail_with(reason: &str, expected: serde_json::Value, observed: serde_json::Value) -> Self {
        Self {
            passed: false,
            reason: reason.to_string(),
            expected: Some(expected),
            observed: Some(observed),
        }
    }
}

fn find_by_qualified_name<'a>(
    state: &'a StateDocument,
    qualified_name: &str,
) -> Option<(NodeIndex, &'a validation_common::state::StateNode)> {
    state
        .walk()
        .find(|(idx, _)| state.qualified_name(*idx).as_deref() == Some(qualified_name))
}

fn attribute_to_json(value: &AttributeValue) -> serde_json::Value {
    match value {
        AttributeValue::Null => serde_json::Value::Null,
        AttributeValue::Bool(b) => serde_json::Value::Bool(*b),
        AttributeValue::Number(n) => serde_json::json!(n),
        AttributeValue::String(s) => serde_json::Value::String(s.clone()),
        AttributeValue::List(items) => {
            serde_json::Value::Array(items.iter().map(attribute_to_json).collect())
        }
        AttributeValue::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), attribute_to_json(v)))
                .collect(),
        ),
    }
}

fn json_equivalent(attr: &AttributeValue, expected: &serde_json::Value) -> bool {
    &attribute_to_json(attr) == expected
}

fn match_invariant(state: &StateDocument, invariant: &Invariant) -> Outcome {
    match invariant {
        Invariant::ResourceExistsByName {
            qualified_name, ..
        } => match find_by_qualified_name(state, qualified_name) {
            Some(_) => Outcome::pass("resource found"),
            None => Outcome::fail_with(
                "resource not found",
                serde_json::Value::String(qualified_name.clone()),
                serde_json::Value::Null,
            ),
        },
        Invariant::ResourceAttributeEquals {
            qualified_name,
            attribute,
            expected,
            ..
        } => match find_by_qualified_name(state, qualified_name) {
            None => Outcome::fail_with(
                "resource not found",
                serde_json::Value::String(qualified_name.clone()),
                serde_json::Value::Null,
            ),
            Some((_, node)) => match node.attributes.get(attribute) {
                None => Outcome::fail_with(
                    "attribute absent",
                    expected.clone(),
                    serde_json::Value::Null,
                ),
                Some(actual) => {
                    if json_equivalent(actual, expected) {
                        Outcome::pass("attribute matches")
                    } else {
                        Outcome::fail_with(
                            "attribute mismatch",
                            expected.clone(),
                            attribute_to_json(actual),
                        )
                    }
                }
            },
        },
        Invariant::FirewallRuleAllows {
            qualified_name,
            proto,
            port,
            ..
        } => match find_by_qualified_name(state, qualified_name) {
            None => Outcome::fail_with(
                "firewall rule not found",
                serde_json::Value::String(qualified_name.clone()),
                serde_json::Value::Null,
            ),
            Some((_, node)) => {
                let allows = node
                    .attributes
                    .get("allowed")
                    .and_then(AttributeValue::as_list)
                    .map(|rules| {
                        rules.iter().any(|rule| rule_allows(rule, proto, *port))
                    })
                    .unwrap_or(false);
                if allows {
                    Outcome::pass("port allowed")
                } else {
                    Outcome::fail_with(
                        "port not allowed",
                        serde_json::json!({"proto": proto, "port": port}),
                        node.attributes
                            .get("allowed")
                            .map(attribute_to_json)
                            .unwrap_or(serde_json::Value::Null),
                    )
                }
            }
        },
        Invariant::AccessBindingGrants {
            qualified_name,
            principal,
            role,
            ..
        } => match find_by_qualified_name(state, qualified_name) {
            None => Outcome::fail_with(
                "binding not found",
                serde_json::Value::String(qualified_name.clone()),
                serde_json::Value::Null,
            ),
            Some((_, node)) => {
                let role_matches = node
                    .attributes
                    .get("role")
                    .and_then(AttributeValue::as_str)
                    .map(|r| r == role)
                    .unwrap_or(false);
                let has_member = node
                    .attributes
                    .get("members")
                    .and_then(AttributeValue::as_list)
                    .map(|members| {
                        members
                            .iter()
                            .any(|m| m.as_str() == Some(principal.as_str()))
                    })
                    .unwrap_or(false);
                if role_matches && has_member {
                    Outcome::pass("binding grants role to principal")
                } else {
                    Outcome::fail_with(
                        "binding does not grant role to principal",
                        serde_json::json!({"principal": principal, "role": role}),
                        serde_json::json!({
                            "role": node.attributes.get("role").map(attribute_to_json),
                            "members": node.attributes.get("members").map(attribute_to_json),
                        }),
                    )
                }
            }
        },
        Invariant::CollectionContainsElement {
            qualified_name,
            attribute,
            element,
            ..
        } => match find_by_qualified_name(state, qualified_name) {
            None => Outcome::fail_with(
                "resource not found",
                serde_json::Value::String(qualified_name.clone()),
                serde_json::Value::Null,
            ),
            Some((_, node)) => match node.attributes.get(attribute).and_then(AttributeValue::as_list) {
                None => Outcome::fail("attribute is not a collection"),
                Some(items) => {
                    if items.iter().any(|item| json_equivalent(item, element)) {
                        Outcome::pass("element present")
                    } else {
                        Outcome::fail_with(
                            "element absent",
                            element.clone(),
                            attribute_to_json(&AttributeValue::List(items.to_vec())),
                        )
                    }
                }
            },
        },
    }
}

fn rule_allows(rule: &AttributeValue, proto: &str, port: u16) -> bool {
    let map = match rule {
        AttributeValue::Map(m) => m,
        _ => return false,
    };
    let proto_matches = map
        .get("proto")
        .and_then(AttributeValue::as_str)
        .map(|p| p.eq_ignore_ascii_case(proto))
        .unwrap_or(false);
    if !proto_matches {
        return false;
    }
    map.get("ports")
        .and_then(AttributeValue::as_list)
        .map(|ports| {
            ports
                .iter()
                .any(|p| p.as_number().map(|n| n as u16) == Some(port))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use validation_common::state::StateNode;

    fn state_with_random_id(name: &str) -> StateDocument {
        let mut doc = StateDocument::new();
        let idx = doc.push(StateNode {
            resource_type: "random_id".to_string(),
            name: name.to_string(),
            attributes: BTreeMap::new(),
            children: vec![],
        });
        doc.roots.push(idx);
        doc
    }

    #[test]
    fn happy_path_resource_exists() {
        let state = state_with_random_id("example");
        let invariants = vec![Invariant::ResourceExistsByName {
            id: "i1".to_string(),
            qualified_name: "random_id.example".to_string(),
        }];
        let result = evaluate(&state, &invariants, "logs/x".to_string());
        assert_eq!(result.passed_invariants, 1);
        assert_eq!(result.total_invariants, 1);
        assert_eq!(result.score, 1.0);
        assert!(matches!(
            result.status,
            validation_common::model::ResultStatus::Pass
        ));
    }

    #[test]
    fn attribute_mismatch_is_reported_with_expected_and_observed() {
        let mut doc = StateDocument::new();
        let mut attrs = BTreeMap::new();
        attrs.insert(
            "name".to_string(),
            AttributeValue::String("vm-a".to_string()),
        );
        let idx = doc.push(StateNode {
            resource_type: "google_compute_instance".to_string(),
            name: "main_0".to_string(),
            attributes: attrs,
            children: vec![],
        });
        doc.roots.push(idx);

        let invariants = vec![Invariant::ResourceAttributeEquals {
            id: "i1".to_string(),
            qualified_name: "google_compute_instance.main_0".to_string(),
            attribute: "name".to_string(),
            expected: serde_json::json!("vm-b"),
        }];
        let result = evaluate(&doc, &invariants, "logs/x".to_string());
        assert_eq!(result.score, 0.0);
        assert_eq!(result.passed_invariants, 0);
        let detail = &result.detail[0];
        assert_eq!(detail.expected, Some(serde_json::json!("vm-b")));
        assert_eq!(detail.observed, Some(serde_json::json!("vm-a")));
    }

    #[test]
    fn zero_invariants_is_fail_closed() {
        let state = StateDocument::new();
        let result = evaluate(&state, &[], "logs/x".to_string());
        assert_eq!(result.score, 0.0);
        assert_eq!(result.total_invariants, 0);
        assert!(matches!(
            result.status,
            validation_common::model::ResultStatus::Fail
        ));
    }

    #[test]
    fn evaluation_does_not_short_circuit_on_first_failure() {
        let state = state_with_random_id("example");
        let invariants = vec![
            Invariant::ResourceExistsByName {
                id: "missing".to_string(),
                qualified_name: "random_id.missing".to_string(),
            },
            Invariant::ResourceExistsByName {
                id: "present".to_string(),
                qualified_name: "random_id.example".to_string(),
            },
        ];
        let result = evaluate(&state, &invariants, "logs/x".to_string());
        assert_eq!(result.total_invariants, 2);
        assert_eq!(result.passed_invariants, 1);
        assert_eq!(result.detail.len(), 2);
    }

    #[test]
    fn firewall_rule_allows_matches_proto_and_port() {
        let mut doc = StateDocument::new();
        let mut attrs = BTreeMap::new();
        let mut rule = BTreeMap::new();
        rule.insert("proto".to_string(), AttributeValue::String("tcp".to_string()));
        rule.insert(
            "ports".to_string(),
            AttributeValue::List(vec![AttributeValue::Number(443.0)]),
        );
        attrs.insert(
            "allowed".to_string(),
            AttributeValue::List(vec![AttributeValue::Map(rule)]),
        );
        let idx = doc.push(StateNode {
            resource_type: "google_compute_firewall".to_string(),
            name: "web".to_string(),
            attributes: attrs,
            children: vec![],
        });
        doc.roots.push(idx);

        let invariants = vec![Invariant::FirewallRuleAllows {
            id: "i1".to_string(),
            qualified_name: "google_compute_firewall.web".to_string(),
            proto: "tcp".to_string(),
            port: 443,
        }];
        let result = evaluate(&doc, &invariants, "logs/x".to_string());
        assert_eq!(result.score, 1.0);
    }
}
