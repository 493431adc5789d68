//! The closed set of invariant variants the evaluator understands.
//! `spec.md` §4.5 calls these "example shapes, to be extended per task
//! domain" — the tag determines the parameter type, and the set itself
//! is closed at compile time rather than left open as free-form JSON.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Invariant {
    #[serde(rename = "resource-exists-by-name")]
    ResourceExistsByName {
        id: String,
        qualified_name: String,
    },
    #[serde(rename = "resource-attribute-equals")]
    ResourceAttributeEquals {
        id: String,
        qualified_name: String,
        attribute: String,
        expected: serde_json::Value,
    },
    #[serde(rename = "firewall-rule-allows")]
    FirewallRuleAllows {
        id: String,
        qualified_name: String,
        proto: String,
        port: u16,
    },
    #[serde(rename = "access-binding-grants")]
    AccessBindingGrants {
        id: String,
        qualified_name: String,
        principal: String,
        role: String,
    },
    #[serde(rename = "collection-contains-element")]
    CollectionContainsElement {
        id: String,
        qualified_name: String,
        attribute: String,
        element: serde_json::Value,
    },
}

impl Invariant {
    pub fn id(&self) -> &str {
        match self {
            Invariant::ResourceExistsByName { id, .. }
            | Invariant::ResourceAttributeEquals { id, .. }
            | Invariant::FirewallRuleAllows { id, .. }
            | Invariant::AccessBindingGrants { id, .. }
            | Invariant::CollectionContainsElement { id, .. } => id,
        }
    }
}

/// The caller-supplied document bundled with a Job. Opaque except for
/// `invariants`, whose keys (the `id` field of each `Invariant`) must be
/// unique — enforced by [`TaskSpec::validate`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSpec {
    pub invariants: Vec<Invariant>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskSpecError {
    #[error("duplicate invariant id: {0}")]
    DuplicateInvariantId(String),
}

impl TaskSpec {
    pub fn validate(&self) -> Result<(), TaskSpecError> {
        let mut seen = std::collections::HashSet::new();
        for invariant in &self.invariants {
            if !seen.insert(invariant.id().to_string()) {
                return Err(TaskSpecError::DuplicateInvariantId(
                    invariant.id().to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_invariant_ids() {
        let spec = TaskSpec {
            invariants: vec![
                Invariant::ResourceExistsByName {
                    id: "a".into(),
                    qualified_name: "random_id.x".into(),
                },
                Invariant::ResourceExistsByName {
                    id: "a".into(),
                    qualified_name: "random_id.y".into(),
                },
            ],
            extra: Default::default(),
        };
        assert!(matches!(
            spec.validate(),
            Err(TaskSpecError::DuplicateInvariantId(_))
        ));
    }
}
