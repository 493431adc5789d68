//! The provider state document the Invariant Evaluator walks.
//!
//! Modeled as an arena of nodes addressed by index rather than as a
//! pointer/`Rc` tree, per the design note on cyclic references: matchers
//! operate on `&StateDocument` views and `NodeIndex` handles, never on
//! owned sub-trees, so a provider state file with repeated or circular
//! resource references can never produce an infinite walk by construction
//! (traversal is always driven by the arena's `Vec`, not by following
//! live pointers).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIndex(pub usize);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[AttributeValue]> {
        match self {
            AttributeValue::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateNode {
    pub resource_type: String,
    pub name: String,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub children: Vec<NodeIndex>,
}

/// A provider resource tree, arena-backed. `roots` lists the top-level
/// resource indices; everything else is reachable only via `children`
/// edges, walked in the stable order the `Vec` defines (this is what
/// `spec.md` §4.5 calls "stable iteration order" for first-match
/// tie-breaks).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StateDocument {
    nodes: Vec<StateNode>,
    pub roots: Vec<NodeIndex>,
}

impl StateDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: StateNode) -> NodeIndex {
        let idx = NodeIndex(self.nodes.len());
        self.nodes.push(node);
        idx
    }

    pub fn get(&self, idx: NodeIndex) -> Option<&StateNode> {
        self.nodes.get(idx.0)
    }

    /// A fully-qualified name, the way Terraform addresses resources:
    /// `type.name`.
    pub fn qualified_name(&self, idx: NodeIndex) -> Option<String> {
        self.get(idx)
            .map(|n| format!("{}.{}", n.resource_type, n.name))
    }

    /// Depth-first, stable-order walk over every node reachable from
    /// `roots`, yielding `(NodeIndex, &StateNode)` pairs. A node that
    /// can be reached through more than one path is visited once per
    /// path it's reachable from, bounded by the arena size (no cycle can
    /// cause unbounded recursion because recursion follows `children`
    /// indices into a fixed-size `Vec`, not into a reconstructed graph).
    pub fn walk(&self) -> impl Iterator<Item = (NodeIndex, &StateNode)> {
        let mut stack: Vec<NodeIndex> = self.roots.iter().rev().copied().collect();
        let mut out = Vec::new();
        let mut guard = 0usize;
        let limit = self.nodes.len().saturating_mul(self.nodes.len().max(1)) + 1;
        while let Some(idx) = stack.pop() {
            guard += 1;
            if guard > limit {
                break;
            }
            if let Some(node) = self.get(idx) {
                out.push((idx, node));
                for child in node.children.iter().rev() {
                    stack.push(*child);
                }
            }
        }
        out.into_iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_visits_roots_then_children_in_order() {
        let mut doc = StateDocument::new();
        let child = doc.push(StateNode {
            resource_type: "random_id".into(),
            name: "child".into(),
            attributes: BTreeMap::new(),
            children: vec![],
        });
        let root = doc.push(StateNode {
            resource_type: "random_id".into(),
            name: "root".into(),
            attributes: BTreeMap::new(),
            children: vec![child],
        });
        doc.roots.push(root);

        let names: Vec<String> = doc
            .walk()
            .map(|(idx, _)| doc.qualified_name(idx).unwrap())
            .collect();
        assert_eq!(names, vec!["random_id.root", "random_id.child"]);
    }

    #[test]
    fn walk_does_not_hang_on_a_self_referencing_node() {
        let mut doc = StateDocument::new();
        let idx = doc.push(StateNode {
            resource_type: "cyclic".into(),
            name: "self".into(),
            attributes: BTreeMap::new(),
            children: vec![],
        });
        doc.nodes[idx.0].children.push(idx);
        doc.roots.push(idx);

        let visited: Vec<_> = doc.walk().collect();
        assert!(!visited.is_empty());
    }
}
