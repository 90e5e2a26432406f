use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::clock::OpId;

/// A single change to a document. Rich-text ops address nodes by [`OpId`],
/// graph ops address nodes and edges by their application-level string ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Op {
    /// Inserts an element (paragraph, heading, list item...) under `parent`
    /// right after the sibling `after` (`None` = first position).
    InsertElement {
        id: OpId,
        parent: Option<OpId>,
        after: Option<OpId>,
        name: String,
    },
    /// Inserts `text` character by character. The i-th character gets id
    /// `id.offset(i)`.
    InsertText {
        id: OpId,
        parent: Option<OpId>,
        after: Option<OpId>,
        text: String,
    },
    /// Tombstones a rich-text node and its subtree.
    Delete { id: OpId, target: OpId },
    /// Sets (or with `Value::Null` clears) an attribute of a rich-text node.
    SetAttr {
        id: OpId,
        target: OpId,
        key: String,
        value: Value,
    },
    /// Creates the graph node if absent and writes the given fields.
    PutNode {
        id: OpId,
        node: String,
        fields: BTreeMap<String, Value>,
    },
    RemoveNode { id: OpId, node: String },
    /// Creates the edge if absent and writes its endpoints.
    PutEdge {
        id: OpId,
        edge: String,
        source: String,
        target: String,
    },
    RemoveEdge { id: OpId, edge: String },
}

impl Op {
    pub fn id(&self) -> OpId {
        match self {
            Op::InsertElement { id, .. }
            | Op::InsertText { id, .. }
            | Op::Delete { id, .. }
            | Op::SetAttr { id, .. }
            | Op::PutNode { id, .. }
            | Op::RemoveNode { id, .. }
            | Op::PutEdge { id, .. }
            | Op::RemoveEdge { id, .. } => *id,
        }
    }

    /// Number of consecutive counters this op consumes.
    pub fn span(&self) -> u64 {
        match self {
            Op::InsertText { text, .. } => text.chars().count().max(1) as u64,
            _ => 1,
        }
    }

    /// Highest counter covered by this op, `None` on overflow.
    pub fn last_counter(&self) -> Option<u64> {
        self.id().counter.checked_add(self.span() - 1)
    }

    pub fn is_text(&self) -> bool {
        matches!(
            self,
            Op::InsertElement { .. } | Op::InsertText { .. } | Op::Delete { .. } | Op::SetAttr { .. }
        )
    }
}

/// An ordered batch of ops produced by one local edit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub ops: Vec<Op>,
}

impl Delta {
    pub fn new(ops: Vec<Op>) -> Self {
        Self { ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

impl From<Op> for Delta {
    fn from(op: Op) -> Self {
        Delta { ops: vec![op] }
    }
}
