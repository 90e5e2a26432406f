use serde_json::Value;
use std::collections::BTreeMap;

use super::{DocError, DocState, DocView, Delta, Op, OpId};

/// A local, editable copy of a document.
///
/// Every edit is applied to the local state first and returned as a
/// [`Delta`] to be shipped to the room. Ids are drawn from a Lamport counter
/// that always exceeds anything this replica has seen.
#[derive(Debug, Clone)]
pub struct Replica {
    peer: u64,
    doc: DocState,
}

impl Replica {
    pub fn new(peer: u64) -> Self {
        Self {
            peer,
            doc: DocState::new(),
        }
    }

    pub fn from_snapshot(peer: u64, bytes: &[u8]) -> Result<Self, DocError> {
        Ok(Self {
            peer,
            doc: DocState::from_snapshot(bytes)?,
        })
    }

    pub fn peer(&self) -> u64 {
        self.peer
    }

    pub fn doc(&self) -> &DocState {
        &self.doc
    }

    pub fn view(&self) -> DocView {
        self.doc.view()
    }

    /// Merges a snapshot from the room into local state, keeping local ops,
    /// and returns the local ops the room does not have yet.
    pub fn merge_snapshot(&mut self, bytes: &[u8]) -> Result<Delta, DocError> {
        let remote = DocState::from_snapshot(bytes)?;
        let missing: Vec<Op> = self
            .doc
            .ops()
            .filter(|op| !remote.contains_op(&op.id()))
            .cloned()
            .collect();
        let ops: Vec<Op> = remote.ops().cloned().collect();
        self.doc.apply_ops(&ops);
        Ok(Delta::new(missing))
    }

    pub fn apply_remote(&mut self, delta: &Delta) -> Result<usize, DocError> {
        self.doc.apply_delta(delta)
    }

    fn next_id(&self) -> Result<OpId, DocError> {
        let counter = self.doc.max_counter().checked_add(1).ok_or(DocError::InvalidOp {
            id: OpId::new(self.doc.max_counter(), self.peer),
            reason: "counter exhausted".to_string(),
        })?;
        Ok(OpId::new(counter, self.peer))
    }

    fn commit(&mut self, ops: Vec<Op>) -> Result<Delta, DocError> {
        let delta = Delta::new(ops);
        self.doc.apply_delta(&delta)?;
        Ok(delta)
    }

    /// Resolves a visible index inside `parent` to the origin an insert at
    /// that index attaches to.
    fn origin_at(&self, parent: Option<OpId>, index: usize) -> Result<Option<OpId>, DocError> {
        let visible = self.doc.text().visible_children(parent);
        if index > visible.len() {
            return Err(DocError::OutOfRange {
                index,
                len: visible.len(),
            });
        }
        Ok(index.checked_sub(1).map(|i| visible[i]))
    }

    pub fn insert_text(&mut self, parent: Option<OpId>, index: usize, text: &str) -> Result<Delta, DocError> {
        let after = self.origin_at(parent, index)?;
        let id = self.next_id()?;
        self.commit(vec![Op::InsertText {
            id,
            parent,
            after,
            text: text.to_string(),
        }])
    }

    /// Inserts an element and returns its id alongside the delta.
    pub fn insert_element(
        &mut self,
        parent: Option<OpId>,
        index: usize,
        name: &str,
    ) -> Result<(OpId, Delta), DocError> {
        let after = self.origin_at(parent, index)?;
        let id = self.next_id()?;
        let delta = self.commit(vec![Op::InsertElement {
            id,
            parent,
            after,
            name: name.to_string(),
        }])?;
        Ok((id, delta))
    }

    /// Deletes `len` visible nodes starting at `index`.
    pub fn delete(&mut self, parent: Option<OpId>, index: usize, len: usize) -> Result<Delta, DocError> {
        let visible = self.doc.text().visible_children(parent);
        let end = index.checked_add(len).filter(|end| *end <= visible.len()).ok_or(DocError::OutOfRange {
            index: index.saturating_add(len),
            len: visible.len(),
        })?;
        let base = self.next_id()?;
        let ops = visible[index..end]
            .iter()
            .enumerate()
            .map(|(i, target)| {
                base.offset(i as u64)
                    .map(|id| Op::Delete { id, target: *target })
                    .ok_or(DocError::InvalidOp {
                        id: base,
                        reason: "counter overflow".to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.commit(ops)
    }

    pub fn set_attr(&mut self, target: OpId, key: &str, value: Value) -> Result<Delta, DocError> {
        let id = self.next_id()?;
        self.commit(vec![Op::SetAttr {
            id,
            target,
            key: key.to_string(),
            value,
        }])
    }

    pub fn put_node(&mut self, node: &str, fields: BTreeMap<String, Value>) -> Result<Delta, DocError> {
        let id = self.next_id()?;
        self.commit(vec![Op::PutNode {
            id,
            node: node.to_string(),
            fields,
        }])
    }

    pub fn set_node_field(&mut self, node: &str, field: &str, value: Value) -> Result<Delta, DocError> {
        self.put_node(node, BTreeMap::from([(field.to_string(), value)]))
    }

    pub fn remove_node(&mut self, node: &str) -> Result<Delta, DocError> {
        let id = self.next_id()?;
        self.commit(vec![Op::RemoveNode {
            id,
            node: node.to_string(),
        }])
    }

    pub fn put_edge(&mut self, edge: &str, source: &str, target: &str) -> Result<Delta, DocError> {
        let id = self.next_id()?;
        self.commit(vec![Op::PutEdge {
            id,
            edge: edge.to_string(),
            source: source.to_string(),
            target: target.to_string(),
        }])
    }

    pub fn remove_edge(&mut self, edge: &str) -> Result<Delta, DocError> {
        let id = self.next_id()?;
        self.commit(vec![Op::RemoveEdge {
            id,
            edge: edge.to_string(),
        }])
    }
}
