//! Mergeable document state shared by every replica of a room.
//!
//! The document is an operation log. Each op carries a unique [`OpId`];
//! applying an op that was already seen is a no-op, which makes deltas safe
//! to retransmit. Two root containers live side by side: a rich-text tree
//! ([`text::TextTree`]) and a node/edge graph ([`graph::Graph`]).

pub mod clock;
pub mod codec;
pub mod graph;
pub mod ops;
mod pending;
pub mod replica;
pub mod text;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tracing::debug;

pub use clock::{Lww, OpId};
pub use graph::{EdgeView, Graph, NodeView, Position};
pub use ops::{Delta, Op};
pub use replica::Replica;
pub use text::{TextTree, TextView};

use pending::{Claims, Pending};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DocError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unexpected frame kind {0:#04x}")]
    UnexpectedKind(u8),
    #[error("invalid operation {id}: {reason}")]
    InvalidOp { id: OpId, reason: String },
    #[error("index {index} out of range (len {len})")]
    OutOfRange { index: usize, len: usize },
    #[error("encoding failed: {0}")]
    Encode(String),
}

/// Materialized, comparable view of a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocView {
    pub text: Vec<TextView>,
    pub nodes: BTreeMap<String, NodeView>,
    pub edges: BTreeMap<String, EdgeView>,
}

#[derive(Debug, Clone, Default)]
pub struct DocState {
    text: TextTree,
    graph: Graph,
    /// Integrated ops in application (causal) order.
    log: Vec<Op>,
    /// Rich-text ops waiting for their parent, origin or target.
    pending: Pending,
    seen: HashSet<OpId>,
    max_counter: u64,
}

impl DocState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a document by replaying the op log stored in a snapshot.
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self, DocError> {
        let ops = codec::decode_snapshot(bytes)?;
        let mut doc = Self::new();
        doc.apply_ops(&ops);
        Ok(doc)
    }

    /// Full state as snapshot bytes: the integrated log followed by whatever
    /// is still pending.
    pub fn snapshot(&self) -> Result<Vec<u8>, DocError> {
        let ops: Vec<Op> = self.ops().cloned().collect();
        codec::encode_snapshot(&ops)
    }

    /// Checks a delta without touching state. Ops already seen are skipped.
    pub fn validate(&self, delta: &Delta) -> Result<(), DocError> {
        let mut claimed = Claims::default();
        for op in delta.ops.iter().filter(|op| !self.seen.contains(&op.id())) {
            let invalid = |reason: &str| DocError::InvalidOp {
                id: op.id(),
                reason: reason.to_string(),
            };
            if op.last_counter().is_none() {
                return Err(invalid("counter overflow"));
            }
            match op {
                Op::InsertElement { name, .. } if name.is_empty() => return Err(invalid("empty element name")),
                Op::InsertText { text, .. } if text.is_empty() => return Err(invalid("empty text")),
                Op::SetAttr { key, .. } if key.is_empty() => return Err(invalid("empty attribute key")),
                Op::PutNode { node, .. } | Op::RemoveNode { node, .. } if node.is_empty() => {
                    return Err(invalid("empty node id"))
                }
                Op::PutEdge { edge, source, target, .. }
                    if edge.is_empty() || source.is_empty() || target.is_empty() =>
                {
                    return Err(invalid("empty edge id or endpoint"))
                }
                Op::RemoveEdge { edge, .. } if edge.is_empty() => return Err(invalid("empty edge id")),
                _ => {}
            }
            if self.text.collides(op) || self.pending.collides(op) || claimed.overlaps(op) {
                return Err(invalid("node id already in use"));
            }
            claimed.claim(op);
        }
        Ok(())
    }

    /// Validates then merges a delta. Nothing is applied when validation
    /// fails. Returns how many ops were new to this replica.
    pub fn apply_delta(&mut self, delta: &Delta) -> Result<usize, DocError> {
        self.validate(delta)?;
        Ok(self.apply_ops(&delta.ops))
    }

    fn apply_ops(&mut self, ops: &[Op]) -> usize {
        let mut fresh = 0;
        for op in ops {
            let id = op.id();
            if !self.seen.insert(id) {
                continue;
            }
            fresh += 1;
            if let Some(last) = op.last_counter() {
                self.max_counter = self.max_counter.max(last);
            }

            if op.is_text() {
                match self.text.missing_dependency(op) {
                    None => self.integrate_text(op.clone()),
                    Some(dependency) => {
                        debug!("Parking op {} until {} arrives", id, dependency);
                        self.pending.park(dependency, op.clone());
                    }
                }
            } else if let Err(reason) = self.graph.integrate(op) {
                debug!("Dropping op {}: {}", id, reason);
            } else {
                self.log.push(op.clone());
            }
        }
        fresh
    }

    /// Integrates a ready rich-text op, then every parked op it unblocks.
    fn integrate_text(&mut self, op: Op) {
        let mut ready = vec![op];
        while let Some(op) = ready.pop() {
            if let Err(reason) = self.text.integrate(&op) {
                debug!("Dropping op {}: {}", op.id(), reason);
                continue;
            }
            let first = op.id();
            for node in (0..op.span()).filter_map(|i| first.offset(i)) {
                for parked in self.pending.wake(&node) {
                    match self.text.missing_dependency(&parked) {
                        None => ready.push(parked),
                        Some(dependency) => self.pending.park(dependency, parked),
                    }
                }
            }
            self.log.push(op);
        }
    }

    /// Every op held, integrated first, then pending.
    pub fn ops(&self) -> impl Iterator<Item = &Op> {
        self.log.iter().chain(self.pending.iter())
    }

    pub fn contains_op(&self, id: &OpId) -> bool {
        self.seen.contains(id)
    }

    /// Ops held by this document, pending ones included.
    pub fn op_count(&self) -> usize {
        self.log.len() + self.pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn max_counter(&self) -> u64 {
        self.max_counter
    }

    pub fn text(&self) -> &TextTree {
        &self.text
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn view(&self) -> DocView {
        DocView {
            text: self.text.view(),
            nodes: self.graph.nodes(),
            edges: self.graph.edges(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: serde_json::Value) -> BTreeMap<String, serde_json::Value> {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn convergence_in_either_order() {
        let mut base = Replica::new(1);
        base.insert_text(None, 0, "hello").unwrap();
        let snapshot = base.doc().snapshot().unwrap();

        let mut x = Replica::from_snapshot(2, &snapshot).unwrap();
        let mut y = Replica::from_snapshot(3, &snapshot).unwrap();
        let d1 = vec![
            x.insert_text(None, 5, " world").unwrap(),
            x.delete(None, 0, 1).unwrap(),
        ];
        let d2 = vec![
            y.insert_text(None, 5, "!").unwrap(),
            y.put_node("n1", fields(json!({"label": "y"}))).unwrap(),
        ];

        let mut left = DocState::from_snapshot(&snapshot).unwrap();
        let mut right = DocState::from_snapshot(&snapshot).unwrap();
        for d in d1.iter().chain(d2.iter()) {
            left.apply_delta(d).unwrap();
        }
        for d in d2.iter().chain(d1.iter()) {
            right.apply_delta(d).unwrap();
        }

        assert_eq!(left.view(), right.view());
        assert_eq!(left.text().plain_text(None), right.text().plain_text(None));
    }

    #[test]
    fn reapplying_a_delta_is_a_noop() {
        let mut author = Replica::new(7);
        let delta = author.insert_text(None, 0, "abc").unwrap();

        let mut doc = DocState::new();
        assert_eq!(doc.apply_delta(&delta).unwrap(), 1);
        let once = doc.view();
        assert_eq!(doc.apply_delta(&delta).unwrap(), 0);
        assert_eq!(doc.view(), once);
        assert_eq!(doc.op_count(), 1);
    }

    #[test]
    fn snapshot_equals_replay() {
        let mut author = Replica::new(1);
        let mut deltas = vec![author.insert_text(None, 0, "abc").unwrap()];
        deltas.push(author.put_node("n1", fields(json!({"position": {"x": 1, "y": 2}}))).unwrap());
        deltas.push(author.delete(None, 1, 1).unwrap());

        let mut replayed = DocState::new();
        for d in &deltas {
            replayed.apply_delta(d).unwrap();
        }
        let restored = DocState::from_snapshot(&replayed.snapshot().unwrap()).unwrap();
        assert_eq!(restored.view(), replayed.view());
        assert_eq!(restored.text().plain_text(None), "ac");
    }

    #[test]
    fn out_of_order_ops_wait_then_integrate() {
        let mut author = Replica::new(1);
        let first = author.insert_text(None, 0, "ab").unwrap();
        let second = author.insert_text(None, 2, "cd").unwrap();

        let mut doc = DocState::new();
        doc.apply_delta(&second).unwrap();
        assert_eq!(doc.pending_count(), 1);
        assert_eq!(doc.text().plain_text(None), "");

        doc.apply_delta(&first).unwrap();
        assert_eq!(doc.pending_count(), 0);
        assert_eq!(doc.text().plain_text(None), "abcd");
    }

    #[test]
    fn invalid_delta_leaves_state_untouched() {
        let mut author = Replica::new(1);
        let good = author.insert_text(None, 0, "ok").unwrap();
        let mut doc = DocState::new();
        doc.apply_delta(&good).unwrap();
        let before = doc.view();

        let bad = Delta::new(vec![
            Op::PutNode {
                id: OpId::new(10, 2),
                node: "n1".into(),
                fields: BTreeMap::new(),
            },
            Op::InsertText {
                id: OpId::new(11, 2),
                parent: None,
                after: None,
                text: String::new(),
            },
        ]);
        assert!(matches!(doc.apply_delta(&bad), Err(DocError::InvalidOp { .. })));
        assert_eq!(doc.view(), before);
        assert!(!doc.contains_op(&OpId::new(10, 2)));
    }

    #[test]
    fn colliding_ids_are_rejected() {
        let mut doc = DocState::new();
        doc.apply_delta(&Delta::from(Op::InsertText {
            id: OpId::new(1, 1),
            parent: None,
            after: None,
            text: "abc".into(),
        }))
        .unwrap();
        let forged = Delta::from(Op::InsertText {
            id: OpId::new(2, 1),
            parent: None,
            after: None,
            text: "x".into(),
        });
        assert!(doc.apply_delta(&forged).is_err());
    }

    fn insert_after(counter: u64, peer: u64, after: Option<OpId>, text: &str) -> Op {
        Op::InsertText {
            id: OpId::new(counter, peer),
            parent: None,
            after,
            text: text.into(),
        }
    }

    #[test]
    fn parked_inserts_reserve_their_ids() {
        let mut doc = DocState::new();
        doc.apply_delta(&Delta::from(insert_after(5, 2, Some(OpId::new(1, 1)), "abc")))
            .unwrap();
        assert_eq!(doc.pending_count(), 1);

        let overlapping = Delta::from(insert_after(6, 2, Some(OpId::new(2, 1)), "x"));
        assert!(doc.apply_delta(&overlapping).is_err());
        assert_eq!(doc.pending_count(), 1);

        let other_peer = Delta::from(insert_after(6, 3, Some(OpId::new(2, 1)), "x"));
        assert_eq!(doc.apply_delta(&other_peer).unwrap(), 1);
        assert_eq!(doc.pending_count(), 2);
    }

    #[test]
    fn overlapping_inserts_in_one_delta_are_rejected() {
        let mut doc = DocState::new();
        let forged = Delta::new(vec![
            insert_after(1, 1, None, "abc"),
            insert_after(2, 1, None, "x"),
        ]);
        assert!(doc.apply_delta(&forged).is_err());
        assert_eq!(doc.op_count(), 0);
    }

    #[test]
    fn long_chain_delivered_backwards_integrates() {
        let mut author = Replica::new(1);
        let deltas: Vec<Delta> = (0..300)
            .map(|i| {
                let c = char::from(b'a' + (i % 26) as u8);
                author.insert_text(None, i, &c.to_string()).unwrap()
            })
            .collect();

        let mut doc = DocState::new();
        for delta in deltas.iter().rev() {
            doc.apply_delta(delta).unwrap();
        }
        assert_eq!(doc.pending_count(), 0);
        assert_eq!(doc.op_count(), 300);
        assert_eq!(doc.text().plain_text(None), author.doc().text().plain_text(None));
    }
}
