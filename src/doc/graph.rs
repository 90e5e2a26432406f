use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::clock::{Lww, OpId};
use super::ops::Op;

const FIELD_TYPE: &str = "type";
const FIELD_POSITION: &str = "position";
const FIELD_SOURCE: &str = "source";
const FIELD_TARGET: &str = "target";

/// A graph node or edge: a bag of LWW fields plus a removal tombstone.
#[derive(Debug, Clone, Default)]
struct Entry {
    fields: BTreeMap<String, Lww<Value>>,
    removed: bool,
}

impl Entry {
    fn write(&mut self, field: &str, value: Value, stamp: OpId) {
        self.fields
            .entry(field.to_string())
            .and_modify(|reg| {
                reg.set(value.clone(), stamp);
            })
            .or_insert_with(|| Lww::new(value, stamp));
    }

    fn read(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).map(|reg| reg.get()).filter(|v| !v.is_null())
    }
}

/// Node and edge maps of a graph document. Different keys never conflict;
/// the same field on the same key resolves by op id; removal is permanent.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<String, Entry>,
    edges: BTreeMap<String, Entry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Set when the node has no usable position; an external layout pass is
    /// expected to place it.
    pub needs_layout: bool,
    pub data: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl Graph {
    /// Applies a graph op. Ops on unknown ids create the entry first so that
    /// out-of-order delivery still converges.
    pub(crate) fn integrate(&mut self, op: &Op) -> Result<(), String> {
        match op {
            Op::PutNode { id, node, fields } => {
                let entry = self.nodes.entry(node.clone()).or_default();
                for (field, value) in fields {
                    entry.write(field, value.clone(), *id);
                }
                Ok(())
            }
            Op::RemoveNode { node, .. } => {
                self.nodes.entry(node.clone()).or_default().removed = true;
                Ok(())
            }
            Op::PutEdge { id, edge, source, target } => {
                let entry = self.edges.entry(edge.clone()).or_default();
                entry.write(FIELD_SOURCE, Value::from(source.as_str()), *id);
                entry.write(FIELD_TARGET, Value::from(target.as_str()), *id);
                Ok(())
            }
            Op::RemoveEdge { edge, .. } => {
                self.edges.entry(edge.clone()).or_default().removed = true;
                Ok(())
            }
            _ => Err("not a graph op".to_string()),
        }
    }

    pub fn node(&self, id: &str) -> Option<NodeView> {
        self.nodes
            .get(id)
            .filter(|e| !e.removed)
            .map(node_view)
    }

    pub fn nodes(&self) -> BTreeMap<String, NodeView> {
        self.nodes
            .iter()
            .filter(|(_, e)| !e.removed)
            .map(|(id, e)| (id.clone(), node_view(e)))
            .collect()
    }

    pub fn edges(&self) -> BTreeMap<String, EdgeView> {
        self.edges
            .iter()
            .filter(|(_, e)| !e.removed)
            .map(|(id, e)| {
                let endpoint = |f: &str| e.read(f).and_then(|v| v.as_str()).map(str::to_string);
                (
                    id.clone(),
                    EdgeView {
                        source: endpoint(FIELD_SOURCE),
                        target: endpoint(FIELD_TARGET),
                    },
                )
            })
            .collect()
    }
}

fn node_view(entry: &Entry) -> NodeView {
    let position = entry.read(FIELD_POSITION).and_then(parse_position);
    let data = entry
        .fields
        .iter()
        .filter(|(k, reg)| k.as_str() != FIELD_TYPE && k.as_str() != FIELD_POSITION && !reg.get().is_null())
        .map(|(k, reg)| (k.clone(), reg.get().clone()))
        .collect();
    NodeView {
        node_type: entry.read(FIELD_TYPE).and_then(|v| v.as_str()).map(str::to_string),
        needs_layout: position.is_none(),
        position,
        data,
    }
}

/// Accepts `{x, y}` with finite numeric coordinates only.
fn parse_position(value: &Value) -> Option<Position> {
    let x = value.get("x")?.as_f64()?;
    let y = value.get("y")?.as_f64()?;
    (x.is_finite() && y.is_finite()).then_some(Position { x, y })
}
