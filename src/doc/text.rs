use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use super::clock::{Lww, OpId};
use super::ops::Op;

// Prevent stack overflow on hostile nesting
const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone)]
enum Content {
    Element(String),
    Char(char),
}

#[derive(Debug, Clone)]
struct TextNode {
    parent: Option<OpId>,
    content: Content,
    attrs: BTreeMap<String, Lww<Value>>,
    deleted: bool,
}

/// Ordered tree of rich-text nodes (RGA per container).
///
/// Every container (the root, or an element) keeps its children in a single
/// list. A node inserted after origin `o` goes right of `o`, skipping
/// neighbours with a greater id; since ids are Lamport-ordered this yields the
/// same order on every replica regardless of arrival order.
#[derive(Debug, Clone, Default)]
pub struct TextTree {
    nodes: HashMap<OpId, TextNode>,
    children: HashMap<Option<OpId>, Vec<OpId>>,
}

/// Rendered rich-text tree, tombstones removed and adjacent characters with
/// identical attributes merged into runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TextView {
    Element {
        id: OpId,
        name: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        attrs: BTreeMap<String, Value>,
        children: Vec<TextView>,
    },
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        attrs: BTreeMap<String, Value>,
    },
}

impl TextTree {
    pub fn is_deleted(&self, id: &OpId) -> bool {
        self.nodes.get(id).is_some_and(|n| n.deleted)
    }

    /// First node `op` refers to that is not in the tree yet, `None` when the
    /// op can be integrated now.
    pub(crate) fn missing_dependency(&self, op: &Op) -> Option<OpId> {
        let missing = |id: Option<OpId>| id.filter(|id| !self.nodes.contains_key(id));
        match op {
            Op::InsertElement { parent, after, .. } | Op::InsertText { parent, after, .. } => {
                missing(*parent).or_else(|| missing(*after))
            }
            Op::Delete { target, .. } | Op::SetAttr { target, .. } => missing(Some(*target)),
            _ => None,
        }
    }

    /// Checks that none of the ids a fresh insert would allocate are taken.
    pub(crate) fn collides(&self, op: &Op) -> bool {
        match op {
            Op::InsertElement { id, .. } | Op::InsertText { id, .. } => {
                (0..op.span()).any(|i| id.offset(i).is_some_and(|nid| self.nodes.contains_key(&nid)))
            }
            _ => false,
        }
    }

    /// Integrates a ready op. `Err` carries the reason a malformed op is
    /// dropped; dropping depends only on the op and immutable node data, so
    /// every replica drops the same ops.
    pub(crate) fn integrate(&mut self, op: &Op) -> Result<(), String> {
        match op {
            Op::InsertElement { id, parent, after, name } => {
                self.insert_run(*id, *parent, *after, vec![Content::Element(name.clone())])
            }
            Op::InsertText { id, parent, after, text } => {
                self.insert_run(*id, *parent, *after, text.chars().map(Content::Char).collect())
            }
            Op::Delete { target, .. } => {
                let node = self
                    .nodes
                    .get_mut(target)
                    .ok_or_else(|| format!("unknown node {target}"))?;
                node.deleted = true;
                Ok(())
            }
            Op::SetAttr { id, target, key, value } => {
                let node = self
                    .nodes
                    .get_mut(target)
                    .ok_or_else(|| format!("unknown node {target}"))?;
                // Tombstoned nodes keep accepting writes; they just stay hidden.
                node.attrs
                    .entry(key.clone())
                    .and_modify(|reg| {
                        reg.set(value.clone(), *id);
                    })
                    .or_insert_with(|| Lww::new(value.clone(), *id));
                Ok(())
            }
            _ => Err("not a rich-text op".to_string()),
        }
    }

    fn insert_run(
        &mut self,
        id: OpId,
        parent: Option<OpId>,
        after: Option<OpId>,
        contents: Vec<Content>,
    ) -> Result<(), String> {
        if let Some(p) = parent {
            match self.nodes.get(&p) {
                Some(TextNode { content: Content::Element(_), .. }) => {}
                Some(_) => return Err(format!("parent {p} is not an element")),
                None => return Err(format!("unknown parent {p}")),
            }
            if id <= p {
                return Err(format!("{id} does not follow its parent {p}"));
            }
        }
        if let Some(a) = after {
            let origin = self.nodes.get(&a).ok_or_else(|| format!("unknown origin {a}"))?;
            if origin.parent != parent {
                return Err(format!("origin {a} lives in another container"));
            }
            if id <= a {
                return Err(format!("{id} does not follow its origin {a}"));
            }
        }

        let mut ids = Vec::with_capacity(contents.len());
        for i in 0..contents.len() as u64 {
            let nid = id.offset(i).ok_or_else(|| format!("counter overflow in {id}"))?;
            if self.nodes.contains_key(&nid) {
                return Err(format!("duplicate node id {nid}"));
            }
            ids.push(nid);
        }

        let mut anchor = after;
        for (nid, content) in ids.into_iter().zip(contents) {
            self.place(parent, anchor, nid);
            self.nodes.insert(
                nid,
                TextNode {
                    parent,
                    content,
                    attrs: BTreeMap::new(),
                    deleted: false,
                },
            );
            anchor = Some(nid);
        }
        Ok(())
    }

    fn place(&mut self, parent: Option<OpId>, after: Option<OpId>, id: OpId) {
        let siblings = self.children.entry(parent).or_default();
        let mut idx = match after {
            Some(a) => siblings.iter().position(|s| *s == a).map_or(0, |p| p + 1),
            None => 0,
        };
        while idx < siblings.len() && siblings[idx] > id {
            idx += 1;
        }
        siblings.insert(idx, id);
    }

    /// Visible (non-tombstoned) children of a container, in document order.
    pub fn visible_children(&self, parent: Option<OpId>) -> Vec<OpId> {
        self.children
            .get(&parent)
            .map(|ids| {
                ids.iter()
                    .filter(|id| self.nodes.get(id).is_some_and(|n| !n.deleted))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Concatenated visible characters directly under a container.
    pub fn plain_text(&self, parent: Option<OpId>) -> String {
        self.visible_children(parent)
            .iter()
            .filter_map(|id| match self.nodes.get(id).map(|n| &n.content) {
                Some(Content::Char(c)) => Some(*c),
                _ => None,
            })
            .collect()
    }

    pub fn view(&self) -> Vec<TextView> {
        self.view_children(None, 0)
    }

    fn view_children(&self, parent: Option<OpId>, depth: usize) -> Vec<TextView> {
        let mut out: Vec<TextView> = Vec::new();
        if depth >= MAX_DEPTH {
            return out;
        }
        for id in self.visible_children(parent) {
            let Some(node) = self.nodes.get(&id) else { continue };
            let attrs = visible_attrs(&node.attrs);
            match &node.content {
                Content::Element(name) => out.push(TextView::Element {
                    id,
                    name: name.clone(),
                    attrs,
                    children: self.view_children(Some(id), depth + 1),
                }),
                Content::Char(c) => match out.last_mut() {
                    Some(TextView::Text { text, attrs: run_attrs }) if *run_attrs == attrs => text.push(*c),
                    _ => out.push(TextView::Text {
                        text: c.to_string(),
                        attrs,
                    }),
                },
            }
        }
        out
    }
}

fn visible_attrs(attrs: &BTreeMap<String, Lww<Value>>) -> BTreeMap<String, Value> {
    attrs
        .iter()
        .filter(|(_, reg)| !reg.get().is_null())
        .map(|(k, reg)| (k.clone(), reg.get().clone()))
        .collect()
}
