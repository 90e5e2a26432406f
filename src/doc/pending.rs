use std::collections::BTreeMap;

use super::clock::OpId;
use super::ops::Op;

/// Counter ranges claimed by rich-text inserts, per peer.
#[derive(Debug, Clone, Default)]
pub(crate) struct Claims {
    /// (peer, first counter) -> span. Ranges never overlap.
    ranges: BTreeMap<(u64, u64), u64>,
}

fn insert_range(op: &Op) -> Option<(u64, u64, u64)> {
    match op {
        Op::InsertElement { id, .. } | Op::InsertText { id, .. } => Some((id.peer, id.counter, op.span())),
        _ => None,
    }
}

impl Claims {
    /// Whether any id `op` would allocate is already claimed.
    pub(crate) fn overlaps(&self, op: &Op) -> bool {
        let Some((peer, start, span)) = insert_range(op) else {
            return false;
        };
        let end = start.saturating_add(span);
        self.ranges
            .range((peer, 0)..(peer, end))
            .next_back()
            .is_some_and(|(&(_, first), &len)| first.saturating_add(len) > start)
    }

    pub(crate) fn claim(&mut self, op: &Op) {
        if self.overlaps(op) {
            return;
        }
        if let Some((peer, start, span)) = insert_range(op) {
            self.ranges.insert((peer, start), span);
        }
    }

    fn release(&mut self, op: &Op) {
        if let Some((peer, start, span)) = insert_range(op) {
            if self.ranges.get(&(peer, start)) == Some(&span) {
                self.ranges.remove(&(peer, start));
            }
        }
    }
}

/// Rich-text ops parked until a node they refer to exists, indexed by that
/// node so an integration only looks at the ops it can unblock.
#[derive(Debug, Clone, Default)]
pub(crate) struct Pending {
    by_dependency: BTreeMap<OpId, Vec<Op>>,
    claims: Claims,
    len: usize,
}

impl Pending {
    pub(crate) fn park(&mut self, dependency: OpId, op: Op) {
        self.claims.claim(&op);
        self.by_dependency.entry(dependency).or_default().push(op);
        self.len += 1;
    }

    /// Takes every op waiting on node `id`.
    pub(crate) fn wake(&mut self, id: &OpId) -> Vec<Op> {
        if self.len == 0 {
            return Vec::new();
        }
        let ops = self.by_dependency.remove(id).unwrap_or_default();
        self.len -= ops.len();
        for op in &ops {
            self.claims.release(op);
        }
        ops
    }

    /// Whether `op` would allocate an id a parked insert already claims.
    pub(crate) fn collides(&self, op: &Op) -> bool {
        self.claims.overlaps(op)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Op> {
        self.by_dependency.values().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(counter: u64, peer: u64, text: &str) -> Op {
        Op::InsertText {
            id: OpId::new(counter, peer),
            parent: None,
            after: Some(OpId::new(1, 1)),
            text: text.to_string(),
        }
    }

    #[test]
    fn claims_detect_overlap_per_peer() {
        let mut claims = Claims::default();
        claims.claim(&insert(10, 2, "abc"));

        assert!(claims.overlaps(&insert(12, 2, "x")));
        assert!(claims.overlaps(&insert(8, 2, "xyz")));
        assert!(!claims.overlaps(&insert(13, 2, "x")));
        assert!(!claims.overlaps(&insert(8, 2, "xy")));
        assert!(!claims.overlaps(&insert(11, 3, "x")));
    }

    #[test]
    fn wake_releases_only_the_ops_waiting_on_that_node() {
        let mut pending = Pending::default();
        pending.park(OpId::new(1, 1), insert(10, 2, "ab"));
        pending.park(OpId::new(4, 1), insert(20, 2, "c"));
        assert_eq!(pending.len(), 2);

        let woken = pending.wake(&OpId::new(1, 1));
        assert_eq!(woken, vec![insert(10, 2, "ab")]);
        assert_eq!(pending.len(), 1);
        assert!(!pending.collides(&insert(11, 2, "x")));
        assert!(pending.collides(&insert(20, 2, "x")));
        assert!(pending.wake(&OpId::new(9, 9)).is_empty());
    }
}
