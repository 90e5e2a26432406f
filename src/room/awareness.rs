use std::collections::{BTreeMap, HashMap};

use crate::models::AwarenessRecord;
use crate::ws::connctx::ConnectionId;

#[derive(Debug, Clone)]
struct Entry {
    record: AwarenessRecord,
    seq: u64,
}

/// Presence records of one room, one per connection.
///
/// Records are only replaced or removed, never merged, and never persisted.
#[derive(Debug, Default)]
pub struct AwarenessStore {
    records: HashMap<ConnectionId, Entry>,
    seq: u64,
}

impl AwarenessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the record owned by `connection_id`.
    pub fn set(&mut self, connection_id: ConnectionId, record: AwarenessRecord) {
        self.seq += 1;
        self.records.insert(connection_id, Entry { record, seq: self.seq });
    }

    pub fn remove(&mut self, connection_id: &ConnectionId) -> Option<AwarenessRecord> {
        self.records.remove(connection_id).map(|e| e.record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Presence feed as seen by `user_id`: every other user once (their most
    /// recently updated record when they have several connections), sorted by
    /// user id. The viewer's own records never appear.
    pub fn feed_for(&self, user_id: &str) -> Vec<AwarenessRecord> {
        let mut latest: BTreeMap<&str, &Entry> = BTreeMap::new();
        for entry in self.records.values() {
            let uid = entry.record.user_id.as_str();
            if uid == user_id {
                continue;
            }
            let newer = latest.get(uid).map_or(true, |current| entry.seq > current.seq);
            if newer {
                latest.insert(uid, entry);
            }
        }
        latest.into_values().map(|e| e.record.clone()).collect()
    }
}
