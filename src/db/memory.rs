use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::{GatewayError, PersistenceGateway};
use crate::models::RoomId;

/// In-process gateway. Used when no data directory is configured, and by
/// tests, which can inject failures and delays.
#[derive(Default)]
pub struct MemoryGateway {
    snapshots: Mutex<HashMap<RoomId, Vec<u8>>>,
    loads: AtomicUsize,
    stores: AtomicUsize,
    failing_loads: AtomicU32,
    failing_stores: AtomicU32,
    store_delay: Mutex<Duration>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Consumes one pending injected failure, if any.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, room_id: &RoomId, snapshot: Vec<u8>) {
        lock(&self.snapshots).insert(room_id.clone(), snapshot);
    }

    pub fn get(&self, room_id: &RoomId) -> Option<Vec<u8>> {
        lock(&self.snapshots).get(room_id).cloned()
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    pub fn fail_next_loads(&self, n: u32) {
        self.failing_loads.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_stores(&self, n: u32) {
        self.failing_stores.store(n, Ordering::SeqCst);
    }

    pub fn set_store_delay(&self, delay: Duration) {
        *lock(&self.store_delay) = delay;
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn load(&self, room_id: &RoomId) -> Result<Option<Vec<u8>>, GatewayError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_loads) {
            return Err(GatewayError::Unavailable("injected load failure".to_string()));
        }
        Ok(self.get(room_id))
    }

    async fn store(&self, room_id: &RoomId, snapshot: Vec<u8>) -> Result<(), GatewayError> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.store_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if take_failure(&self.failing_stores) {
            return Err(GatewayError::Unavailable("injected store failure".to_string()));
        }
        debug!("Stored {} bytes for room {}", snapshot.len(), room_id);
        self.insert(room_id, snapshot);
        Ok(())
    }
}
