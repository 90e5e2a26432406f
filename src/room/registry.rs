use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

use super::session::Room;
use super::{InitialSnapshot, RoomCommand, RoomConfig, RoomExport, RoomHandle, RoomStats};
use crate::db::PersistenceGateway;
use crate::models::{CollabError, RoomId};
use crate::ws::connctx::Connection;

const JOIN_ATTEMPTS: u32 = 3;

struct Inner {
    rooms: RwLock<HashMap<RoomId, RoomHandle>>,
    gateway: Arc<dyn PersistenceGateway>,
    config: RoomConfig,
    next_instance: AtomicU64,
}

/// Process-wide map of live rooms. At most one room exists per id.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, config: RoomConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                rooms: RwLock::new(HashMap::new()),
                gateway,
                config,
                next_instance: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.inner.config
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<RoomId, RoomHandle>> {
        self.inner.rooms.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<RoomId, RoomHandle>> {
        self.inner.rooms.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lookup(&self, room_id: &RoomId) -> Option<RoomHandle> {
        self.read().get(room_id).cloned()
    }

    /// Returns the live room for `room_id`, starting one when there is none.
    /// The new room loads its stored snapshot before serving commands.
    pub fn get_or_create_room(&self, room_id: &RoomId) -> Result<RoomHandle, CollabError> {
        if let Some(handle) = self.lookup(room_id) {
            return Ok(handle);
        }

        let mut rooms = self.write();
        if let Some(handle) = rooms.get(room_id) {
            return Ok(handle.clone());
        }
        let max = self.inner.config.max_rooms;
        if rooms.len() >= max {
            warn!("Refusing room {}: {} rooms already live", room_id, rooms.len());
            return Err(CollabError::CapacityExhausted { max });
        }

        let instance = self.inner.next_instance.fetch_add(1, Ordering::Relaxed);
        let handle = Room::spawn(
            room_id.clone(),
            instance,
            self.clone(),
            self.inner.gateway.clone(),
            self.inner.config.clone(),
        );
        rooms.insert(room_id.clone(), handle.clone());
        info!("Created room {} (instance {}, {} live)", room_id, instance, rooms.len());
        Ok(handle)
    }

    /// Joins `connection` to its room, retrying on a fresh room when the one
    /// found was closing.
    pub async fn join(
        &self,
        room_id: &RoomId,
        connection: Connection,
    ) -> Result<(RoomHandle, InitialSnapshot), CollabError> {
        let mut attempt = 1;
        loop {
            let handle = self.get_or_create_room(room_id)?;
            match handle.join(connection.clone()).await {
                Ok(initial) => return Ok((handle, initial)),
                Err(CollabError::RoomClosed(_)) if attempt < JOIN_ATTEMPTS => {
                    debug!("Room {} closed during join, retrying", room_id);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Schedules an idle check of `room_id` once the grace period elapses.
    pub fn release_room(&self, room_id: &RoomId) {
        let Some(handle) = self.lookup(room_id) else {
            return;
        };
        let grace = self.inner.config.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = handle.send(RoomCommand::EvictIfIdle).await;
        });
    }

    /// Unregisters a room instance if `ready` still holds under the write
    /// lock. Returns whether the instance is no longer registered.
    pub(super) fn remove_if(&self, room_id: &RoomId, instance: u64, ready: impl FnOnce() -> bool) -> bool {
        let mut rooms = self.write();
        match rooms.get(room_id) {
            Some(handle) if handle.instance == instance => {}
            _ => return true,
        }
        if !ready() {
            return false;
        }
        rooms.remove(room_id);
        true
    }

    pub(super) fn remove(&self, room_id: &RoomId, instance: u64) {
        self.remove_if(room_id, instance, || true);
    }

    pub fn room_count(&self) -> usize {
        self.read().len()
    }

    /// Ids of the live rooms, sorted.
    pub fn room_ids(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current view and snapshot of a live room. Rooms are never started
    /// just to be exported.
    pub async fn export(&self, room_id: &RoomId) -> Result<RoomExport, CollabError> {
        let handle = self
            .lookup(room_id)
            .ok_or_else(|| CollabError::RoomNotFound(room_id.to_string()))?;
        handle.export().await
    }

    fn handles(&self) -> Vec<RoomHandle> {
        self.read().values().cloned().collect()
    }

    pub async fn stats(&self) -> Vec<RoomStats> {
        let mut stats = Vec::new();
        for handle in self.handles() {
            if let Ok(room) = handle.stats().await {
                stats.push(room);
            }
        }
        stats
    }

    /// Stores every dirty room. Used on shutdown.
    pub async fn flush_all(&self) {
        for handle in self.handles() {
            if let Err(e) = handle.flush().await {
                error!("Failed to flush room {}: {}", handle.room_id(), e);
            }
        }
    }
}
