use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{AwarenessStore, InitialSnapshot, Registry, RoomCommand, RoomConfig, RoomExport, RoomHandle, RoomStats};
use crate::db::{self, GatewayError, PersistenceGateway};
use crate::doc::{codec, DocState};
use crate::models::{AwarenessRecord, CollabError, ErrorCode, RoomId, ServerMessage};
use crate::ws::connctx::{Connection, ConnectionId, Outbound};

/// Caps the store backoff at 2^5 - 1 skipped cycles.
const MAX_BACKOFF_SHIFT: u32 = 5;

/// Writes snapshots of one room one at a time, never letting an older
/// snapshot replace a newer one.
#[derive(Clone)]
struct Persister {
    gateway: Arc<dyn PersistenceGateway>,
    room_id: RoomId,
    timeout: Duration,
    written: Arc<Mutex<u64>>,
}

impl Persister {
    /// Returns `false` when a newer version was already written.
    async fn store(&self, snapshot: Vec<u8>, version: u64) -> Result<bool, GatewayError> {
        let mut written = self.written.lock().await;
        if *written >= version {
            return Ok(false);
        }
        db::store_with_timeout(self.gateway.as_ref(), &self.room_id, snapshot, self.timeout).await?;
        *written = version;
        Ok(true)
    }
}

enum Flow {
    Continue,
    Stop,
}

/// The task owning one room's state.
pub(super) struct Room {
    room_id: RoomId,
    instance: u64,
    config: RoomConfig,
    registry: Registry,
    persister: Persister,
    self_tx: mpsc::Sender<RoomCommand>,
    doc: DocState,
    awareness: AwarenessStore,
    connections: HashMap<ConnectionId, Connection>,
    /// Connections whose queue overflowed during the current command.
    stalled: Vec<ConnectionId>,
    /// Bumped on every accepted change.
    version: u64,
    persisted_version: u64,
    last_persisted_at: Option<DateTime<Utc>>,
    stores_in_flight: u32,
    /// A final store is running; eviction is decided when it reports back.
    evicting: bool,
    store_failures: u32,
    skip_cycles: u32,
    idle_since: Option<Instant>,
}

impl Room {
    pub(super) fn spawn(
        room_id: RoomId,
        instance: u64,
        registry: Registry,
        gateway: Arc<dyn PersistenceGateway>,
        config: RoomConfig,
    ) -> RoomHandle {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let room = Room {
            persister: Persister {
                gateway,
                room_id: room_id.clone(),
                timeout: config.gateway_timeout,
                written: Arc::new(Mutex::new(0)),
            },
            room_id: room_id.clone(),
            instance,
            config,
            registry,
            self_tx: tx.clone(),
            doc: DocState::new(),
            awareness: AwarenessStore::new(),
            connections: HashMap::new(),
            stalled: Vec::new(),
            version: 0,
            persisted_version: 0,
            last_persisted_at: None,
            stores_in_flight: 0,
            evicting: false,
            store_failures: 0,
            skip_cycles: 0,
            idle_since: Some(Instant::now()),
        };
        tokio::spawn(room.run(rx));
        RoomHandle { room_id, instance, tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        self.seed().await;
        // A room nobody ends up joining is still evicted.
        self.registry.release_room(&self.room_id);

        let start = Instant::now();
        let mut ping = interval_at(start + self.config.ping_interval, self.config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut persist = interval_at(start + self.config.snapshot_interval, self.config.snapshot_interval);
        persist.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let flow = tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd, &mut rx),
                    None => Flow::Stop,
                },
                _ = ping.tick() => {
                    self.health_check();
                    Flow::Continue
                }
                _ = persist.tick() => {
                    self.persist_cycle();
                    Flow::Continue
                }
            };
            self.reap_stalled();
            if let Flow::Stop = flow {
                break;
            }
        }
        info!("Room {} (instance {}) stopped", self.room_id, self.instance);
    }

    async fn seed(&mut self) {
        let loaded = db::load_with_retry(
            self.persister.gateway.as_ref(),
            &self.room_id,
            self.config.gateway_timeout,
            self.config.load_attempts,
            self.config.load_backoff,
        )
        .await;
        match loaded {
            Ok(Some(bytes)) => match DocState::from_snapshot(&bytes) {
                Ok(doc) => {
                    info!("Loaded room {} ({} ops)", self.room_id, doc.op_count());
                    self.doc = doc;
                }
                Err(e) => error!("Stored snapshot of room {} is unreadable, starting empty: {}", self.room_id, e),
            },
            Ok(None) => info!("No stored snapshot for room {}, starting empty", self.room_id),
            Err(e) => error!("Failed to load room {}, starting empty: {}", self.room_id, e),
        }
    }

    fn handle(&mut self, cmd: RoomCommand, rx: &mut mpsc::Receiver<RoomCommand>) -> Flow {
        match cmd {
            RoomCommand::Join { connection, reply } => {
                let result = self.join(connection);
                let _ = reply.send(result);
            }
            RoomCommand::Delta { connection_id, bytes } => return self.apply_delta(connection_id, bytes, rx),
            RoomCommand::Awareness { connection_id, record } => self.update_awareness(connection_id, record),
            RoomCommand::Pong { connection_id } => {
                if let Some(conn) = self.connections.get_mut(&connection_id) {
                    conn.touch();
                }
            }
            RoomCommand::Leave { connection_id } => {
                if let Some(conn) = self.remove_connection(&connection_id) {
                    conn.close();
                    self.presence_changed(&conn.user_id);
                }
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(self.doc.snapshot().map_err(CollabError::from));
            }
            RoomCommand::Export { reply } => {
                let _ = reply.send(self.export());
            }
            RoomCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            RoomCommand::Flush { reply } => self.flush(reply),
            RoomCommand::EvictIfIdle => return self.evict_if_idle(rx),
            RoomCommand::StoreFinished { version, result, reply } => {
                return self.store_finished(version, result, reply, rx)
            }
        }
        Flow::Continue
    }

    fn join(&mut self, mut connection: Connection) -> Result<InitialSnapshot, CollabError> {
        let snapshot = self.doc.snapshot()?;
        let peers = self.awareness.feed_for(&connection.user_id);

        // Queued here so no relayed delta can overtake the snapshot.
        let queued = connection
            .send(Outbound::Binary(snapshot.clone()))
            .and_then(|_| connection.send_message(&ServerMessage::AwarenessBroadcast { users: peers.clone() }));
        if queued.is_err() {
            self.stalled.push(connection.connection_id);
        }

        connection.touch();
        self.idle_since = None;
        info!(
            "Connection {} (user {}) joined room {} ({} connections)",
            connection.connection_id,
            connection.user_id,
            self.room_id,
            self.connections.len() + 1
        );
        self.connections.insert(connection.connection_id, connection);
        Ok(InitialSnapshot { snapshot, peers })
    }

    fn apply_delta(&mut self, connection_id: ConnectionId, bytes: Vec<u8>, rx: &mut mpsc::Receiver<RoomCommand>) -> Flow {
        match self.connections.get_mut(&connection_id) {
            Some(conn) => conn.touch(),
            None => {
                debug!("Dropping delta from departed connection {}", connection_id);
                return Flow::Continue;
            }
        }

        let delta = match codec::decode_delta(&bytes) {
            Ok(delta) => delta,
            Err(e) => {
                self.reject(connection_id, ErrorCode::CorruptDelta, &e.to_string());
                return Flow::Continue;
            }
        };

        if let Err(e) = self.doc.validate(&delta) {
            self.reject(connection_id, ErrorCode::CorruptDelta, &e.to_string());
            return Flow::Continue;
        }
        let fresh = delta.ops.iter().filter(|op| !self.doc.contains_op(&op.id())).count();
        if self.doc.op_count() + fresh > self.config.max_doc_ops {
            return self.teardown(rx, "document size limit reached");
        }

        match self.doc.apply_delta(&delta) {
            Err(e) => self.reject(connection_id, ErrorCode::CorruptDelta, &e.to_string()),
            Ok(0) => debug!("Delta from {} in room {} was already applied", connection_id, self.room_id),
            Ok(applied) => {
                self.version += 1;
                debug!("Applied {} ops from {} in room {}", applied, connection_id, self.room_id);
                for (id, conn) in &self.connections {
                    if *id != connection_id && conn.send(Outbound::Binary(bytes.clone())).is_err() {
                        self.stalled.push(*id);
                    }
                }
            }
        }
        Flow::Continue
    }

    fn reject(&mut self, connection_id: ConnectionId, code: ErrorCode, message: &str) {
        warn!("Rejected delta from {} in room {}: {}", connection_id, self.room_id, message);
        if let Some(conn) = self.connections.get(&connection_id) {
            if conn.send_message(&ServerMessage::error(code, message)).is_err() {
                self.stalled.push(connection_id);
            }
        }
    }

    fn update_awareness(&mut self, connection_id: ConnectionId, mut record: AwarenessRecord) {
        let Some(conn) = self.connections.get_mut(&connection_id) else {
            debug!("Dropping awareness from departed connection {}", connection_id);
            return;
        };
        conn.touch();
        record.user_id = conn.user_id.clone();
        if record.display_name.is_empty() {
            record.display_name = conn.display_name.clone();
        }
        let user_id = conn.user_id.clone();
        self.awareness.set(connection_id, record);
        self.broadcast_presence(&user_id);
    }

    /// Sends a fresh feed to every connection whose view of presence changed
    /// because of `changed_user`.
    fn broadcast_presence(&mut self, changed_user: &str) {
        for (id, conn) in &self.connections {
            if conn.user_id == changed_user {
                continue;
            }
            let users = self.awareness.feed_for(&conn.user_id);
            if conn.send_message(&ServerMessage::AwarenessBroadcast { users }).is_err() {
                self.stalled.push(*id);
            }
        }
    }

    fn remove_connection(&mut self, connection_id: &ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(connection_id)?;
        self.awareness.remove(connection_id);
        info!(
            "Connection {} left room {} ({} connections)",
            connection_id,
            self.room_id,
            self.connections.len()
        );
        Some(conn)
    }

    fn presence_changed(&mut self, user_id: &str) {
        self.broadcast_presence(user_id);
        if self.connections.is_empty() && self.idle_since.is_none() {
            self.idle_since = Some(Instant::now());
            self.registry.release_room(&self.room_id);
        }
    }

    fn health_check(&mut self) {
        let now = Instant::now();
        let expired: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| now.duration_since(c.last_seen) > self.config.pong_timeout)
            .map(|c| c.connection_id)
            .collect();
        for id in expired {
            if let Some(conn) = self.remove_connection(&id) {
                warn!("Connection {} missed its pong deadline, closing", id);
                conn.close();
                self.presence_changed(&conn.user_id);
            }
        }

        for (id, conn) in &self.connections {
            if conn.send_message(&ServerMessage::Ping).is_err() {
                self.stalled.push(*id);
            }
        }
    }

    /// Drops connections that could not keep up with their queue.
    fn reap_stalled(&mut self) {
        while let Some(id) = self.stalled.pop() {
            if let Some(conn) = self.remove_connection(&id) {
                warn!("Connection {} in room {} is stalled, dropping it", id, self.room_id);
                conn.kill();
                self.presence_changed(&conn.user_id);
            }
        }
    }

    fn is_dirty(&self) -> bool {
        self.version > self.persisted_version
    }

    fn persist_cycle(&mut self) {
        if !self.is_dirty() || self.stores_in_flight > 0 {
            return;
        }
        if self.skip_cycles > 0 {
            self.skip_cycles -= 1;
            debug!("Backing off store of room {} ({} cycles left)", self.room_id, self.skip_cycles);
            return;
        }
        self.spawn_store(None);
    }

    /// Writes the current state off the room task. The outcome comes back as
    /// `StoreFinished`, which also answers `reply`.
    fn spawn_store(&mut self, reply: Option<oneshot::Sender<Result<(), CollabError>>>) -> bool {
        let snapshot = match self.doc.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Failed to encode snapshot of room {}: {}", self.room_id, e);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e.into()));
                }
                return false;
            }
        };

        self.stores_in_flight += 1;
        let persister = self.persister.clone();
        let tx = self.self_tx.clone();
        let version = self.version;
        tokio::spawn(async move {
            let result = persister.store(snapshot, version).await.map(|_| ());
            let _ = tx.send(RoomCommand::StoreFinished { version, result, reply }).await;
        });
        true
    }

    fn store_finished(
        &mut self,
        version: u64,
        result: Result<(), GatewayError>,
        reply: Option<oneshot::Sender<Result<(), CollabError>>>,
        rx: &mut mpsc::Receiver<RoomCommand>,
    ) -> Flow {
        self.stores_in_flight = self.stores_in_flight.saturating_sub(1);
        let outcome = match result {
            Ok(()) => {
                self.mark_persisted(version);
                Ok(())
            }
            Err(e) => {
                self.store_failures += 1;
                self.skip_cycles = (1u32 << (self.store_failures - 1).min(MAX_BACKOFF_SHIFT)) - 1;
                error!(
                    "Store of room {} failed ({} in a row, retrying after {} cycles): {}",
                    self.room_id, self.store_failures, self.skip_cycles, e
                );
                Err(CollabError::from(e))
            }
        };
        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }

        if !self.evicting || self.stores_in_flight > 0 {
            return Flow::Continue;
        }
        self.evicting = false;
        if self.is_dirty() {
            error!("Final store of room {} failed, keeping it open", self.room_id);
            self.registry.release_room(&self.room_id);
            return Flow::Continue;
        }
        self.evict_if_idle(rx)
    }

    fn mark_persisted(&mut self, version: u64) {
        self.persisted_version = self.persisted_version.max(version);
        self.last_persisted_at = Some(Utc::now());
        self.store_failures = 0;
        self.skip_cycles = 0;
        debug!("Persisted room {} at version {}", self.room_id, version);
    }

    fn flush(&mut self, reply: oneshot::Sender<Result<(), CollabError>>) {
        if !self.is_dirty() {
            let _ = reply.send(Ok(()));
            return;
        }
        self.spawn_store(Some(reply));
    }

    /// Evicts the room once it has been empty for the whole grace period.
    /// A dirty room is stored first and re-checked when the store reports
    /// back, so a join arriving meanwhile keeps it open.
    fn evict_if_idle(&mut self, rx: &mut mpsc::Receiver<RoomCommand>) -> Flow {
        if self.evicting || !self.connections.is_empty() {
            return Flow::Continue;
        }
        let Some(since) = self.idle_since else {
            return Flow::Continue;
        };
        if since.elapsed() < self.config.grace {
            // A later release scheduled its own timer.
            return Flow::Continue;
        }

        if self.is_dirty() {
            debug!("Storing room {} before eviction", self.room_id);
            self.evicting = self.spawn_store(None);
            if !self.evicting {
                self.registry.release_room(&self.room_id);
            }
            return Flow::Continue;
        }
        if !self.registry.remove_if(&self.room_id, self.instance, || rx.is_empty()) {
            debug!("Room {} received commands while evicting, staying open", self.room_id);
            self.registry.release_room(&self.room_id);
            return Flow::Continue;
        }
        info!("Evicted room {} after {:?} idle", self.room_id, since.elapsed());
        self.close_queue(rx);
        Flow::Stop
    }

    /// Fatal path: clients are told to reconnect and the state is discarded
    /// without a store.
    fn teardown(&mut self, rx: &mut mpsc::Receiver<RoomCommand>, reason: &str) -> Flow {
        error!("Tearing down room {}: {}", self.room_id, reason);
        let msg = ServerMessage::Reconnect {
            reason: reason.to_string(),
        };
        for conn in self.connections.values() {
            let _ = conn.send_message(&msg);
            conn.close();
        }
        self.connections.clear();
        self.awareness = AwarenessStore::new();
        self.stalled.clear();
        self.registry.remove(&self.room_id, self.instance);
        self.close_queue(rx);
        Flow::Stop
    }

    /// Refuses everything still queued; joiners retry on a fresh room.
    fn close_queue(&self, rx: &mut mpsc::Receiver<RoomCommand>) {
        rx.close();
        while let Ok(cmd) = rx.try_recv() {
            if let RoomCommand::Join { connection, reply } = cmd {
                debug!("Refusing join of {} to closed room {}", connection.connection_id, self.room_id);
                let _ = reply.send(Err(CollabError::RoomClosed(self.room_id.to_string())));
            }
        }
    }

    fn export(&self) -> Result<RoomExport, CollabError> {
        Ok(RoomExport {
            view: self.doc.view(),
            snapshot: self.doc.snapshot()?,
            connections: self.connections.len(),
            last_persisted_at: self.last_persisted_at,
        })
    }

    fn stats(&self) -> RoomStats {
        RoomStats {
            room_id: self.room_id.to_string(),
            connections: self.connections.len(),
            awareness: self.awareness.len(),
            ops: self.doc.op_count(),
            pending_ops: self.doc.pending_count(),
            dirty: self.is_dirty(),
            store_failures: self.store_failures,
            last_persisted_at: self.last_persisted_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryGateway;
    use crate::doc::{Delta, Op, OpId, Replica};
    use crate::models::ErrorMessage;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn room_id() -> RoomId {
        "doc/1".parse().unwrap()
    }

    async fn connect(handle: &RoomHandle, user: &str) -> (ConnectionId, mpsc::Receiver<Outbound>, InitialSnapshot) {
        let (conn, rx) = Connection::new(user, user, 64);
        let id = conn.connection_id;
        let init = handle.join(conn).await.unwrap();
        (id, rx, init)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn texts(frames: &[Outbound]) -> Vec<ServerMessage> {
        frames
            .iter()
            .filter_map(|f| match f {
                Outbound::Text(t) => serde_json::from_str(t).ok(),
                _ => None,
            })
            .collect()
    }

    fn encoded(delta: &Delta) -> Vec<u8> {
        codec::encode_delta(delta).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn join_queues_snapshot_then_presence() {
        let registry = Registry::new(Arc::new(MemoryGateway::new()), RoomConfig::default());
        let handle = registry.get_or_create_room(&room_id()).unwrap();
        let (_, mut rx, init) = connect(&handle, "alice").await;

        let frames = drain(&mut rx);
        assert_eq!(frames[0], Outbound::Binary(init.snapshot.clone()));
        assert_eq!(texts(&frames), vec![ServerMessage::AwarenessBroadcast { users: vec![] }]);
        assert!(DocState::from_snapshot(&init.snapshot).unwrap().view().text.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delta_is_relayed_to_others_only_once() {
        let registry = Registry::new(Arc::new(MemoryGateway::new()), RoomConfig::default());
        let handle = registry.get_or_create_room(&room_id()).unwrap();
        let (alice, mut alice_rx, init) = connect(&handle, "alice").await;
        let (_, mut bob_rx, _) = connect(&handle, "bob").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let mut replica = Replica::from_snapshot(1, &init.snapshot).unwrap();
        let bytes = encoded(&replica.insert_text(None, 0, "hi").unwrap());
        handle.apply_delta(alice, bytes.clone()).await.unwrap();
        handle.apply_delta(alice, bytes.clone()).await.unwrap();
        let stats = handle.stats().await.unwrap();

        assert_eq!(stats.ops, 1);
        assert!(stats.dirty);
        assert_eq!(drain(&mut bob_rx), vec![Outbound::Binary(bytes)]);
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_delta_only_hurts_its_sender() {
        let registry = Registry::new(Arc::new(MemoryGateway::new()), RoomConfig::default());
        let handle = registry.get_or_create_room(&room_id()).unwrap();
        let (alice, mut alice_rx, _) = connect(&handle, "alice").await;
        let (_, mut bob_rx, _) = connect(&handle, "bob").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        handle.apply_delta(alice, vec![codec::MAGIC, 0x01, 0xff]).await.unwrap();
        let stats = handle.stats().await.unwrap();

        assert_eq!(stats.connections, 2);
        assert_eq!(stats.ops, 0);
        match texts(&drain(&mut alice_rx)).as_slice() {
            [ServerMessage::Error(ErrorMessage { code, .. })] => assert_eq!(*code, ErrorCode::CorruptDelta),
            other => panic!("unexpected frames {:?}", other),
        }
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_delta_is_rejected_before_the_size_limit() {
        let config = RoomConfig {
            max_doc_ops: 2,
            ..RoomConfig::default()
        };
        let registry = Registry::new(Arc::new(MemoryGateway::new()), config);
        let handle = registry.get_or_create_room(&room_id()).unwrap();
        let (alice, mut alice_rx, _) = connect(&handle, "alice").await;
        let (_, mut bob_rx, _) = connect(&handle, "bob").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let delta = Delta::new(vec![
            Op::PutNode {
                id: OpId::new(1, 9),
                node: "n1".into(),
                fields: BTreeMap::new(),
            },
            Op::PutNode {
                id: OpId::new(2, 9),
                node: "n2".into(),
                fields: BTreeMap::new(),
            },
            Op::InsertText {
                id: OpId::new(3, 9),
                parent: None,
                after: None,
                text: String::new(),
            },
        ]);
        handle.apply_delta(alice, encoded(&delta)).await.unwrap();
        let stats = handle.stats().await.unwrap();

        assert_eq!(stats.connections, 2);
        assert_eq!(stats.ops, 0);
        assert_eq!(registry.room_count(), 1);
        match texts(&drain(&mut alice_rx)).as_slice() {
            [ServerMessage::Error(ErrorMessage { code, .. })] => assert_eq!(*code, ErrorCode::CorruptDelta),
            other => panic!("unexpected frames {:?}", other),
        }
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_updates_everyone_elses_presence() {
        let registry = Registry::new(Arc::new(MemoryGateway::new()), RoomConfig::default());
        let handle = registry.get_or_create_room(&room_id()).unwrap();
        let (alice, mut alice_rx, _) = connect(&handle, "alice").await;
        let (_, mut bob_rx, _) = connect(&handle, "bob").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let mut record = AwarenessRecord::new("spoofed", "Alice", "#f00");
        record.selected_node_id = Some("n1".into());
        handle.update_awareness(alice, record).await.unwrap();
        handle.stats().await.unwrap();
        match texts(&drain(&mut bob_rx)).as_slice() {
            [ServerMessage::AwarenessBroadcast { users }] => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].user_id, "alice");
                assert_eq!(users[0].selected_node_id.as_deref(), Some("n1"));
            }
            other => panic!("unexpected frames {:?}", other),
        }
        assert!(drain(&mut alice_rx).is_empty());

        handle.leave(alice).await.unwrap();
        handle.stats().await.unwrap();
        assert_eq!(
            texts(&drain(&mut bob_rx)),
            vec![ServerMessage::AwarenessBroadcast { users: vec![] }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_store_is_retried_on_a_later_cycle() {
        let gateway = Arc::new(MemoryGateway::new());
        let registry = Registry::new(gateway.clone(), RoomConfig::default());
        let handle = registry.get_or_create_room(&room_id()).unwrap();
        let (alice, _alice_rx, init) = connect(&handle, "alice").await;
        gateway.fail_next_stores(1);

        let mut replica = Replica::from_snapshot(1, &init.snapshot).unwrap();
        handle
            .apply_delta(alice, encoded(&replica.insert_text(None, 0, "x").unwrap()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        let stats = handle.stats().await.unwrap();
        assert!(stats.dirty);
        assert_eq!(stats.store_failures, 1);
        assert!(gateway.get(&room_id()).is_none());

        tokio::time::sleep(Duration::from_secs(10)).await;
        let stats = handle.stats().await.unwrap();
        assert!(!stats.dirty);
        assert_eq!(stats.store_failures, 0);
        assert!(stats.last_persisted_at.is_some());
        assert_eq!(gateway.get(&room_id()), Some(handle.snapshot().await.unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_room_is_persisted_evicted_and_reloaded() {
        let gateway = Arc::new(MemoryGateway::new());
        let registry = Registry::new(gateway.clone(), RoomConfig::default());
        let handle = registry.get_or_create_room(&room_id()).unwrap();
        let (alice, _alice_rx, init) = connect(&handle, "alice").await;

        let mut replica = Replica::from_snapshot(1, &init.snapshot).unwrap();
        handle
            .apply_delta(alice, encoded(&replica.put_node("n1", BTreeMap::from([("label".to_string(), json!("A"))])).unwrap()))
            .await
            .unwrap();
        handle.leave(alice).await.unwrap();
        handle.stats().await.unwrap();
        assert_eq!(registry.room_count(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(registry.room_count(), 0);
        assert!(matches!(handle.stats().await, Err(CollabError::RoomClosed(_))));

        let reopened = registry.get_or_create_room(&room_id()).unwrap();
        assert_ne!(reopened.instance(), handle.instance());
        let (_, _rx, init) = connect(&reopened, "bob").await;
        let view = DocState::from_snapshot(&init.snapshot).unwrap().view();
        assert_eq!(view, replica.view());
    }

    /// Room with one unsaved edit, left empty at t=0, whose stores take 4s.
    async fn dirty_room_with_slow_store() -> (Arc<MemoryGateway>, Registry, RoomHandle) {
        let gateway = Arc::new(MemoryGateway::new());
        let config = RoomConfig {
            snapshot_interval: Duration::from_secs(3600),
            ..RoomConfig::default()
        };
        let registry = Registry::new(gateway.clone(), config);
        let handle = registry.get_or_create_room(&room_id()).unwrap();
        let (alice, _alice_rx, init) = connect(&handle, "alice").await;

        let mut replica = Replica::from_snapshot(1, &init.snapshot).unwrap();
        handle
            .apply_delta(alice, encoded(&replica.insert_text(None, 0, "x").unwrap()))
            .await
            .unwrap();
        handle.leave(alice).await.unwrap();
        gateway.set_store_delay(Duration::from_secs(4));
        (gateway, registry, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn room_keeps_serving_during_final_store() {
        let (gateway, registry, handle) = dirty_room_with_slow_store().await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        let started = Instant::now();
        let stats = handle.stats().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(stats.dirty);
        assert_eq!(gateway.store_count(), 1);
        assert_eq!(registry.room_count(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(registry.room_count(), 0);
        assert!(gateway.get(&room_id()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn join_during_final_store_keeps_room() {
        let (gateway, registry, handle) = dirty_room_with_slow_store().await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        let started = Instant::now();
        let (_, _bob_rx, init) = connect(&handle, "bob").await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(DocState::from_snapshot(&init.snapshot).unwrap().text().plain_text(None), "x");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(registry.room_count(), 1);
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
        assert!(!stats.dirty);
        assert!(gateway.get(&room_id()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_within_grace_keeps_room() {
        let registry = Registry::new(Arc::new(MemoryGateway::new()), RoomConfig::default());
        let handle = registry.get_or_create_room(&room_id()).unwrap();
        let (alice, _rx, _) = connect(&handle, "alice").await;
        handle.leave(alice).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let (_, _rx2, _) = connect(&handle, "alice").await;
        tokio::time::sleep(Duration::from_secs(25)).await;

        assert_eq!(registry.room_count(), 1);
        assert_eq!(handle.stats().await.unwrap().connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_is_dropped_after_pong_timeout() {
        let registry = Registry::new(Arc::new(MemoryGateway::new()), RoomConfig::default());
        let handle = registry.get_or_create_room(&room_id()).unwrap();
        let (_, mut rx, _) = connect(&handle, "alice").await;
        drain(&mut rx);

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(texts(&drain(&mut rx)), vec![ServerMessage::Ping]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(handle.stats().await.unwrap().connections, 0);
        assert!(drain(&mut rx).contains(&Outbound::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_connection_is_removed_from_peers_presence() {
        let registry = Registry::new(Arc::new(MemoryGateway::new()), RoomConfig::default());
        let handle = registry.get_or_create_room(&room_id()).unwrap();
        let (alice, mut alice_rx, _) = connect(&handle, "alice").await;
        let (bob, mut bob_rx, _) = connect(&handle, "bob").await;
        handle
            .update_awareness(bob, AwarenessRecord::new("bob", "Bob", "#2563eb"))
            .await
            .unwrap();
        handle.stats().await.unwrap();
        match texts(&drain(&mut alice_rx)).as_slice() {
            [.., ServerMessage::AwarenessBroadcast { users }] => assert_eq!(users[0].user_id, "bob"),
            other => panic!("unexpected frames {:?}", other),
        }

        // Only alice answers pings; bob's deadline passes at t=45.
        tokio::time::sleep(Duration::from_secs(16)).await;
        handle.pong(alice).await.unwrap();
        tokio::time::sleep(Duration::from_secs(15)).await;
        handle.pong(alice).await.unwrap();
        tokio::time::sleep(Duration::from_secs(15)).await;

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.awareness, 0);
        assert!(texts(&drain(&mut alice_rx)).contains(&ServerMessage::AwarenessBroadcast { users: vec![] }));
        assert!(drain(&mut bob_rx).contains(&Outbound::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_connection_is_dropped() {
        let registry = Registry::new(Arc::new(MemoryGateway::new()), RoomConfig::default());
        let handle = registry.get_or_create_room(&room_id()).unwrap();
        let (alice, _alice_rx, init) = connect(&handle, "alice").await;
        let (slow, _slow_rx) = Connection::new("bob", "Bob", 2);
        handle.join(slow).await.unwrap();

        let mut replica = Replica::from_snapshot(1, &init.snapshot).unwrap();
        handle
            .apply_delta(alice, encoded(&replica.insert_text(None, 0, "a").unwrap()))
            .await
            .unwrap();
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_document_tears_room_down() {
        let config = RoomConfig {
            max_doc_ops: 2,
            ..RoomConfig::default()
        };
        let gateway = Arc::new(MemoryGateway::new());
        let registry = Registry::new(gateway.clone(), config);
        let handle = registry.get_or_create_room(&room_id()).unwrap();
        let (alice, mut rx, init) = connect(&handle, "alice").await;
        drain(&mut rx);

        let mut replica = Replica::from_snapshot(1, &init.snapshot).unwrap();
        for node in ["n1", "n2", "n3"] {
            let delta = replica.put_node(node, BTreeMap::new()).unwrap();
            handle.apply_delta(alice, encoded(&delta)).await.unwrap();
        }

        assert!(matches!(handle.stats().await, Err(CollabError::RoomClosed(_))));
        assert_eq!(registry.room_count(), 0);
        let frames = drain(&mut rx);
        assert!(texts(&frames)
            .iter()
            .any(|m| matches!(m, ServerMessage::Reconnect { .. })));
        assert_eq!(frames.last(), Some(&Outbound::Close));
        assert_eq!(gateway.store_count(), 0);
    }
}
