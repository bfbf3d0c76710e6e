use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::events::{
    room_topic, ControlMode, Event, InputEvent, Player, PlayerState, Room, TOPIC_PLAYER,
    TOPIC_ROOM,
};
use crate::transport::{PubSub, Subscription, TransportError};

/// Input action whose payload is mirrored into the room state store.
pub const ACTION_STATE_SYNC: &str = "state_sync";

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("player already exists")]
    PlayerExists,
    #[error("local seat already occupied by another player")]
    LocalSeatOccupied,
    #[error("player not found")]
    PlayerNotFound,
    #[error("room not found")]
    RoomNotFound,
    #[error("player already in room")]
    AlreadyInRoom,
    #[error("invalid control mode")]
    InvalidControlMode,
    #[error("input source does not match control mode")]
    ControlModeMismatch,
    #[error("player not in room")]
    PlayerNotInRoom,
    #[error("player is not room member")]
    PlayerNotRoomMember,
    #[error("ping_ms required and must be >= 0")]
    PingNegative,
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Distributed matchmaking and room lifecycle for one node.
///
/// The manager owns the node's single local player, a remote view of
/// other nodes' ready players, the replicated room table, and per-room
/// state snapshots. All of it sits behind one writer lock; the matcher
/// runs under that lock on every observed `player_ready`, so identical
/// ready sets produce identical rooms on every node without any
/// coordination handshake.
#[derive(Clone)]
pub struct RoomManager {
    pubsub: Arc<dyn PubSub>,
    inner: Arc<RwLock<Inner>>,
    seq: Arc<AtomicI64>,
}

#[derive(Default)]
struct Inner {
    players: HashMap<String, Player>,
    remote: HashMap<String, Player>,
    rooms: HashMap<String, Room>,
    states: HashMap<String, HashMap<String, PlayerState>>,
}

impl RoomManager {
    /// Construct a manager and start its replication loops on `pubsub`.
    pub fn new(pubsub: Arc<dyn PubSub>) -> Self {
        let manager = Self {
            pubsub,
            inner: Arc::new(RwLock::new(Inner::default())),
            seq: Arc::new(AtomicI64::new(0)),
        };
        manager.start_sync();
        manager
    }

    fn start_sync(&self) {
        let player_sub = self.pubsub.subscribe(TOPIC_PLAYER);
        let room_sub = self.pubsub.subscribe(TOPIC_ROOM);
        let manager = self.clone();
        tokio::spawn(async move { manager.consume_player_events(player_sub).await });
        let manager = self.clone();
        tokio::spawn(async move { manager.consume_room_events(room_sub).await });
    }

    /// Insert the node's local player. At most one local player may exist.
    pub async fn register_player(
        &self,
        id: &str,
        app_id: &str,
        version: &str,
    ) -> Result<Player, RoomError> {
        let mut inner = self.inner.write().await;
        if inner.players.contains_key(id) {
            return Err(RoomError::PlayerExists);
        }
        if !inner.players.is_empty() {
            return Err(RoomError::LocalSeatOccupied);
        }
        let player = Player {
            id: id.to_string(),
            app_id: app_id.to_string(),
            version: version.to_string(),
            ping_ms: 0,
            ready: false,
            room_id: String::new(),
            control_mode: ControlMode::Human,
            agent_id: String::new(),
            updated_at: Utc::now(),
        };
        inner.players.insert(id.to_string(), player.clone());
        Ok(player)
    }

    /// Create-or-update the local player. Empty `app_id`/`version` leave
    /// the stored values unchanged; changing either while the player is
    /// in a room is rejected.
    pub async fn upsert_player(
        &self,
        id: &str,
        app_id: &str,
        version: &str,
    ) -> Result<Player, RoomError> {
        let mut inner = self.inner.write().await;
        if !inner.players.contains_key(id) && !inner.players.is_empty() {
            return Err(RoomError::LocalSeatOccupied);
        }
        let now = Utc::now();
        let player = inner.players.entry(id.to_string()).or_insert_with(|| Player {
            id: id.to_string(),
            app_id: String::new(),
            version: String::new(),
            ping_ms: 0,
            ready: false,
            room_id: String::new(),
            control_mode: ControlMode::Human,
            agent_id: String::new(),
            updated_at: now,
        });
        if !player.room_id.is_empty()
            && ((!app_id.is_empty() && app_id != player.app_id)
                || (!version.is_empty() && version != player.version))
        {
            return Err(RoomError::AlreadyInRoom);
        }
        if !app_id.is_empty() {
            player.app_id = app_id.to_string();
        }
        if !version.is_empty() {
            player.version = version.to_string();
        }
        player.updated_at = now;
        Ok(player.clone())
    }

    /// Mark the local player ready and run the matcher. Returns the room
    /// only when this call created one; a room formed by the peer node
    /// arrives later through replication.
    pub async fn set_ready(
        &self,
        player_id: &str,
        ping_ms: i64,
    ) -> Result<Option<Room>, RoomError> {
        if ping_ms < 0 {
            return Err(RoomError::PingNegative);
        }
        let mut inner = self.inner.write().await;
        let player = inner
            .players
            .get_mut(player_id)
            .ok_or(RoomError::PlayerNotFound)?;
        if !player.room_id.is_empty() {
            return Err(RoomError::AlreadyInRoom);
        }
        player.ready = true;
        player.ping_ms = ping_ms;
        player.updated_at = Utc::now();
        let snapshot = player.clone();
        let app_id = snapshot.app_id.clone();
        let version = snapshot.version.clone();

        self.publish_best_effort(
            TOPIC_PLAYER,
            &Event::PlayerReady {
                player: snapshot,
                at: Utc::now(),
            },
        );
        Ok(self.try_match(&mut inner, &app_id, &version))
    }

    pub async fn get_player(&self, player_id: &str) -> Result<Player, RoomError> {
        let inner = self.inner.read().await;
        inner
            .players
            .get(player_id)
            .cloned()
            .ok_or(RoomError::PlayerNotFound)
    }

    pub async fn get_room(&self, room_id: &str) -> Result<Room, RoomError> {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(room_id)
            .cloned()
            .ok_or(RoomError::RoomNotFound)
    }

    /// Snapshots for a room, keyed by player. A known room with no
    /// snapshots yet yields an empty map.
    pub async fn get_room_states(
        &self,
        room_id: &str,
    ) -> Result<HashMap<String, PlayerState>, RoomError> {
        let inner = self.inner.read().await;
        if !inner.rooms.contains_key(room_id) {
            return Err(RoomError::RoomNotFound);
        }
        Ok(inner.states.get(room_id).cloned().unwrap_or_default())
    }

    /// Switch who drives a room member's inputs. Switching to `agent`
    /// requires a non-empty `agent_id`; switching back to `human` clears
    /// it. Same-mode switches are allowed and still announced.
    pub async fn toggle_control(
        &self,
        room_id: &str,
        player_id: &str,
        to_mode: &str,
        agent_id: &str,
    ) -> Result<Player, RoomError> {
        let to_mode = ControlMode::parse(to_mode).ok_or(RoomError::InvalidControlMode)?;
        if to_mode == ControlMode::Agent && agent_id.is_empty() {
            return Err(RoomError::InvalidControlMode);
        }
        let mut inner = self.inner.write().await;
        let room = inner.rooms.get(room_id).ok_or(RoomError::RoomNotFound)?;
        if !room.player_ids.iter().any(|id| id == player_id) {
            return Err(RoomError::PlayerNotRoomMember);
        }
        let room = room.clone();
        let player = inner
            .players
            .get_mut(player_id)
            .ok_or(RoomError::PlayerNotFound)?;
        if player.room_id != room_id {
            return Err(RoomError::PlayerNotInRoom);
        }
        let from_mode = player.control_mode;
        player.control_mode = to_mode;
        player.agent_id = if to_mode == ControlMode::Agent {
            agent_id.to_string()
        } else {
            String::new()
        };
        player.updated_at = Utc::now();
        let updated = player.clone();

        let mut meta = Map::new();
        meta.insert("player_id".into(), Value::from(player_id));
        meta.insert("from_mode".into(), Value::from(from_mode.as_str()));
        meta.insert("to_mode".into(), Value::from(to_mode.as_str()));
        meta.insert("agent_id".into(), Value::from(updated.agent_id.clone()));
        self.publish_room_event(&Event::ControlSwitchApplied {
            room_id: room.id.clone(),
            room,
            meta,
            at: Utc::now(),
        });
        Ok(updated)
    }

    /// Validate and broadcast an input. The declared source must match
    /// the player's control mode; `state_sync` payloads are applied to
    /// the local state store before broadcast. Publish failures are
    /// returned to the caller, with no rollback of the per-room publish.
    pub async fn submit_input(&self, room_id: &str, mut input: InputEvent) -> Result<(), RoomError> {
        {
            let inner = self.inner.read().await;
            let room = inner.rooms.get(room_id).ok_or(RoomError::RoomNotFound)?;
            if !room.player_ids.iter().any(|id| id == &input.player_id) {
                return Err(RoomError::PlayerNotRoomMember);
            }
            let player = inner
                .players
                .get(&input.player_id)
                .ok_or(RoomError::PlayerNotFound)?;
            if player.room_id != room_id {
                return Err(RoomError::PlayerNotInRoom);
            }
            if !input.source.matches(player.control_mode) {
                return Err(RoomError::ControlModeMismatch);
            }
        }

        let at = *input.at.get_or_insert_with(Utc::now);
        if input.action == ACTION_STATE_SYNC {
            self.upsert_room_state(room_id, &input).await;
        }
        let event = Event::RoomInput {
            room_id: room_id.to_string(),
            input,
            at,
        };
        let bytes = event.to_bytes()?;
        self.pubsub.publish(&room_topic(room_id), &bytes)?;
        self.pubsub.publish(TOPIC_ROOM, &bytes)?;
        Ok(())
    }

    /// Subscribe to a room's event stream (lifecycle + inputs).
    pub fn subscribe_room(&self, room_id: &str) -> Subscription {
        self.pubsub.subscribe(&room_topic(room_id))
    }

    /// Deterministic pairing over the union of local and remote-view
    /// candidates. Candidates are sorted by `(ping_ms, id)`; the best two
    /// form the room and the first of them hosts it. Only the node owning
    /// the lexicographically smallest candidate id materializes the room;
    /// everyone else waits for `room_assigned` to arrive over the bus.
    fn try_match(&self, inner: &mut Inner, app_id: &str, version: &str) -> Option<Room> {
        let eligible = |p: &Player| {
            p.ready && p.room_id.is_empty() && p.app_id == app_id && p.version == version
        };
        let mut by_id: HashMap<String, (Player, bool)> = HashMap::new();
        for p in inner.players.values() {
            if eligible(p) {
                by_id.insert(p.id.clone(), (p.clone(), true));
            }
        }
        for p in inner.remote.values() {
            if eligible(p) {
                // Local entries shadow remote entries with the same id.
                by_id
                    .entry(p.id.clone())
                    .or_insert_with(|| (p.clone(), false));
            }
        }
        if by_id.len() < 2 {
            return None;
        }
        let mut candidates: Vec<(Player, bool)> = by_id.into_values().collect();
        candidates.sort_by(|(a, _), (b, _)| {
            a.ping_ms.cmp(&b.ping_ms).then_with(|| a.id.cmp(&b.id))
        });
        candidates.truncate(2);
        let host = candidates[0].0.clone();

        let owner = candidates
            .iter()
            .map(|(p, _)| p.id.as_str())
            .min()?
            .to_string();
        if !inner.players.contains_key(&owner) {
            return None;
        }

        let room_id = format!("room_{}", self.seq.fetch_add(1, Ordering::SeqCst) + 1);
        let room = Room {
            id: room_id.clone(),
            app_id: app_id.to_string(),
            version: version.to_string(),
            host_id: host.id.clone(),
            player_ids: vec![candidates[0].0.id.clone(), candidates[1].0.id.clone()],
            created_at: Utc::now(),
        };
        inner.rooms.insert(room_id.clone(), room.clone());
        for (member, local) in &candidates {
            if *local {
                if let Some(lp) = inner.players.get_mut(&member.id) {
                    lp.room_id = room_id.clone();
                    lp.ready = false;
                    lp.control_mode = ControlMode::Human;
                    lp.agent_id.clear();
                    lp.updated_at = Utc::now();
                }
            }
            inner.remote.remove(&member.id);
        }
        debug!(room_id = %room.id, host_id = %room.host_id, "room created");

        let mut meta = Map::new();
        meta.insert("reason".into(), Value::from("all_ready"));
        meta.insert("host_ping_ms".into(), Value::from(host.ping_ms));
        self.publish_room_event(&Event::RoomAssigned {
            room_id: room.id.clone(),
            room: room.clone(),
            meta,
            at: Utc::now(),
        });
        Some(room)
    }

    /// Room events go out twice: on the per-room topic for watchers and
    /// on the global topic for replication.
    fn publish_room_event(&self, event: &Event) {
        let room_id = match event {
            Event::RoomAssigned { room_id, .. }
            | Event::ControlSwitchApplied { room_id, .. }
            | Event::RoomInput { room_id, .. } => room_id.clone(),
            Event::PlayerReady { .. } => return,
        };
        self.publish_best_effort(&room_topic(&room_id), event);
        self.publish_best_effort(TOPIC_ROOM, event);
    }

    fn publish_best_effort(&self, topic: &str, event: &Event) {
        match event.to_bytes() {
            Ok(bytes) => {
                if let Err(error) = self.pubsub.publish(topic, &bytes) {
                    warn!(%topic, %error, "best-effort publish failed");
                }
            }
            Err(error) => warn!(%topic, %error, "event encode failed"),
        }
    }

    async fn consume_player_events(self, mut sub: Subscription) {
        while let Some(msg) = sub.recv().await {
            let Ok(event) = Event::from_bytes(&msg.payload) else {
                continue;
            };
            let Event::PlayerReady {
                player: incoming, ..
            } = event
            else {
                continue;
            };
            let mut inner = self.inner.write().await;
            if let Some(local) = inner.players.get_mut(&incoming.id) {
                // Self-published events keep the local seat fresh, but
                // never clobber an assigned room.
                if local.room_id.is_empty() {
                    local.ready = incoming.ready;
                    local.ping_ms = incoming.ping_ms;
                    local.app_id = incoming.app_id.clone();
                    local.version = incoming.version.clone();
                    local.updated_at = Utc::now();
                }
            } else if incoming.room_id.is_empty() && incoming.ready {
                inner.remote.insert(incoming.id.clone(), incoming.clone());
            } else {
                inner.remote.remove(&incoming.id);
            }
            self.try_match(&mut inner, &incoming.app_id, &incoming.version);
        }
    }

    async fn consume_room_events(self, mut sub: Subscription) {
        while let Some(msg) = sub.recv().await {
            let Ok(event) = Event::from_bytes(&msg.payload) else {
                continue;
            };
            match event {
                Event::RoomAssigned { room, .. } => {
                    let mut inner = self.inner.write().await;
                    let room_id = room.id.clone();
                    let player_ids = room.player_ids.clone();
                    // Last writer wins; deterministic pairing makes the
                    // content identical across nodes for the same pair.
                    inner.rooms.insert(room_id.clone(), room);
                    for pid in &player_ids {
                        inner.remote.remove(pid);
                        if let Some(p) = inner.players.get_mut(pid) {
                            p.room_id = room_id.clone();
                            p.ready = false;
                            p.control_mode = ControlMode::Human;
                            p.agent_id.clear();
                            p.updated_at = Utc::now();
                        }
                    }
                    inner.states.entry(room_id).or_default();
                }
                Event::RoomInput { room_id, input, .. } => {
                    if input.action == ACTION_STATE_SYNC {
                        self.upsert_room_state(&room_id, &input).await;
                    }
                }
                Event::PlayerReady { .. } | Event::ControlSwitchApplied { .. } => {}
            }
        }
    }

    /// Mirror a `state_sync` payload into the state store. Unknown rooms
    /// and payloads without a string-array `board` are ignored.
    async fn upsert_room_state(&self, room_id: &str, input: &InputEvent) {
        let mut inner = self.inner.write().await;
        if !inner.rooms.contains_key(room_id) {
            return;
        }
        let Some(board) = input.payload.get("board").and_then(string_rows) else {
            return;
        };
        let state = PlayerState {
            player_id: input.player_id.clone(),
            source: input.source,
            board,
            score: int_field(&input.payload, "score"),
            lines: int_field(&input.payload, "lines"),
            level: int_field(&input.payload, "level"),
            game_over: input
                .payload
                .get("game_over")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            updated_at: Utc::now(),
        };
        inner
            .states
            .entry(room_id.to_string())
            .or_default()
            .insert(input.player_id.clone(), state);
    }
}

fn string_rows(value: &Value) -> Option<Vec<String>> {
    let rows = value.as_array()?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(row.as_str()?.to_string());
    }
    Some(out)
}

fn int_field(payload: &Map<String, Value>, key: &str) -> i64 {
    match payload.get(key) {
        Some(v) => v
            .as_i64()
            .or_else(|| v.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        None => 0,
    }
}
