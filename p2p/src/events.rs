use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Global topic carrying `player_ready` announcements.
pub const TOPIC_PLAYER: &str = "tetris.player";
/// Global topic carrying room lifecycle and input events.
pub const TOPIC_ROOM: &str = "tetris.room";

/// Per-room topic, streamed to clients watching a single room.
pub fn room_topic(room_id: &str) -> String {
    format!("{TOPIC_ROOM}.{room_id}")
}

/// Who is allowed to drive a player's inputs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    #[default]
    Human,
    Agent,
}

impl ControlMode {
    /// Parse a wire/API label. Unknown labels are the caller's
    /// `InvalidControlMode` case.
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "human" => Some(Self::Human),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Agent => "agent",
        }
    }
}

/// Declared origin of an input event, checked against the player's
/// control mode before the input is accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    Human,
    Agent,
}

impl InputSource {
    pub fn matches(self, mode: ControlMode) -> bool {
        matches!(
            (self, mode),
            (Self::Human, ControlMode::Human) | (Self::Agent, ControlMode::Agent)
        )
    }
}

/// One seat in the mesh. Each node owns exactly one local player; every
/// other node holds a read-only remote view of it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Player {
    pub id: String,
    pub app_id: String,
    pub version: String,
    pub ping_ms: i64,
    pub ready: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub room_id: String,
    pub control_mode: ControlMode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    pub updated_at: DateTime<Utc>,
}

/// A matched pair. `player_ids` is ordered by the pairing rule, so the
/// first entry is always `host_id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub app_id: String,
    pub version: String,
    pub host_id: String,
    pub player_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Replicated snapshot of one player's board.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlayerState {
    pub player_id: String,
    pub source: InputSource,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub board: Vec<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub score: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub lines: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub level: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub game_over: bool,
    pub updated_at: DateTime<Utc>,
}

/// A control or `state_sync` input submitted into a room.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputEvent {
    pub player_id: String,
    pub source: InputSource,
    pub action: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub tick: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
}

/// Wire envelope exchanged on the bus. JSON, snake_case, RFC3339 UTC
/// timestamps; the schema round-trips bit-exactly between nodes so the
/// matcher sees identical inputs everywhere.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    PlayerReady {
        player: Player,
        at: DateTime<Utc>,
    },
    RoomAssigned {
        room_id: String,
        room: Room,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        meta: Map<String, Value>,
        at: DateTime<Utc>,
    },
    ControlSwitchApplied {
        room_id: String,
        room: Room,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        meta: Map<String, Value>,
        at: DateTime<Utc>,
    },
    RoomInput {
        room_id: String,
        input: InputEvent,
        at: DateTime<Utc>,
    },
}

impl Event {
    /// Canonical encoding for transmission.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a received payload. Consumers skip payloads that fail here.
    pub fn from_bytes(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}
