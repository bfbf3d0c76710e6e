pub mod events;
pub mod manager;
pub mod transport;

pub use events::{
    room_topic, ControlMode, Event, InputEvent, InputSource, Player, PlayerState, Room,
    TOPIC_PLAYER, TOPIC_ROOM,
};
pub use manager::{RoomError, RoomManager, ACTION_STATE_SYNC};
pub use transport::{MemoryPubSub, Message, PubSub, Subscription, TransportError};
