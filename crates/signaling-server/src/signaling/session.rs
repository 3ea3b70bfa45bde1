//! Per-connection signaling state.

use crate::actors::{RoomActorHandle, RoomEvent};

use tokio::sync::mpsc;
use uuid::Uuid;

/// Buffer of a connection's event channel. Events beyond it are dropped with a warning.
pub const EVENT_CHANNEL_BUFFER: usize = 256;

/// One client connection: a generated peer id and at most one room.
pub struct Session {
    peer_id: String,
    room: Option<RoomActorHandle>,
    events: mpsc::Sender<RoomEvent>,
}

impl Session {
    /// Create a session and the receiving end of its event channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::Receiver<RoomEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let session = Self {
            peer_id: Uuid::new_v4().to_string(),
            room: None,
            events,
        };
        (session, rx)
    }

    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    #[must_use]
    pub fn room(&self) -> Option<&RoomActorHandle> {
        self.room.as_ref()
    }

    #[must_use]
    pub fn room_id(&self) -> Option<&str> {
        self.room.as_ref().map(RoomActorHandle::room_id)
    }

    pub(crate) fn events(&self) -> mpsc::Sender<RoomEvent> {
        self.events.clone()
    }

    pub(crate) fn enter(&mut self, room: RoomActorHandle) {
        self.room = Some(room);
    }

    pub(crate) fn leave(&mut self) -> Option<RoomActorHandle> {
        self.room.take()
    }
}
