use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::FabricError;

use super::envelope::WireEvent;

/// Transport-level connection identifier. Routing for point-to-point
/// signaling is always by `ConnId`, never by logical identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnId(Uuid);

impl ConnId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Room-based publish/subscribe bus. The only shared mutable resource
/// crossing component boundaries; everything else is message passing.
///
/// Deliveries are fire-and-forget over unbounded channels: a slow consumer
/// never throttles a producer.
#[derive(Clone, Default)]
pub struct Fabric {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    conns: HashMap<ConnId, mpsc::UnboundedSender<WireEvent>>,
    rooms: HashMap<String, HashSet<ConnId>>,
    memberships: HashMap<ConnId, HashSet<String>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connect(&self) -> (ConnId, mpsc::UnboundedReceiver<WireEvent>) {
        let conn = ConnId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.locked().conns.insert(conn, tx);
        debug!(%conn, "fabric client connected");
        (conn, rx)
    }

    /// Drops the connection and leaves every room it joined, notifying the
    /// remaining members so peer links can be torn down.
    pub fn disconnect(&self, conn: ConnId) {
        let rooms: Vec<String> = {
            let mut inner = self.locked();
            inner.conns.remove(&conn);
            inner
                .memberships
                .remove(&conn)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default()
        };
        for room in rooms {
            self.remove_member(conn, &room, true);
        }
        debug!(%conn, "fabric client disconnected");
    }

    pub fn join(&self, conn: ConnId, room: &str) {
        let mut inner = self.locked();
        inner.rooms.entry(room.to_string()).or_default().insert(conn);
        inner
            .memberships
            .entry(conn)
            .or_default()
            .insert(room.to_string());
    }

    pub fn leave(&self, conn: ConnId, room: &str) {
        {
            let mut inner = self.locked();
            if let Some(set) = inner.memberships.get_mut(&conn) {
                set.remove(room);
            }
        }
        self.remove_member(conn, room, true);
    }

    fn remove_member(&self, conn: ConnId, room: &str, notify: bool) {
        let remaining: Vec<mpsc::UnboundedSender<WireEvent>> = {
            let mut inner = self.locked();
            let gone = inner
                .rooms
                .get_mut(room)
                .map(|set| set.remove(&conn))
                .unwrap_or(false);
            if !gone || !notify {
                return;
            }
            let members: Vec<ConnId> = inner
                .rooms
                .get(room)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            members
                .iter()
                .filter_map(|id| inner.conns.get(id).cloned())
                .collect()
        };
        for tx in remaining {
            let _ = tx.send(WireEvent::PeerLeft { conn });
        }
    }

    /// Delivers to every member of the room, including the sender if joined.
    pub fn publish(&self, room: &str, event: WireEvent) {
        for tx in self.room_senders(room, None) {
            let _ = tx.send(event.clone());
        }
    }

    /// Delivers to every member of the room except `from` (the emitting
    /// connection does not hear its own broadcasts).
    pub fn broadcast_from(&self, from: ConnId, room: &str, event: WireEvent) {
        for tx in self.room_senders(room, Some(from)) {
            let _ = tx.send(event.clone());
        }
    }

    /// Point-to-point delivery by connection id.
    pub fn send(&self, to: ConnId, event: WireEvent) -> Result<(), FabricError> {
        let tx = self
            .locked()
            .conns
            .get(&to)
            .cloned()
            .ok_or(FabricError::PeerGone(to))?;
        tx.send(event).map_err(|_| FabricError::PeerGone(to))
    }

    pub fn members(&self, room: &str) -> Vec<ConnId> {
        self.locked()
            .rooms
            .get(room)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn room_senders(
        &self,
        room: &str,
        skip: Option<ConnId>,
    ) -> Vec<mpsc::UnboundedSender<WireEvent>> {
        let inner = self.locked();
        let Some(members) = inner.rooms.get(room) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|id| skip != Some(**id))
            .filter_map(|id| inner.conns.get(id).cloned())
            .collect()
    }
}
