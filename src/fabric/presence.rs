use std::collections::HashMap;

use super::bus::ConnId;

/// Maps a logical participant id to zero-or-one live connection.
/// Used to route point-to-point signaling and to decide deliverability.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    by_participant: HashMap<String, ConnId>,
    by_conn: HashMap<ConnId, String>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a participant's live connection, replacing any stale one.
    pub fn register(&mut self, participant: &str, conn: ConnId) {
        if let Some(old) = self.by_participant.insert(participant.to_string(), conn) {
            self.by_conn.remove(&old);
        }
        self.by_conn.insert(conn, participant.to_string());
    }

    /// Removes the mapping for a dropped connection, returning the
    /// participant it belonged to, if any.
    pub fn unregister_conn(&mut self, conn: ConnId) -> Option<String> {
        let participant = self.by_conn.remove(&conn)?;
        // Only clear the forward mapping if it still points at this conn
        if self.by_participant.get(&participant) == Some(&conn) {
            self.by_participant.remove(&participant);
        }
        Some(participant)
    }

    pub fn lookup(&self, participant: &str) -> Option<ConnId> {
        self.by_participant.get(participant).copied()
    }

    pub fn participant_of(&self, conn: ConnId) -> Option<&str> {
        self.by_conn.get(&conn).map(String::as_str)
    }
}
