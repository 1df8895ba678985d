use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::fabric::{ActiveStream, ConnId, Fabric, PresenceRegistry, WireEvent};
use crate::transcript::{clean_and_merge, SessionStore};

use super::types::{Session, SpeakerId};

struct LiveSession {
    session: Session,
    conn: ConnId,
}

/// Server-side owner of the persisted session records. Watches the room
/// for stream announcements, accumulates finalized fragments into each
/// session's transcript, backs active sessions up periodically, and
/// finalizes on stop, emergency flush, or transport loss.
///
/// This is the concurrent writer the client reconciles against: both ends
/// may hold text the other missed, so the persisted record only ever
/// moves forward in length.
pub struct StreamRegistry {
    fabric: Fabric,
    room: String,
    conn: ConnId,
    events: tokio::sync::mpsc::UnboundedReceiver<WireEvent>,
    store: Arc<dyn SessionStore>,
    presence: PresenceRegistry,
    active: HashMap<SpeakerId, LiveSession>,
    backup_interval: Duration,
}

impl StreamRegistry {
    pub fn new(fabric: Fabric, store: Arc<dyn SessionStore>, config: &Config) -> Self {
        let (conn, events) = fabric.connect();
        fabric.join(conn, &config.room);
        Self {
            fabric,
            room: config.room.clone(),
            conn,
            events,
            store,
            presence: PresenceRegistry::new(),
            active: HashMap::new(),
            backup_interval: config.backup_interval,
        }
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub async fn run(mut self) {
        let mut backups = tokio::time::interval(self.backup_interval);
        backups.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = backups.tick() => self.backup_all().await,
            }
        }
        info!("stream registry shutting down");
    }

    async fn handle(&mut self, event: WireEvent) {
        match event {
            WireEvent::StartStreaming { from, session } => {
                // A replaced stream means the previous one ended without a
                // stop we saw; close it out before tracking the new one.
                if let Some(previous) = self.active.remove(&session.speaker_id) {
                    warn!(speaker = %session.speaker_id, "stale session replaced");
                    self.finalize(previous).await;
                }
                self.presence.register(&session.speaker_id.0, from);
                if let Err(e) = self.store.create(&session).await {
                    warn!(session = %session.id, error = %e, "session create failed");
                }
                info!(speaker = %session.speaker_id, session = %session.id, "stream registered");
                self.active
                    .insert(session.speaker_id.clone(), LiveSession { session, conn: from });
            }
            WireEvent::StopStreaming { speaker_id } => {
                if let Some(live) = self.active.remove(&speaker_id) {
                    self.finalize(live).await;
                }
            }
            WireEvent::TranscriptionUpdate(fragment) => {
                if !fragment.is_final {
                    return;
                }
                if let Some(live) = self.active.get_mut(&fragment.speaker_id) {
                    live.session.full_transcript =
                        clean_and_merge(&live.session.full_transcript, &fragment.transcript);
                    if let Some(label) = &fragment.door_label {
                        live.session.visit_door(label);
                    }
                }
            }
            WireEvent::EmergencySaveSession { speaker_id } => {
                // The speaker's process is going away; persist what we have
                // immediately, end time included, but keep tracking in case
                // a stop still arrives.
                if let Some(live) = self.active.get_mut(&speaker_id) {
                    let mut snapshot = live.session.clone();
                    snapshot.close(Utc::now());
                    info!(speaker = %speaker_id, session = %snapshot.id, "emergency save");
                    if let Err(e) = self.store.save(&snapshot, true).await {
                        warn!(session = %snapshot.id, error = %e, "emergency save failed");
                    }
                }
            }
            WireEvent::StreamingStatusRequest { from } => {
                let active = self
                    .active
                    .values()
                    .map(|live| ActiveStream {
                        speaker_id: live.session.speaker_id.clone(),
                        speaker_name: live.session.speaker_name.clone(),
                        conn: live.conn,
                    })
                    .collect();
                if let Err(e) = self
                    .fabric
                    .send(from, WireEvent::StreamingStatusResponse { active })
                {
                    debug!(%from, error = %e, "status requester gone");
                }
            }
            WireEvent::PeerLeft { conn } => {
                let Some(participant) = self.presence.unregister_conn(conn) else {
                    return;
                };
                let speaker_id = SpeakerId(participant);
                if let Some(live) = self.active.remove(&speaker_id) {
                    warn!(speaker = %speaker_id, "speaker transport lost, finalizing");
                    self.finalize(live).await;
                }
            }
            _ => {}
        }
    }

    /// Closes the record, persists it, and announces completion. The
    /// announcement goes out even when the save failed so the speaker side
    /// still gets its chance to reconcile.
    async fn finalize(&mut self, mut live: LiveSession) {
        live.session.close(Utc::now());
        if let Err(e) = self.store.save(&live.session, false).await {
            warn!(session = %live.session.id, error = %e, "final save failed");
        }
        info!(
            session = %live.session.id,
            duration = live.session.duration_seconds,
            chars = live.session.full_transcript.chars().count(),
            "session finalized"
        );
        self.fabric.broadcast_from(
            self.conn,
            &self.room,
            WireEvent::TranscriptionSessionCompleted {
                session: live.session,
            },
        );
    }

    async fn backup_all(&mut self) {
        for live in self.active.values() {
            if let Err(e) = self.store.save(&live.session, true).await {
                warn!(session = %live.session.id, error = %e, "periodic backup failed");
            } else {
                debug!(session = %live.session.id, "periodic backup saved");
            }
        }
    }
}

impl Drop for StreamRegistry {
    fn drop(&mut self) {
        self.fabric.disconnect(self.conn);
    }
}

