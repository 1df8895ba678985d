use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::fabric::{ConnId, Fabric, WireEvent};
use crate::session::SpeakerId;

use super::fragment::TranscriptFragment;
use super::provider::SpeechProvider;

/// Server-side acquisition relay: receives audio chunks over the fabric,
/// forwards them to the speech provider, and broadcasts the resulting
/// fragments as `TranscriptionUpdate` events addressed by speaker id.
pub struct ProxyService {
    fabric: Fabric,
    room: String,
    conn: ConnId,
    events: mpsc::UnboundedReceiver<WireEvent>,
    provider: Arc<dyn SpeechProvider>,
    streams: HashMap<SpeakerId, Upstream>,
}

struct Upstream {
    sink: mpsc::UnboundedSender<Vec<u8>>,
    /// Last location label seen on a chunk; applied to outgoing fragments.
    last_door: Arc<Mutex<(Option<String>, Option<String>)>>,
}

impl ProxyService {
    pub fn new(fabric: Fabric, room: &str, provider: Arc<dyn SpeechProvider>) -> Self {
        let (conn, events) = fabric.connect();
        fabric.join(conn, room);
        Self {
            fabric,
            room: room.to_string(),
            conn,
            events,
            provider,
            streams: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        info!(room = %self.room, "transcription proxy relay online");
        while let Some(event) = self.events.recv().await {
            self.handle(event).await;
        }
    }

    async fn handle(&mut self, event: WireEvent) {
        match event {
            WireEvent::TranscriptionStart {
                speaker_id,
                mime_type,
            } => {
                // A fresh start replaces any existing upstream for the speaker
                self.streams.remove(&speaker_id);
                match self.provider.open(&speaker_id, &mime_type, None).await {
                    Ok(stream) => {
                        let last_door = Arc::new(Mutex::new((None, None)));
                        self.spawn_pump(speaker_id.clone(), stream.fragments, last_door.clone());
                        self.streams.insert(
                            speaker_id.clone(),
                            Upstream {
                                sink: stream.sink,
                                last_door,
                            },
                        );
                        info!(speaker = %speaker_id, "provider streaming started");
                    }
                    Err(e) => {
                        warn!(speaker = %speaker_id, error = %e, "failed to open provider stream");
                    }
                }
            }
            WireEvent::TranscriptionAudioChunk {
                speaker_id,
                chunk,
                door_id,
                door_label,
            } => {
                let Some(upstream) = self.streams.get(&speaker_id) else {
                    return;
                };
                if door_id.is_some() || door_label.is_some() {
                    if let Ok(mut guard) = upstream.last_door.lock() {
                        if door_id.is_some() {
                            guard.0 = door_id;
                        }
                        if door_label.is_some() {
                            guard.1 = door_label;
                        }
                    }
                }
                let _ = upstream.sink.send(chunk);
            }
            WireEvent::TranscriptionStop { speaker_id } => {
                if self.streams.remove(&speaker_id).is_some() {
                    info!(speaker = %speaker_id, "provider streaming stopped");
                }
            }
            _ => {}
        }
    }

    fn spawn_pump(
        &self,
        speaker_id: SpeakerId,
        mut fragments: mpsc::UnboundedReceiver<super::fragment::RawFragment>,
        last_door: Arc<Mutex<(Option<String>, Option<String>)>>,
    ) {
        let fabric = self.fabric.clone();
        let room = self.room.clone();
        let conn = self.conn;
        tokio::spawn(async move {
            while let Some(raw) = fragments.recv().await {
                let (door_id, door_label) = last_door
                    .lock()
                    .map(|g| g.clone())
                    .unwrap_or((None, None));
                fabric.broadcast_from(
                    conn,
                    &room,
                    WireEvent::TranscriptionUpdate(TranscriptFragment {
                        speaker_id: speaker_id.clone(),
                        transcript: raw.transcript,
                        is_final: raw.is_final,
                        timestamp: raw.timestamp,
                        door_id,
                        door_label,
                    }),
                );
            }
            debug!(speaker = %speaker_id, "provider fragment stream ended");
        });
    }
}

impl Drop for ProxyService {
    fn drop(&mut self) {
        self.fabric.disconnect(self.conn);
    }
}
