use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::AcquireError;
use crate::fabric::{Fabric, WireEvent};
use crate::session::SpeakerId;

use super::fragment::RawFragment;
use super::provider::{SpeechProvider, SpeechStream};

/// Proxied path: audio chunks travel over the transport fabric to the
/// server-side relay, which talks to the provider and broadcasts fragments
/// back as `TranscriptionUpdate` events addressed by speaker id.
pub struct FabricSpeechProvider {
    fabric: Fabric,
    room: String,
}

impl FabricSpeechProvider {
    pub fn new(fabric: Fabric, room: &str) -> Self {
        Self {
            fabric,
            room: room.to_string(),
        }
    }
}

#[async_trait]
impl SpeechProvider for FabricSpeechProvider {
    async fn open(
        &self,
        speaker_id: &SpeakerId,
        mime_type: &str,
        context_label: Option<String>,
    ) -> Result<SpeechStream, AcquireError> {
        let (conn, mut events) = self.fabric.connect();
        self.fabric.join(conn, &self.room);
        self.fabric.broadcast_from(
            conn,
            &self.room,
            WireEvent::TranscriptionStart {
                speaker_id: speaker_id.clone(),
                mime_type: mime_type.to_string(),
            },
        );

        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (frag_tx, frag_rx) = mpsc::unbounded_channel();

        let fabric = self.fabric.clone();
        let room = self.room.clone();
        let speaker = speaker_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    chunk = sink_rx.recv() => match chunk {
                        Some(data) => fabric.broadcast_from(conn, &room, WireEvent::TranscriptionAudioChunk {
                            speaker_id: speaker.clone(),
                            chunk: data,
                            door_id: None,
                            door_label: context_label.clone(),
                        }),
                        None => {
                            // Caller dropped the sink: close the upstream and
                            // keep draining fragments until the relay stops.
                            fabric.broadcast_from(conn, &room, WireEvent::TranscriptionStop {
                                speaker_id: speaker.clone(),
                            });
                            break;
                        }
                    },
                    event = events.recv() => match event {
                        Some(WireEvent::TranscriptionUpdate(f)) if f.speaker_id == speaker => {
                            let raw = RawFragment {
                                transcript: f.transcript,
                                is_final: f.is_final,
                                timestamp: f.timestamp,
                            };
                            if frag_tx.send(raw).is_err() {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            // Drain trailing fragments after end-of-audio, with a short
            // grace period so the task cannot outlive the relay.
            let grace = std::time::Duration::from_secs(2);
            while let Ok(Some(event)) = tokio::time::timeout(grace, events.recv()).await {
                match event {
                    WireEvent::TranscriptionUpdate(f) if f.speaker_id == speaker => {
                        let raw = RawFragment {
                            transcript: f.transcript,
                            is_final: f.is_final,
                            timestamp: f.timestamp,
                        };
                        if frag_tx.send(raw).is_err() {
                            break;
                        }
                    }
                    WireEvent::TranscriptionStop { speaker_id } if speaker_id == speaker => break,
                    _ => {}
                }
            }
            debug!(speaker = %speaker, "proxied acquisition closed");
            fabric.disconnect(conn);
        });

        Ok(SpeechStream {
            sink: sink_tx,
            fragments: frag_rx,
        })
    }
}
