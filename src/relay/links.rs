use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capture::AudioChunk;
use crate::fabric::{ConnId, Fabric, WireEvent};

use super::signal::{NegotiationState, SignalPayload, SPEECH_MAX_BITRATE};

/// One accepted listener on the speaker side: the media feed plus the
/// negotiation leftovers the speaker keeps for the link's lifetime.
struct PeerLink {
    media: mpsc::UnboundedSender<AudioChunk>,
    remote_candidates: Vec<String>,
    max_bitrate: u32,
}

/// Speaker-side fan-out of the live audio stream. Each listener gets its
/// own media channel; a dead listener only loses its own link.
pub struct SpeakerRelay {
    conn: ConnId,
    fabric: Fabric,
    links: HashMap<ConnId, PeerLink>,
    streaming: bool,
}

impl SpeakerRelay {
    pub fn new(fabric: Fabric, conn: ConnId) -> Self {
        Self {
            conn,
            fabric,
            links: HashMap::new(),
            streaming: false,
        }
    }

    /// Marks the speaker live or not. Going off-air tears down every link.
    pub fn set_streaming(&mut self, streaming: bool) {
        self.streaming = streaming;
        if !streaming {
            self.close_all();
        }
    }

    pub fn listener_count(&self) -> usize {
        self.links.len()
    }

    /// Processes one signaling message addressed to this speaker. An
    /// accepted offer yields the media receiver for the new link.
    pub fn handle(
        &mut self,
        from: ConnId,
        payload: SignalPayload,
    ) -> Option<mpsc::UnboundedReceiver<AudioChunk>> {
        match payload {
            SignalPayload::Offer { sdp } => self.accept_offer(from, &sdp),
            SignalPayload::Candidate { candidate } => {
                if let Some(link) = self.links.get_mut(&from) {
                    if let Some(candidate) = candidate {
                        link.remote_candidates.push(candidate);
                    }
                }
                None
            }
            SignalPayload::Leave => {
                self.close(from);
                None
            }
            SignalPayload::Answer { .. } => {
                // Speakers answer, they never receive answers.
                debug!(%from, "ignoring answer addressed to a speaker");
                None
            }
        }
    }

    fn accept_offer(
        &mut self,
        from: ConnId,
        _offer_sdp: &str,
    ) -> Option<mpsc::UnboundedReceiver<AudioChunk>> {
        if !self.streaming {
            info!(listener = %from, "offer rejected, speaker not streaming");
            return None;
        }
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let link = PeerLink {
            media: media_tx,
            remote_candidates: Vec::new(),
            max_bitrate: SPEECH_MAX_BITRATE,
        };
        let answer = WireEvent::Signal {
            to: from,
            from: self.conn,
            payload: SignalPayload::Answer {
                sdp: answer_sdp(link.max_bitrate),
            },
        };
        if let Err(e) = self.fabric.send(from, answer) {
            warn!(listener = %from, error = %e, "listener gone before answer, dropping link");
            return None;
        }
        // Host candidate follows the answer on the same path.
        let candidate = WireEvent::Signal {
            to: from,
            from: self.conn,
            payload: SignalPayload::Candidate {
                candidate: Some(format!("host {}", self.conn)),
            },
        };
        if let Err(e) = self.fabric.send(from, candidate) {
            warn!(listener = %from, error = %e, "listener gone mid-negotiation, dropping link");
            return None;
        }
        info!(listener = %from, "listener link established");
        self.links.insert(from, link);
        Some(media_rx)
    }

    /// Fans one chunk out to every live link, pruning links whose
    /// receiver was dropped. One dead listener never affects the others.
    pub fn distribute(&mut self, chunk: &AudioChunk) {
        self.links.retain(|listener, link| {
            if link.media.send(chunk.clone()).is_ok() {
                true
            } else {
                debug!(%listener, "listener media channel closed, pruning link");
                false
            }
        });
    }

    pub fn close(&mut self, listener: ConnId) {
        if self.links.remove(&listener).is_some() {
            info!(%listener, "listener link closed");
        }
    }

    /// Transport-level departure; same teardown as an orderly leave.
    pub fn on_peer_left(&mut self, conn: ConnId) {
        self.close(conn);
    }

    pub fn close_all(&mut self) {
        if !self.links.is_empty() {
            info!(links = self.links.len(), "closing all listener links");
        }
        self.links.clear();
    }
}

/// Listener-side half of the negotiation. Pure state over fabric sends;
/// the media itself arrives out of band once the speaker accepts.
pub struct ListenerLink {
    speaker_conn: ConnId,
    conn: ConnId,
    fabric: Fabric,
    state: Option<NegotiationState>,
    remote_candidates: Vec<String>,
    /// Candidates that raced ahead of the answer; applied once it arrives.
    pending_candidates: Vec<String>,
}

impl ListenerLink {
    pub fn new(fabric: Fabric, conn: ConnId, speaker_conn: ConnId) -> Self {
        Self {
            speaker_conn,
            conn,
            fabric,
            state: None,
            remote_candidates: Vec::new(),
            pending_candidates: Vec::new(),
        }
    }

    pub fn state(&self) -> Option<NegotiationState> {
        self.state
    }

    pub fn remote_candidates(&self) -> &[String] {
        &self.remote_candidates
    }

    /// Opens the negotiation by offering to the speaker's connection.
    pub fn subscribe(&mut self) -> Result<(), crate::error::FabricError> {
        self.fabric.send(
            self.speaker_conn,
            WireEvent::Signal {
                to: self.speaker_conn,
                from: self.conn,
                payload: SignalPayload::Offer {
                    sdp: offer_sdp(),
                },
            },
        )?;
        self.state = Some(NegotiationState::OfferSent);
        Ok(())
    }

    /// Advances the negotiation on a signal from the speaker. Out-of-order
    /// messages are ignored rather than treated as errors.
    pub fn on_signal(&mut self, from: ConnId, payload: SignalPayload) {
        if from != self.speaker_conn {
            return;
        }
        match (self.state, payload) {
            (Some(NegotiationState::OfferSent), SignalPayload::Answer { .. }) => {
                self.state = Some(NegotiationState::AnswerReceived);
                // Reciprocate with our own host candidate.
                let _ = self.fabric.send(
                    self.speaker_conn,
                    WireEvent::Signal {
                        to: self.speaker_conn,
                        from: self.conn,
                        payload: SignalPayload::Candidate {
                            candidate: Some(format!("host {}", self.conn)),
                        },
                    },
                );
                if !self.pending_candidates.is_empty() {
                    self.remote_candidates.append(&mut self.pending_candidates);
                    self.state = Some(NegotiationState::Connected);
                }
            }
            (Some(NegotiationState::OfferSent), SignalPayload::Candidate { candidate }) => {
                // The answer has not arrived yet; hold the candidate
                if let Some(candidate) = candidate {
                    self.pending_candidates.push(candidate);
                }
            }
            (Some(NegotiationState::AnswerReceived), SignalPayload::Candidate { candidate }) => {
                if let Some(candidate) = candidate {
                    self.remote_candidates.push(candidate);
                }
                self.state = Some(NegotiationState::Connected);
            }
            (Some(NegotiationState::Connected), SignalPayload::Candidate { candidate }) => {
                // Trickled candidates after connection are still recorded
                if let Some(candidate) = candidate {
                    self.remote_candidates.push(candidate);
                }
            }
            _ => {}
        }
    }

    /// Orderly departure; best-effort, the speaker may already be gone.
    pub fn unsubscribe(&mut self) {
        let _ = self.fabric.send(
            self.speaker_conn,
            WireEvent::Signal {
                to: self.speaker_conn,
                from: self.conn,
                payload: SignalPayload::Leave,
            },
        );
        self.state = None;
        self.remote_candidates.clear();
        self.pending_candidates.clear();
    }
}

fn offer_sdp() -> String {
    "v=0\r\nm=audio 9 RTP/AVPF 111\r\na=recvonly\r\n".to_string()
}

fn answer_sdp(max_bitrate: u32) -> String {
    format!(
        "v=0\r\nm=audio 9 RTP/AVPF 111\r\na=sendonly\r\nb=AS:{}\r\n",
        max_bitrate / 1000
    )
}
