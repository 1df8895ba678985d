use serde::{Deserialize, Serialize};

use crate::acquire::TranscriptFragment;
use crate::relay::SignalPayload;
use crate::session::{Session, SpeakerId};

use super::bus::ConnId;

/// Everything that travels over the fabric, as one closed, exhaustively
/// matchable envelope instead of ad hoc event names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WireEvent {
    /// A speaker went live. Carries the freshly created session record and
    /// the speaker's connection id so listeners can address offers.
    StartStreaming { from: ConnId, session: Session },
    StopStreaming { speaker_id: SpeakerId },

    /// Proxied acquisition: open a provider stream on the server relay.
    TranscriptionStart {
        speaker_id: SpeakerId,
        mime_type: String,
    },
    TranscriptionAudioChunk {
        speaker_id: SpeakerId,
        chunk: Vec<u8>,
        door_id: Option<String>,
        door_label: Option<String>,
    },
    TranscriptionStop { speaker_id: SpeakerId },

    /// A transcript fragment, emitted by whichever acquisition path produced
    /// it and consumed by observers and the buffer engine.
    TranscriptionUpdate(TranscriptFragment),

    /// Broadcast once the finalized session has been persisted.
    TranscriptionSessionCompleted { session: Session },

    /// Best-effort flush fired from page-teardown hooks.
    EmergencySaveSession { speaker_id: SpeakerId },

    StreamingStatusRequest { from: ConnId },
    StreamingStatusResponse { active: Vec<ActiveStream> },

    /// Relay negotiation, routed by connection id only.
    Signal {
        to: ConnId,
        from: ConnId,
        payload: SignalPayload,
    },

    /// Emitted by the fabric itself when a member leaves a room or
    /// disconnects; drives peer-link teardown.
    PeerLeft { conn: ConnId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveStream {
    pub speaker_id: SpeakerId,
    pub speaker_name: String,
    pub conn: ConnId,
}
