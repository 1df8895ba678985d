use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::CaptureError;
use crate::session::SpeakerId;

/// Duration of one emitted audio frame.
pub const CHUNK_FRAME_MS: u64 = 100;

/// Fan-out buffer depth per capture. Lagging consumers drop old chunks;
/// the producer never blocks.
const CHUNK_FANOUT_CAPACITY: usize = 64;

/// One timestamped, encoded audio frame (16-bit little-endian PCM).
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub data: Vec<u8>,
}

/// Device acquisition hints passed to the audio source.
#[derive(Debug, Clone)]
pub struct CaptureHints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain: bool,
    pub channels: u16,
    pub sample_rate: u32,
}

impl Default for CaptureHints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain: true,
            channels: 1,
            sample_rate: 48_000,
        }
    }
}

/// Seam between the controller and the physical device. `open` must fail
/// synchronously if the device cannot be acquired; once it returns Ok the
/// source feeds chunks into `sink` until `cancel` fires.
pub trait AudioSource: Send + Sync {
    fn open(
        &self,
        hints: &CaptureHints,
        sink: broadcast::Sender<AudioChunk>,
        cancel: CancellationToken,
    ) -> Result<(), CaptureError>;
}

#[derive(Clone)]
pub struct CaptureHandle {
    pub speaker_id: SpeakerId,
    pub context_label: Option<String>,
    chunks: broadcast::Sender<AudioChunk>,
    cancel: CancellationToken,
}

impl CaptureHandle {
    /// Registers an independent consumer of the raw chunk stream.
    pub fn subscribe(&self) -> broadcast::Receiver<AudioChunk> {
        self.chunks.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Owns the microphone lifecycle: at most one active capture per speaker,
/// chunks fanned out to any number of registered consumers.
#[derive(Clone)]
pub struct CaptureController {
    source: Arc<dyn AudioSource>,
    active: Arc<Mutex<HashMap<SpeakerId, CaptureHandle>>>,
}

impl CaptureController {
    pub fn new(source: Arc<dyn AudioSource>) -> Self {
        Self {
            source,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn locked(&self) -> MutexGuard<'_, HashMap<SpeakerId, CaptureHandle>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquires the device for this speaker. Idempotent: a second call
    /// while active returns the existing handle without opening a second
    /// device stream. A device failure is terminal, no retry.
    pub fn start(
        &self,
        speaker_id: SpeakerId,
        context_label: Option<String>,
    ) -> Result<CaptureHandle, CaptureError> {
        let mut active = self.locked();
        if let Some(handle) = active.get(&speaker_id) {
            if !handle.is_stopped() {
                debug!(speaker = %speaker_id, "capture already active, reusing handle");
                return Ok(handle.clone());
            }
        }

        let (chunks, _) = broadcast::channel(CHUNK_FANOUT_CAPACITY);
        let cancel = CancellationToken::new();
        self.source
            .open(&CaptureHints::default(), chunks.clone(), cancel.clone())?;

        info!(speaker = %speaker_id, "capture started");
        let handle = CaptureHandle {
            speaker_id: speaker_id.clone(),
            context_label,
            chunks,
            cancel,
        };
        active.insert(speaker_id, handle.clone());
        Ok(handle)
    }

    pub fn stop(&self, speaker_id: &SpeakerId) {
        if let Some(handle) = self.locked().remove(speaker_id) {
            handle.cancel.cancel();
            info!(speaker = %speaker_id, "capture stopped");
        }
    }

    /// Synchronous best-effort release for page-teardown hooks. Releases
    /// the hardware device without any network round-trip; not cancellable.
    pub fn emergency_stop(&self, speaker_id: &SpeakerId) {
        if let Some(handle) = self.locked().remove(speaker_id) {
            handle.cancel.cancel();
            info!(speaker = %speaker_id, "capture emergency-stopped");
        }
    }

    pub fn is_active(&self, speaker_id: &SpeakerId) -> bool {
        self.locked()
            .get(speaker_id)
            .map(|h| !h.is_stopped())
            .unwrap_or(false)
    }
}
