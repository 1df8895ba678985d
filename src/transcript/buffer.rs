use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::acquire::TranscriptFragment;
use crate::session::SpeakerId;

/// Published buffer change, consumed by observer surfaces.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferUpdate {
    /// Debounced in-flight partial text (replaced wholesale each time).
    Partial {
        speaker_id: SpeakerId,
        text: String,
    },
    /// Committed text after a final fragment was appended.
    Committed {
        speaker_id: SpeakerId,
        text: String,
    },
}

#[derive(Debug, Default)]
struct SpeakerBuffer {
    committed: String,
    partial: String,
    /// Armed while a partial publication is being coalesced.
    pending_deadline: Option<Instant>,
}

/// Per-speaker live transcript state: committed text (ordered, append-only,
/// capped with left-truncation) and the current partial (last-write-wins).
///
/// Single writer per speaker; debounce is driven by the caller supplying
/// `Instant`s, so the engine itself never sleeps.
pub struct TranscriptEngine {
    speakers: HashMap<SpeakerId, SpeakerBuffer>,
    debounce: Duration,
    max_chars: usize,
}

impl TranscriptEngine {
    pub fn new(debounce: Duration, max_chars: usize) -> Self {
        Self {
            speakers: HashMap::new(),
            debounce,
            max_chars,
        }
    }

    /// Applies one fragment. Finals publish immediately; partials arm the
    /// coalescing window and surface later through `poll_due`.
    pub fn apply(&mut self, fragment: &TranscriptFragment, now: Instant) -> Option<BufferUpdate> {
        let buffer = self.speakers.entry(fragment.speaker_id.clone()).or_default();
        if fragment.is_final {
            // A final supersedes any partial: clear the slot and cancel the
            // pending debounce before appending.
            buffer.partial.clear();
            buffer.pending_deadline = None;
            if !buffer.committed.is_empty() {
                buffer.committed.push(' ');
            }
            buffer.committed.push_str(&fragment.transcript);
            truncate_left(&mut buffer.committed, self.max_chars);
            Some(BufferUpdate::Committed {
                speaker_id: fragment.speaker_id.clone(),
                text: buffer.committed.clone(),
            })
        } else {
            buffer.partial = fragment.transcript.clone();
            buffer.pending_deadline = Some(now + self.debounce);
            None
        }
    }

    /// Publishes partials whose coalescing window has elapsed. Only the
    /// latest partial per speaker survives the window.
    pub fn poll_due(&mut self, now: Instant) -> Vec<BufferUpdate> {
        let mut due = Vec::new();
        for (speaker_id, buffer) in &mut self.speakers {
            if let Some(deadline) = buffer.pending_deadline {
                if deadline <= now {
                    buffer.pending_deadline = None;
                    due.push(BufferUpdate::Partial {
                        speaker_id: speaker_id.clone(),
                        text: buffer.partial.clone(),
                    });
                }
            }
        }
        due
    }

    /// Earliest pending debounce deadline, if any (driver sleep hint).
    pub fn next_deadline(&self) -> Option<Instant> {
        self.speakers
            .values()
            .filter_map(|b| b.pending_deadline)
            .min()
    }

    /// Committed + in-flight partial, space-joined. This is the local
    /// snapshot reconciliation uses, so it must include the partial slot.
    pub fn snapshot(&self, speaker_id: &SpeakerId) -> String {
        let Some(buffer) = self.speakers.get(speaker_id) else {
            return String::new();
        };
        let mut text = buffer.committed.clone();
        if !buffer.partial.is_empty() {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&buffer.partial);
        }
        text.trim().to_string()
    }

    pub fn committed(&self, speaker_id: &SpeakerId) -> &str {
        self.speakers
            .get(speaker_id)
            .map(|b| b.committed.as_str())
            .unwrap_or("")
    }

    pub fn partial(&self, speaker_id: &SpeakerId) -> &str {
        self.speakers
            .get(speaker_id)
            .map(|b| b.partial.as_str())
            .unwrap_or("")
    }

    /// Destroys the speaker's buffers and any pending debounce.
    pub fn clear(&mut self, speaker_id: &SpeakerId) {
        self.speakers.remove(speaker_id);
    }
}

/// Drops the oldest characters so the buffer keeps the most recent speech.
/// Cuts on a char boundary; the preserved suffix is byte-exact.
fn truncate_left(text: &mut String, max_chars: usize) {
    let len = text.chars().count();
    if len <= max_chars {
        return;
    }
    let cut = len - max_chars;
    if let Some((byte_idx, _)) = text.char_indices().nth(cut) {
        text.drain(..byte_idx);
    }
}
