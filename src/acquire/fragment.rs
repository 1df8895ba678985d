use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SpeakerId;

/// Incremental transcript unit as emitted by an acquisition path, before
/// normalization.
#[derive(Debug, Clone)]
pub struct RawFragment {
    pub transcript: String,
    pub is_final: bool,
    pub timestamp: DateTime<Utc>,
}

/// Normalized transcript fragment. Partial fragments are superseded by
/// later fragments for the same speaker; final fragments are appended to
/// committed text and never superseded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptFragment {
    pub speaker_id: SpeakerId,
    pub transcript: String,
    pub is_final: bool,
    pub timestamp: DateTime<Utc>,
    pub door_id: Option<String>,
    pub door_label: Option<String>,
}

/// Normalizes fragments to one shape regardless of acquisition path:
/// whitespace-collapsed text and monotonically non-decreasing timestamps.
#[derive(Debug)]
pub struct FragmentNormalizer {
    speaker_id: SpeakerId,
    last_timestamp: Option<DateTime<Utc>>,
}

impl FragmentNormalizer {
    pub fn new(speaker_id: SpeakerId) -> Self {
        Self {
            speaker_id,
            last_timestamp: None,
        }
    }

    /// Returns None for fragments that are empty once whitespace collapses.
    pub fn normalize(
        &mut self,
        raw: RawFragment,
        door_id: Option<String>,
        door_label: Option<String>,
    ) -> Option<TranscriptFragment> {
        let transcript = collapse_whitespace(&raw.transcript);
        if transcript.is_empty() {
            return None;
        }
        let timestamp = match self.last_timestamp {
            Some(prev) if raw.timestamp < prev => prev,
            _ => raw.timestamp,
        };
        self.last_timestamp = Some(timestamp);
        Some(TranscriptFragment {
            speaker_id: self.speaker_id.clone(),
            transcript,
            is_final: raw.is_final,
            timestamp,
            door_id,
            door_label,
        })
    }
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
