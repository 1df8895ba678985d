use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of an audio/transcript originator (the field agent).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpeakerId(pub String);

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for SpeakerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerRole {
    Commercial,
    Manager,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speaker {
    pub id: SpeakerId,
    pub name: String,
    pub role: SpeakerRole,
}

/// One continuous recording attempt by a speaker.
///
/// Created when capture starts, mutated by finalized transcript fragments,
/// closed on explicit stop / transport failure / emergency flush. Once
/// closed it is only ever touched again by the reconciliation patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub speaker_id: SpeakerId,
    pub speaker_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub full_transcript: String,
    pub duration_seconds: u64,
    pub building_id: Option<String>,
    pub building_name: Option<String>,
    pub visited_doors: Vec<String>,
}

impl Session {
    pub fn begin(
        speaker: &Speaker,
        building_id: Option<String>,
        building_name: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId(format!("{}_{}", speaker.id, now.timestamp_millis())),
            speaker_id: speaker.id.clone(),
            speaker_name: speaker.name.clone(),
            start_time: now,
            end_time: None,
            full_transcript: String::new(),
            duration_seconds: 0,
            building_id,
            building_name,
            visited_doors: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }

    /// Sets the end time and derives the duration. Idempotent per close.
    pub fn close(&mut self, now: DateTime<Utc>) {
        self.end_time = Some(now);
        self.duration_seconds = (now - self.start_time).num_seconds().max(0) as u64;
    }

    pub fn visit_door(&mut self, label: &str) {
        if !self.visited_doors.iter().any(|d| d == label) {
            self.visited_doors.push(label.to_string());
        }
    }
}
