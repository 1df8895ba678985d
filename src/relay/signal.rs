use serde::{Deserialize, Serialize};

/// Audio bitrate cap applied when a listener link is negotiated, in bits
/// per second. Speech stays intelligible well below music bitrates.
pub const SPEECH_MAX_BITRATE: u32 = 32_000;

/// Negotiation message bodies carried inside a fabric `Signal` event.
/// Session descriptions are opaque strings to both the fabric and the
/// relay; only the two endpoints interpret them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    /// `None` marks end-of-candidates.
    Candidate { candidate: Option<String> },
    /// Orderly listener departure, distinct from transport loss.
    Leave,
}

/// Listener-side negotiation progress. Candidates arriving before the
/// answer are buffered, not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    OfferSent,
    AnswerReceived,
    Connected,
}
