pub mod links;
pub mod signal;

pub use links::{ListenerLink, SpeakerRelay};
pub use signal::{NegotiationState, SignalPayload, SPEECH_MAX_BITRATE};
