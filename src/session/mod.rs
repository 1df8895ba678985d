pub mod lifecycle;
pub mod registry;
pub mod types;

pub use lifecycle::{Phase, SessionHandle, SessionManager, SessionTrigger};
pub use registry::StreamRegistry;
pub use types::{Session, SessionId, Speaker, SpeakerId, SpeakerRole};
