pub mod buffer;
pub mod merge;
pub mod reconcile;
pub mod store;

pub use buffer::{BufferUpdate, TranscriptEngine};
pub use merge::clean_and_merge;
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use store::{HttpSessionStore, InMemoryStore, SessionStore};
