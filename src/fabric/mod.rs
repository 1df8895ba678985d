pub mod bus;
pub mod envelope;
pub mod presence;

pub use bus::{ConnId, Fabric};
pub use envelope::{ActiveStream, WireEvent};
pub use presence::PresenceRegistry;
