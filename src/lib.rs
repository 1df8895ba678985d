pub mod acquire;
pub mod capture;
pub mod config;
pub mod error;
pub mod fabric;
pub mod relay;
pub mod session;
pub mod transcript;

// Re-export the types most embedders need
pub use fabric::{ConnId, Fabric, WireEvent};
pub use session::SessionManager;
