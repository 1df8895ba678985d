pub mod controller;
pub mod device;

pub use controller::{
    AudioChunk, AudioSource, CaptureController, CaptureHandle, CaptureHints, CHUNK_FRAME_MS,
};
pub use device::CpalSource;
