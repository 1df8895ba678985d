use thiserror::Error;

use crate::fabric::ConnId;
use crate::session::SessionId;

/// Microphone/device failures. Terminal: surfaced to the caller, no retry.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no audio input device available")]
    DeviceUnavailable,
    #[error("unsupported sample rate: {0}")]
    UnsupportedRate(u32),
    #[error("unsupported sample format")]
    UnsupportedFormat,
    #[error("device stream error: {0}")]
    Stream(String),
}

/// Session lifecycle failures surfaced by the manager's control surface.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("previous session still finalizing")]
    Finalizing,
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Acquisition path failures. Recovered locally by the single
/// direct-to-proxy fallback; no further retry after that.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("speech provider credentials missing")]
    MissingCredentials,
    #[error("provider stream failed to open: {0}")]
    OpenFailed(String),
}

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("peer {0} is gone")]
    PeerGone(ConnId),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("persistence endpoint error: {0}")]
    Endpoint(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
