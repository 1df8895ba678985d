use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::capture::CaptureHandle;

use super::fragment::{FragmentNormalizer, TranscriptFragment};
use super::provider::SpeechProvider;

/// Dual acquisition paths as a closed variant, with a single transition
/// `Direct -> Proxied` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionPath {
    Direct,
    Proxied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Unstarted,
    DirectAttempt,
    DirectActive,
    ProxyActive,
    Stopped,
}

/// Callback invoked for each normalized fragment produced by the direct
/// path (the proxy relay already broadcasts its own).
pub type UpdateSink = Box<dyn Fn(&TranscriptFragment) + Send + Sync>;

const MIME_TYPE: &str = "audio/l16;rate=48000";

pub struct AcquisitionSelector {
    direct: Arc<dyn SpeechProvider>,
    proxied: Arc<dyn SpeechProvider>,
    publish: Option<UpdateSink>,
}

/// Handle on a running acquisition; `state` tracks the path state machine.
pub struct Acquisition {
    pub state: watch::Receiver<PathState>,
    pub task: JoinHandle<()>,
}

impl AcquisitionSelector {
    pub fn new(direct: Arc<dyn SpeechProvider>, proxied: Arc<dyn SpeechProvider>) -> Self {
        Self {
            direct,
            proxied,
            publish: None,
        }
    }

    pub fn with_publisher(mut self, publish: UpdateSink) -> Self {
        self.publish = Some(publish);
        self
    }

    /// Starts acquisition for one capture. Normalized fragments are sent to
    /// `out`; the task ends when the provider stream closes after capture
    /// stops, or when both paths have failed.
    pub fn spawn(
        self,
        handle: CaptureHandle,
        out: mpsc::UnboundedSender<TranscriptFragment>,
    ) -> Acquisition {
        let (state_tx, state_rx) = watch::channel(PathState::Unstarted);
        let task = tokio::spawn(run_acquisition(self, handle, out, state_tx));
        Acquisition {
            state: state_rx,
            task,
        }
    }
}

async fn run_acquisition(
    selector: AcquisitionSelector,
    handle: CaptureHandle,
    out: mpsc::UnboundedSender<TranscriptFragment>,
    state: watch::Sender<PathState>,
) {
    let speaker = handle.speaker_id.clone();
    let context = handle.context_label.clone();

    let _ = state.send(PathState::DirectAttempt);
    let mut path = AcquisitionPath::Direct;

    let stream = match selector.direct.open(&speaker, MIME_TYPE, context.clone()).await {
        Ok(s) => {
            let _ = state.send(PathState::DirectActive);
            s
        }
        Err(e) => {
            // Exactly one fallback attempt, before any fragment was received
            warn!(%speaker, error = %e, "direct path failed to open, falling back to proxy");
            match selector.proxied.open(&speaker, MIME_TYPE, context.clone()).await {
                Ok(s) => {
                    path = AcquisitionPath::Proxied;
                    let _ = state.send(PathState::ProxyActive);
                    s
                }
                Err(e) => {
                    error!(%speaker, error = %e, "both acquisition paths failed");
                    let _ = state.send(PathState::Stopped);
                    return;
                }
            }
        }
    };

    let mut chunks = handle.subscribe();
    // Holding the handle would keep the chunk channel open past capture
    // stop; everything needed from it was cloned above.
    drop(handle);
    let mut sink = Some(stream.sink);
    let mut fragments = stream.fragments;
    let mut normalizer = FragmentNormalizer::new(speaker.clone());
    let mut received_any = false;

    loop {
        tokio::select! {
            chunk = chunks.recv(), if sink.is_some() => match chunk {
                Ok(c) => {
                    if let Some(s) = &sink {
                        let _ = s.send(c.data);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(%speaker, skipped = n, "audio fan-out lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // Capture ended: dropping the sink flushes the provider
                    sink = None;
                }
            },
            fragment = fragments.recv() => match fragment {
                Some(raw) => {
                    received_any = true;
                    if let Some(f) = normalizer.normalize(raw, None, context.clone()) {
                        if path == AcquisitionPath::Direct {
                            if let Some(publish) = &selector.publish {
                                publish(&f);
                            }
                        }
                        if out.send(f).is_err() {
                            break;
                        }
                    }
                }
                None => {
                    if !received_any && path == AcquisitionPath::Direct {
                        warn!(%speaker, "direct stream closed before first fragment, switching to proxy");
                        match selector.proxied.open(&speaker, MIME_TYPE, context.clone()).await {
                            Ok(s) => {
                                path = AcquisitionPath::Proxied;
                                let _ = state.send(PathState::ProxyActive);
                                if sink.is_some() {
                                    sink = Some(s.sink);
                                }
                                fragments = s.fragments;
                                continue;
                            }
                            Err(e) => {
                                error!(%speaker, error = %e, "proxy fallback failed");
                                break;
                            }
                        }
                    }
                    break;
                }
            },
        }
    }

    let _ = state.send(PathState::Stopped);
}
