use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::AcquireError;
use crate::session::SpeakerId;

use super::fragment::RawFragment;

/// An open streaming transcription connection. Audio goes in through
/// `sink`; fragments come back out. Dropping the sink signals end-of-audio
/// upstream; the fragments channel closing means the stream is done.
pub struct SpeechStream {
    pub sink: mpsc::UnboundedSender<Vec<u8>>,
    pub fragments: mpsc::UnboundedReceiver<RawFragment>,
}

/// Opaque external speech-to-text service. Protocol details (framing,
/// auth) stay behind this seam; both the direct and the proxied path
/// implement it.
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    async fn open(
        &self,
        speaker_id: &SpeakerId,
        mime_type: &str,
        context_label: Option<String>,
    ) -> Result<SpeechStream, AcquireError>;
}
