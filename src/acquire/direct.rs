use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::AcquireError;
use crate::session::SpeakerId;

use super::fragment::RawFragment;
use super::provider::{SpeechProvider, SpeechStream};

/// Direct path: streams audio straight to the external speech provider
/// over a chunked POST and parses its newline-delimited JSON responses.
pub struct HttpSpeechProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct ProviderMessage {
    #[serde(default)]
    is_final: bool,
    channel: Option<ProviderChannel>,
}

#[derive(Deserialize)]
struct ProviderChannel {
    #[serde(default)]
    alternatives: Vec<ProviderAlternative>,
}

#[derive(Deserialize)]
struct ProviderAlternative {
    #[serde(default)]
    transcript: String,
}

impl HttpSpeechProvider {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.provider_url.clone(),
            api_key: config.provider_api_key.clone(),
        }
    }
}

#[async_trait]
impl SpeechProvider for HttpSpeechProvider {
    async fn open(
        &self,
        speaker_id: &SpeakerId,
        mime_type: &str,
        _context_label: Option<String>,
    ) -> Result<SpeechStream, AcquireError> {
        let api_key = self
            .api_key
            .clone()
            .ok_or(AcquireError::MissingCredentials)?;

        let (sink_tx, sink_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (frag_tx, frag_rx) = mpsc::unbounded_channel();

        let body = reqwest::Body::wrap_stream(
            UnboundedReceiverStream::new(sink_rx).map(Ok::<_, std::io::Error>),
        );

        let url = format!(
            "{}?language=fr&punctuate=true&interim_results=true&diarize=false",
            self.endpoint
        );
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", api_key))
            .header("Content-Type", mime_type)
            .body(body)
            .send()
            .await
            .map_err(|e| AcquireError::OpenFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AcquireError::OpenFailed(format!(
                "provider returned {}",
                response.status()
            )));
        }

        info!(speaker = %speaker_id, "direct provider stream opened");

        // Response parser: NDJSON, one message per line.
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(next) = stream.next().await {
                let bytes = match next {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("provider response error: {}", e);
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(idx) = buffer.find('\n') {
                    let line = buffer[..idx].trim().to_string();
                    buffer.drain(..=idx);
                    if line.is_empty() {
                        continue;
                    }
                    let Ok(msg) = serde_json::from_str::<ProviderMessage>(&line) else {
                        // Non-JSON keepalives and partial lines are expected
                        debug!("ignoring unparseable provider line");
                        continue;
                    };
                    let transcript = msg
                        .channel
                        .and_then(|c| c.alternatives.into_iter().next())
                        .map(|a| a.transcript)
                        .unwrap_or_default();
                    if transcript.is_empty() {
                        continue;
                    }
                    let fragment = RawFragment {
                        transcript,
                        is_final: msg.is_final,
                        timestamp: Utc::now(),
                    };
                    if frag_tx.send(fragment).is_err() {
                        return;
                    }
                }
            }
        });

        Ok(SpeechStream {
            sink: sink_tx,
            fragments: frag_rx,
        })
    }
}
