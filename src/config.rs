use std::time::Duration;

/// Tunables for the live capture/transcription core. Defaults mirror the
/// production values; every field can be overridden from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Streaming speech-to-text endpoint (direct path and server relay).
    pub provider_url: String,
    pub provider_api_key: Option<String>,
    /// Persistence endpoint for transcription sessions.
    pub store_url: String,
    /// Shared fabric room for streaming status, transcripts and signaling.
    pub room: String,
    /// Coalescing window for partial transcript updates.
    pub debounce: Duration,
    /// Committed-text cap for the live buffer (chars, left-truncated).
    pub live_max_chars: usize,
    /// Length slack below which reconciliation skips the patch write.
    pub reconcile_slack: usize,
    /// Interval of the server-side partial backup of active sessions.
    pub backup_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider_url: "https://api.deepgram.com/v1/listen".to_string(),
            provider_api_key: None,
            store_url: "http://localhost:3000/api/transcription-history".to_string(),
            room: "audio-streaming".to_string(),
            debounce: Duration::from_millis(150),
            live_max_chars: 8_000,
            reconcile_slack: 10,
            backup_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        if let Ok(url) = std::env::var("SPEECH_PROVIDER_URL") {
            config.provider_url = url;
        }
        if let Ok(key) = std::env::var("DEEPGRAM_API_KEY") {
            config.provider_api_key = Some(key);
        }
        if let Ok(url) = std::env::var("SESSION_STORE_URL") {
            config.store_url = url;
        }
        if let Ok(room) = std::env::var("STREAMING_ROOM") {
            config.room = room;
        }
        if let Some(ms) = env_u64("PARTIAL_DEBOUNCE_MS") {
            config.debounce = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("LIVE_MAX_CHARS") {
            config.live_max_chars = n as usize;
        }
        if let Some(n) = env_u64("RECONCILE_SLACK_CHARS") {
            config.reconcile_slack = n as usize;
        }
        if let Some(secs) = env_u64("BACKUP_INTERVAL_SECS") {
            config.backup_interval = Duration::from_secs(secs);
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
