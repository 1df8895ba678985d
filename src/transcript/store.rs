use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::StoreError;
use crate::session::{Session, SessionId};

/// Persistence endpoint for transcription sessions. Consumed, not owned,
/// by this core: the patch operation is conditional at write time.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &Session) -> Result<(), StoreError>;

    /// Saves the current session state. `partial` marks periodic/emergency
    /// backups of still-active sessions.
    async fn save(&self, session: &Session, partial: bool) -> Result<(), StoreError>;

    async fn fetch_transcript(&self, id: &SessionId) -> Result<String, StoreError>;

    /// Overwrites the persisted transcript only if, at write time, it is
    /// still shorter than `transcript`. Returns whether the write happened.
    async fn patch_if_shorter(&self, id: &SessionId, transcript: &str) -> Result<bool, StoreError>;
}

pub struct HttpSessionStore {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct SaveRequest<'a> {
    session: &'a Session,
    partial: bool,
}

#[derive(Deserialize)]
struct TranscriptResponse {
    #[serde(default)]
    full_transcript: String,
}

#[derive(Serialize)]
struct PatchRequest<'a> {
    transcript: &'a str,
}

#[derive(Deserialize)]
struct PatchResponse {
    #[serde(default)]
    patched: bool,
}

impl HttpSessionStore {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.store_url.clone(),
        }
    }
}

#[async_trait]
impl SessionStore for HttpSessionStore {
    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        let response = self
            .client
            .post(format!("{}/sessions", self.base_url))
            .json(session)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn save(&self, session: &Session, partial: bool) -> Result<(), StoreError> {
        let response = self
            .client
            .put(format!("{}/sessions/{}", self.base_url, session.id))
            .json(&SaveRequest { session, partial })
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn fetch_transcript(&self, id: &SessionId) -> Result<String, StoreError> {
        let response = self
            .client
            .get(format!("{}/sessions/{}", self.base_url, id))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(id.clone()));
        }
        let response = ensure_success(response).await?;
        let body: TranscriptResponse = response.json().await?;
        Ok(body.full_transcript)
    }

    async fn patch_if_shorter(&self, id: &SessionId, transcript: &str) -> Result<bool, StoreError> {
        let response = self
            .client
            .patch(format!("{}/sessions/{}/transcript", self.base_url, id))
            .json(&PatchRequest { transcript })
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let body: PatchResponse = response.json().await?;
        Ok(body.patched)
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(StoreError::Endpoint(format!(
            "status {}",
            response.status()
        )))
    }
}

/// In-memory store implementing the same compare-and-swap discipline as
/// the real endpoint. Used by tests and the demo wiring.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    sessions: Arc<Mutex<HashMap<SessionId, Session>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, HashMap<SessionId, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.locked().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.locked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locked().is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        self.locked().insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn save(&self, session: &Session, _partial: bool) -> Result<(), StoreError> {
        self.locked().insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn fetch_transcript(&self, id: &SessionId) -> Result<String, StoreError> {
        self.locked()
            .get(id)
            .map(|s| s.full_transcript.clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn patch_if_shorter(&self, id: &SessionId, transcript: &str) -> Result<bool, StoreError> {
        let mut sessions = self.locked();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        // Conditional at write time: tolerate a concurrent writer having
        // already produced an equal-or-longer transcript.
        if session.full_transcript.chars().count() < transcript.chars().count() {
            session.full_transcript = transcript.to_string();
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
