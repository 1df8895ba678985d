use tracing::{info, warn};

use crate::session::{SessionId, SpeakerId};

use super::buffer::TranscriptEngine;
use super::store::SessionStore;

/// Explicit result of the best-effort reconciliation round-trip. Failures
/// are reported, not retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The persisted text was still shorter and got overwritten.
    Patched { local_len: usize, server_len: usize },
    /// The conditional write was refused: a concurrent writer produced an
    /// equal-or-longer transcript first.
    ServerRetained { local_len: usize, server_len: usize },
    /// Local and persisted lengths were within the slack tolerance.
    Skipped { local_len: usize, server_len: usize },
    FetchFailed,
    PatchFailed,
}

pub struct Reconciler {
    slack: usize,
}

impl Reconciler {
    pub fn new(slack: usize) -> Self {
        Self { slack }
    }

    /// Reconciles the client-held text against the persisted record.
    ///
    /// ORDERING INVARIANT: the snapshot is captured before anything is
    /// cleared, and the buffers are cleared in every exit path only after
    /// the round-trip completed or failed. Clearing first would lose the
    /// last unfinalized partial segment irrecoverably.
    pub async fn reconcile(
        &self,
        engine: &mut TranscriptEngine,
        speaker_id: &SpeakerId,
        session_id: &SessionId,
        store: &dyn SessionStore,
    ) -> ReconcileOutcome {
        // 1. Snapshot (committed + partial) before clearing
        let local = engine.snapshot(speaker_id);
        let outcome = self.run(&local, session_id, store).await;
        // 4. Clear only after the round-trip, success or failure
        engine.clear(speaker_id);
        outcome
    }

    async fn run(
        &self,
        local: &str,
        session_id: &SessionId,
        store: &dyn SessionStore,
    ) -> ReconcileOutcome {
        // 2. Fetch the authoritative persisted transcript
        let server = match store.fetch_transcript(session_id).await {
            Ok(text) => text,
            Err(e) => {
                warn!(session = %session_id, error = %e, "reconciliation fetch failed");
                return ReconcileOutcome::FetchFailed;
            }
        };

        let local_len = local.chars().count();
        let server_len = server.chars().count();

        // 3. Patch-if-shorter, with slack so whitespace drift does not churn.
        // Length is a heuristic for completeness here, not a guarantee.
        if local_len <= server_len + self.slack {
            info!(
                session = %session_id,
                local_len, server_len, "reconciliation not needed"
            );
            return ReconcileOutcome::Skipped {
                local_len,
                server_len,
            };
        }

        match store.patch_if_shorter(session_id, local).await {
            Ok(true) => {
                info!(session = %session_id, local_len, server_len, "persisted transcript patched");
                ReconcileOutcome::Patched {
                    local_len,
                    server_len,
                }
            }
            Ok(false) => ReconcileOutcome::ServerRetained {
                local_len,
                server_len,
            },
            Err(e) => {
                warn!(session = %session_id, error = %e, "reconciliation patch failed");
                ReconcileOutcome::PatchFailed
            }
        }
    }
}
