use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use suivi::acquire::{RawFragment, SpeechProvider, SpeechStream, TranscriptFragment};
use suivi::capture::{AudioChunk, AudioSource, CaptureController, CaptureHints};
use suivi::config::Config;
use suivi::error::{AcquireError, CaptureError, SessionError};
use suivi::fabric::Fabric;
use suivi::session::{
    Phase, Session, SessionManager, SessionTrigger, Speaker, SpeakerId, SpeakerRole, StreamRegistry,
};
use suivi::transcript::{
    BufferUpdate, InMemoryStore, ReconcileOutcome, Reconciler, SessionStore, TranscriptEngine,
};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct ScriptSource {
    opens: AtomicUsize,
}

impl AudioSource for ScriptSource {
    fn open(
        &self,
        _hints: &CaptureHints,
        _sink: broadcast::Sender<AudioChunk>,
        _cancel: CancellationToken,
    ) -> Result<(), CaptureError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FailProvider;

#[async_trait]
impl SpeechProvider for FailProvider {
    async fn open(
        &self,
        _speaker_id: &SpeakerId,
        _mime_type: &str,
        _context_label: Option<String>,
    ) -> Result<SpeechStream, AcquireError> {
        Err(AcquireError::OpenFailed("unreachable".to_string()))
    }
}

#[derive(Default)]
struct ManualProvider {
    slot: Mutex<Option<mpsc::UnboundedSender<RawFragment>>>,
}

#[async_trait]
impl SpeechProvider for ManualProvider {
    async fn open(
        &self,
        _speaker_id: &SpeakerId,
        _mime_type: &str,
        _context_label: Option<String>,
    ) -> Result<SpeechStream, AcquireError> {
        let (frag_tx, frag_rx) = mpsc::unbounded_channel();
        let (sink_tx, _sink_rx) = mpsc::unbounded_channel();
        *self.slot.lock().unwrap() = Some(frag_tx);
        Ok(SpeechStream {
            sink: sink_tx,
            fragments: frag_rx,
        })
    }
}

async fn wait_for_sender(provider: &ManualProvider) -> mpsc::UnboundedSender<RawFragment> {
    for _ in 0..100 {
        if let Some(tx) = provider.slot.lock().unwrap().clone() {
            return tx;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("provider was never opened");
}

fn raw(text: &str, is_final: bool) -> RawFragment {
    RawFragment {
        transcript: text.to_string(),
        is_final,
        timestamp: Utc::now(),
    }
}

fn fragment(speaker: &str, text: &str, is_final: bool) -> TranscriptFragment {
    TranscriptFragment {
        speaker_id: SpeakerId::from(speaker),
        transcript: text.to_string(),
        is_final,
        timestamp: Utc::now(),
        door_id: None,
        door_label: None,
    }
}

fn agent(id: &str, name: &str) -> Speaker {
    Speaker {
        id: SpeakerId::from(id),
        name: name.to_string(),
        role: SpeakerRole::Commercial,
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.debounce = Duration::from_millis(20);
    config.backup_interval = Duration::from_secs(3600);
    config
}

#[test]
fn phase_transition_table() {
    use Phase::*;
    use SessionTrigger::*;

    assert_eq!(Idle.transition(Start), Some(Active));
    assert_eq!(Active.transition(Stop), Some(Finalizing));
    assert_eq!(Active.transition(EmergencyFlush), Some(Finalizing));
    assert_eq!(Active.transition(TransportLost), Some(Finalizing));
    assert_eq!(Finalizing.transition(Reconciled), Some(Idle));

    // Everything else is a no-op, re-entrant triggers included
    assert_eq!(Idle.transition(Stop), None);
    assert_eq!(Idle.transition(Reconciled), None);
    assert_eq!(Active.transition(Start), None);
    assert_eq!(Active.transition(Reconciled), None);
    assert_eq!(Finalizing.transition(Start), None);
    assert_eq!(Finalizing.transition(Stop), None);
    assert_eq!(Finalizing.transition(EmergencyFlush), None);
}

#[tokio::test]
async fn reconcile_patches_when_local_is_meaningfully_longer() {
    let store = InMemoryStore::new();
    let mut session = Session::begin(&agent("a", "Marc"), None, None);
    session.full_transcript = "bonjour".to_string();
    store.create(&session).await.unwrap();

    let mut engine = TranscriptEngine::new(Duration::from_millis(150), 8_000);
    engine.apply(
        &fragment("a", "bonjour je suis marc du service gaz", true),
        Instant::now(),
    );

    let reconciler = Reconciler::new(10);
    let outcome = reconciler
        .reconcile(&mut engine, &SpeakerId::from("a"), &session.id, &store)
        .await;

    assert!(
        matches!(outcome, ReconcileOutcome::Patched { .. }),
        "a meaningfully longer local transcript must win: {:?}",
        outcome
    );
    assert_eq!(
        store.get(&session.id).unwrap().full_transcript,
        "bonjour je suis marc du service gaz"
    );
    assert_eq!(
        engine.snapshot(&SpeakerId::from("a")),
        "",
        "buffers must be cleared after reconciliation"
    );
}

#[tokio::test]
async fn reconcile_skips_within_the_slack() {
    let store = InMemoryStore::new();
    let mut session = Session::begin(&agent("a", "Marc"), None, None);
    session.full_transcript = "bonjour je suis marc".to_string();
    store.create(&session).await.unwrap();

    let mut engine = TranscriptEngine::new(Duration::from_millis(150), 8_000);
    engine.apply(&fragment("a", "bonjour je suis marc !", true), Instant::now());

    let reconciler = Reconciler::new(10);
    let outcome = reconciler
        .reconcile(&mut engine, &SpeakerId::from("a"), &session.id, &store)
        .await;

    assert!(
        matches!(outcome, ReconcileOutcome::Skipped { .. }),
        "within the slack the persisted text stands: {:?}",
        outcome
    );
    assert_eq!(
        store.get(&session.id).unwrap().full_transcript,
        "bonjour je suis marc",
        "a skipped reconciliation must not write"
    );
    assert_eq!(engine.snapshot(&SpeakerId::from("a")), "");
}

#[tokio::test]
async fn reconcile_snapshot_carries_the_trailing_partial() {
    let store = InMemoryStore::new();
    let session = Session::begin(&agent("a", "Marc"), None, None);
    store.create(&session).await.unwrap();

    let mut engine = TranscriptEngine::new(Duration::from_millis(150), 8_000);
    engine.apply(&fragment("a", "bonjour je suis", true), Instant::now());
    // Speech cut off mid-sentence: never finalized
    engine.apply(&fragment("a", "marc du gaz", false), Instant::now());

    let reconciler = Reconciler::new(10);
    let outcome = reconciler
        .reconcile(&mut engine, &SpeakerId::from("a"), &session.id, &store)
        .await;

    assert!(matches!(outcome, ReconcileOutcome::Patched { .. }));
    assert_eq!(
        store.get(&session.id).unwrap().full_transcript,
        "bonjour je suis marc du gaz",
        "the unfinalized partial must not be lost"
    );
}

#[tokio::test]
async fn reconcile_reports_fetch_failure_and_still_clears() {
    let store = InMemoryStore::new();
    let mut engine = TranscriptEngine::new(Duration::from_millis(150), 8_000);
    engine.apply(&fragment("a", "bonjour", true), Instant::now());

    let reconciler = Reconciler::new(10);
    let missing = suivi::session::SessionId("nope_0".to_string());
    let outcome = reconciler
        .reconcile(&mut engine, &SpeakerId::from("a"), &missing, &store)
        .await;

    assert_eq!(outcome, ReconcileOutcome::FetchFailed);
    assert_eq!(
        engine.snapshot(&SpeakerId::from("a")),
        "",
        "buffers are cleared even when the round-trip fails"
    );
}

#[tokio::test]
async fn patch_is_conditional_at_write_time() {
    let store = InMemoryStore::new();
    let mut session = Session::begin(&agent("a", "Marc"), None, None);
    session.full_transcript = "a much longer transcript already persisted".to_string();
    store.create(&session).await.unwrap();

    let patched = store.patch_if_shorter(&session.id, "short").await.unwrap();
    assert!(!patched, "a shorter candidate must never overwrite");
    assert_eq!(
        store.get(&session.id).unwrap().full_transcript,
        "a much longer transcript already persisted"
    );
}

#[tokio::test]
async fn full_session_stop_persists_and_reconciles() {
    let fabric = Fabric::new();
    let store = Arc::new(InMemoryStore::new());
    let config = test_config();

    let registry = StreamRegistry::new(fabric.clone(), store.clone(), &config);
    tokio::spawn(registry.run());

    let capture = CaptureController::new(Arc::new(ScriptSource::default()));
    let direct = Arc::new(ManualProvider::default());
    let mut manager = SessionManager::new(
        agent("agent-7", "Marc"),
        fabric.clone(),
        capture,
        direct.clone(),
        Arc::new(FailProvider),
        store.clone(),
        &config,
    );
    let handle = manager.handle();
    let mut updates = manager.updates().expect("updates takeable once");

    let session_id = manager
        .start(
            Some("b-12".to_string()),
            Some("Residence des Lilas".to_string()),
            Some("Porte 12".to_string()),
        )
        .unwrap();
    assert_eq!(manager.phase(), Phase::Active);

    // Idempotent: a second start returns the same session
    let again = manager.start(None, None, None).unwrap();
    assert_eq!(again, session_id);

    let task = tokio::spawn(async move {
        manager.run().await;
        manager
    });

    let frag_tx = wait_for_sender(&direct).await;
    frag_tx.send(raw("Bonjour je s", false)).unwrap();
    frag_tx.send(raw("Bonjour je suis", false)).unwrap();
    frag_tx.send(raw("Bonjour je suis Marc.", true)).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.stop();

    let manager = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("session must wind down")
        .unwrap();
    assert_eq!(manager.phase(), Phase::Idle);
    assert!(manager.session_id().is_none());

    let committed = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match updates.recv().await {
                Some(BufferUpdate::Committed { text, .. }) => return text,
                Some(BufferUpdate::Partial { .. }) => continue,
                None => panic!("updates closed before a commit"),
            }
        }
    })
    .await
    .expect("a committed update must surface");
    assert_eq!(committed, "Bonjour je suis Marc.");

    let stored = store.get(&session_id).expect("session persisted");
    assert_eq!(stored.full_transcript, "Bonjour je suis Marc.");
    assert!(stored.end_time.is_some(), "the record must be closed");
    assert_eq!(stored.building_id.as_deref(), Some("b-12"));
    assert_eq!(stored.visited_doors, vec!["Porte 12".to_string()]);
}

#[tokio::test]
async fn abrupt_disconnect_after_a_final_keeps_the_exact_text() {
    let fabric = Fabric::new();
    let store = Arc::new(InMemoryStore::new());
    let config = test_config();

    let registry = StreamRegistry::new(fabric.clone(), store.clone(), &config);
    tokio::spawn(registry.run());

    // Passive observer in the room, watching for the completion broadcast
    let (observer, mut observer_rx) = fabric.connect();
    fabric.join(observer, &config.room);

    let capture = CaptureController::new(Arc::new(ScriptSource::default()));
    let direct = Arc::new(ManualProvider::default());
    let mut manager = SessionManager::new(
        agent("agent-7", "Marc"),
        fabric.clone(),
        capture,
        direct.clone(),
        Arc::new(FailProvider),
        store.clone(),
        &config,
    );
    let handle = manager.handle();
    let session_id = manager.start(None, None, None).unwrap();

    let task = tokio::spawn(async move {
        manager.run().await;
        manager
    });

    let frag_tx = wait_for_sender(&direct).await;
    frag_tx.send(raw("Bonjour je s", false)).unwrap();
    frag_tx.send(raw("Bonjour je suis", false)).unwrap();
    frag_tx.send(raw("Bonjour je suis Marc.", true)).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The page is torn down without an orderly stop
    handle.emergency_flush();

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("session must wind down")
        .unwrap();

    let stored = store.get(&session_id).expect("session persisted");
    assert_eq!(
        stored.full_transcript, "Bonjour je suis Marc.",
        "the finalized text survives the abrupt disconnect exactly"
    );

    let completed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match observer_rx.recv().await {
                Some(suivi::fabric::WireEvent::TranscriptionSessionCompleted { session }) => {
                    return session
                }
                Some(_) => continue,
                None => panic!("fabric closed before the completion broadcast"),
            }
        }
    })
    .await
    .expect("completion must be broadcast to the room");
    assert_eq!(completed.id, session_id);
}

#[tokio::test]
async fn dropped_managers_release_their_fabric_connections() {
    let fabric = Fabric::new();
    let store = Arc::new(InMemoryStore::new());
    let config = test_config();

    let managers: Vec<SessionManager> = (0..3)
        .map(|i| {
            SessionManager::new(
                agent(&format!("agent-{i}"), "Marc"),
                fabric.clone(),
                CaptureController::new(Arc::new(ScriptSource::default())),
                Arc::new(ManualProvider::default()),
                Arc::new(FailProvider),
                store.clone(),
                &config,
            )
        })
        .collect();
    assert_eq!(fabric.members(&config.room).len(), 3);

    drop(managers);

    assert!(
        fabric.members(&config.room).is_empty(),
        "dropped managers must not leave connections behind in the room"
    );
}

#[tokio::test]
async fn speaker_drop_finalizes_the_session_server_side() {
    let fabric = Fabric::new();
    let store = Arc::new(InMemoryStore::new());
    let config = test_config();

    let registry = StreamRegistry::new(fabric.clone(), store.clone(), &config);
    tokio::spawn(registry.run());

    let mut manager = SessionManager::new(
        agent("agent-7", "Marc"),
        fabric.clone(),
        CaptureController::new(Arc::new(ScriptSource::default())),
        Arc::new(ManualProvider::default()),
        Arc::new(FailProvider),
        store.clone(),
        &config,
    );
    let session_id = manager.start(None, None, None).unwrap();

    // The client process dies without any stop or flush
    drop(manager);

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(session) = store.get(&session_id) {
                if session.end_time.is_some() {
                    return session;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("the registry must finalize the orphaned session");
    assert!(closed.end_time.is_some());
}

#[tokio::test]
async fn start_is_refused_while_finalizing() {
    let fabric = Fabric::new();
    let store = Arc::new(InMemoryStore::new());
    let config = test_config();

    // No registry: the completion event never arrives, so the manager
    // stays in Finalizing after the stop.
    let mut manager = SessionManager::new(
        agent("agent-7", "Marc"),
        fabric.clone(),
        CaptureController::new(Arc::new(ScriptSource::default())),
        Arc::new(ManualProvider::default()),
        Arc::new(FailProvider),
        store.clone(),
        &config,
    );
    let handle = manager.handle();
    manager.start(None, None, None).unwrap();
    handle.stop();

    let _ = tokio::time::timeout(Duration::from_millis(200), manager.run()).await;
    assert_eq!(manager.phase(), Phase::Finalizing);

    let err = manager.start(None, None, None).unwrap_err();
    assert!(
        matches!(err, SessionError::Finalizing),
        "a start during finalization must be refused as such: {:?}",
        err
    );
}

#[tokio::test]
async fn emergency_flush_saves_the_unfinalized_partial() {
    let fabric = Fabric::new();
    let store = Arc::new(InMemoryStore::new());
    let config = test_config();

    let registry = StreamRegistry::new(fabric.clone(), store.clone(), &config);
    tokio::spawn(registry.run());

    let capture = CaptureController::new(Arc::new(ScriptSource::default()));
    let direct = Arc::new(ManualProvider::default());
    let mut manager = SessionManager::new(
        agent("agent-7", "Marc"),
        fabric.clone(),
        capture.clone(),
        direct.clone(),
        Arc::new(FailProvider),
        store.clone(),
        &config,
    );
    let handle = manager.handle();
    let session_id = manager.start(None, None, None).unwrap();

    let task = tokio::spawn(async move {
        manager.run().await;
        manager
    });

    let frag_tx = wait_for_sender(&direct).await;
    // The agent is cut off mid-sentence: nothing was ever finalized
    frag_tx
        .send(raw("Bonjour je suis Marc du service", false))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    handle.emergency_flush();
    assert!(
        !capture.is_active(&SpeakerId::from("agent-7")),
        "the device must be released synchronously"
    );

    let manager = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("session must wind down")
        .unwrap();
    assert_eq!(manager.phase(), Phase::Idle);

    let stored = store.get(&session_id).expect("session persisted");
    assert_eq!(
        stored.full_transcript, "Bonjour je suis Marc du service",
        "reconciliation must recover the partial the server never saw"
    );
    assert!(stored.end_time.is_some());
}
