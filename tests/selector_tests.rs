use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use suivi::acquire::{
    AcquisitionSelector, PathState, RawFragment, SpeechProvider, SpeechStream, TranscriptFragment,
};
use suivi::capture::{AudioChunk, AudioSource, CaptureController, CaptureHints};
use suivi::error::{AcquireError, CaptureError};
use suivi::session::SpeakerId;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Device fake: opens successfully, emits nothing, counts acquisitions.
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

/// Provider fake that always refuses to open.
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

/// Provider fake that opens and hands the fragment sender to the test.
#[derive(Default)]
struct ManualProvider {
    opens: AtomicUsize,
    slot: Mutex<Option<mpsc::UnboundedSender<RawFragment>>>,
}

impl ManualProvider {
    fn sender(&self) -> Option<mpsc::UnboundedSender<RawFragment>> {
        self.slot.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechProvider for ManualProvider {
    async fn open(
        &self,
        _speaker_id: &SpeakerId,
        _mime_type: &str,
        _context_label: Option<String>,
    ) -> Result<SpeechStream, AcquireError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (frag_tx, frag_rx) = mpsc::unbounded_channel();
        let (sink_tx, _sink_rx) = mpsc::unbounded_channel();
        *self.slot.lock().unwrap() = Some(frag_tx);
        Ok(SpeechStream {
            sink: sink_tx,
            fragments: frag_rx,
        })
    }
}

/// Provider fake whose fragment stream closes before ever emitting.
struct ClosedProvider;

#[async_trait]
impl SpeechProvider for ClosedProvider {
    async fn open(
        &self,
        _speaker_id: &SpeakerId,
        _mime_type: &str,
        _context_label: Option<String>,
    ) -> Result<SpeechStream, AcquireError> {
        let (_frag_tx, frag_rx) = mpsc::unbounded_channel();
        let (sink_tx, _sink_rx) = mpsc::unbounded_channel();
        Ok(SpeechStream {
            sink: sink_tx,
            fragments: frag_rx,
        })
    }
}

fn raw(text: &str, is_final: bool) -> RawFragment {
    RawFragment {
        transcript: text.to_string(),
        is_final,
        timestamp: Utc::now(),
    }
}

async fn wait_for_sender(provider: &ManualProvider) -> mpsc::UnboundedSender<RawFragment> {
    for _ in 0..50 {
        if let Some(tx) = provider.sender() {
            return tx;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("provider was never opened");
}

async fn wait_for_state(rx: &mut tokio::sync::watch::Receiver<PathState>, wanted: PathState) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if *rx.borrow() == wanted {
                return;
            }
            if rx.changed().await.is_err() {
                panic!("state channel closed before reaching {:?}", wanted);
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {:?}", wanted));
}

#[tokio::test]
async fn direct_path_fragments_are_normalized_and_forwarded() {
    let capture = CaptureController::new(Arc::new(ScriptSource::default()));
    let handle = capture.start(SpeakerId::from("a"), None).unwrap();

    let direct = Arc::new(ManualProvider::default());
    let selector = AcquisitionSelector::new(direct.clone(), Arc::new(FailProvider));
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<TranscriptFragment>();
    let mut acquisition = selector.spawn(handle, out_tx);

    wait_for_state(&mut acquisition.state, PathState::DirectActive).await;
    let frag_tx = wait_for_sender(&direct).await;

    frag_tx.send(raw("  bonjour   madame ", false)).unwrap();
    frag_tx.send(raw("   ", true)).unwrap();
    frag_tx.send(raw("bonjour madame", true)).unwrap();

    let first = out_rx.recv().await.expect("first fragment");
    assert_eq!(
        first.transcript, "bonjour madame",
        "whitespace must be collapsed"
    );
    assert!(!first.is_final);

    let second = out_rx.recv().await.expect("second fragment");
    assert!(
        second.is_final,
        "the blank fragment must be dropped, not forwarded"
    );
    assert_eq!(second.transcript, "bonjour madame");
}

#[tokio::test]
async fn open_failure_falls_back_to_the_proxied_path() {
    let capture = CaptureController::new(Arc::new(ScriptSource::default()));
    let handle = capture.start(SpeakerId::from("a"), None).unwrap();

    let proxied = Arc::new(ManualProvider::default());
    let selector = AcquisitionSelector::new(Arc::new(FailProvider), proxied.clone());
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<TranscriptFragment>();
    let mut acquisition = selector.spawn(handle, out_tx);

    wait_for_state(&mut acquisition.state, PathState::ProxyActive).await;

    let frag_tx = wait_for_sender(&proxied).await;
    frag_tx.send(raw("relayed", true)).unwrap();

    let fragment = out_rx.recv().await.expect("fragment over the fallback path");
    assert_eq!(fragment.transcript, "relayed");
}

#[tokio::test]
async fn stream_closing_before_first_fragment_falls_back() {
    let capture = CaptureController::new(Arc::new(ScriptSource::default()));
    let handle = capture.start(SpeakerId::from("a"), None).unwrap();

    let proxied = Arc::new(ManualProvider::default());
    let selector = AcquisitionSelector::new(Arc::new(ClosedProvider), proxied.clone());
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<TranscriptFragment>();
    let mut acquisition = selector.spawn(handle, out_tx);

    wait_for_state(&mut acquisition.state, PathState::ProxyActive).await;

    let frag_tx = wait_for_sender(&proxied).await;
    frag_tx.send(raw("recovered", true)).unwrap();

    let fragment = out_rx.recv().await.expect("fragment after silent failure");
    assert_eq!(fragment.transcript, "recovered");
}

#[tokio::test]
async fn no_fallback_once_a_fragment_was_received() {
    let capture = CaptureController::new(Arc::new(ScriptSource::default()));
    let handle = capture.start(SpeakerId::from("a"), None).unwrap();

    let direct = Arc::new(ManualProvider::default());
    let proxied = Arc::new(ManualProvider::default());
    let selector = AcquisitionSelector::new(direct.clone(), proxied.clone());
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<TranscriptFragment>();
    let mut acquisition = selector.spawn(handle, out_tx);

    wait_for_state(&mut acquisition.state, PathState::DirectActive).await;
    let frag_tx = wait_for_sender(&direct).await;
    frag_tx.send(raw("premier", true)).unwrap();
    let _ = out_rx.recv().await.expect("first fragment");

    // Mid-stream death, after data flowed: the acquisition must end rather
    // than restart on the other path.
    drop(frag_tx);
    *direct.slot.lock().unwrap() = None;

    wait_for_state(&mut acquisition.state, PathState::Stopped).await;
    assert_eq!(
        proxied.opens.load(Ordering::SeqCst),
        0,
        "mid-stream failure must not trigger the proxy fallback"
    );
}

#[tokio::test]
async fn capture_start_is_idempotent_per_speaker() {
    let source = Arc::new(ScriptSource::default());
    let capture = CaptureController::new(source.clone());
    let speaker = SpeakerId::from("a");

    capture.start(speaker.clone(), None).unwrap();
    capture.start(speaker.clone(), None).unwrap();

    assert_eq!(
        source.opens.load(Ordering::SeqCst),
        1,
        "a second start while active must not reacquire the device"
    );
    assert!(capture.is_active(&speaker));

    capture.stop(&speaker);
    assert!(!capture.is_active(&speaker));

    capture.start(speaker.clone(), None).unwrap();
    assert_eq!(
        source.opens.load(Ordering::SeqCst),
        2,
        "a start after stop opens the device again"
    );
}
