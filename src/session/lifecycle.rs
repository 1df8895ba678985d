use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::acquire::{AcquisitionSelector, SpeechProvider, TranscriptFragment};
use crate::capture::{AudioChunk, CaptureController};
use crate::config::Config;
use crate::error::SessionError;
use crate::fabric::{ConnId, Fabric, WireEvent};
use crate::relay::SpeakerRelay;
use crate::transcript::{BufferUpdate, Reconciler, SessionStore, TranscriptEngine};

use super::types::{Session, SessionId, Speaker, SpeakerId};

/// Lifecycle phases of the speaker-side session driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Active,
    /// Capture is stopped; waiting for the persisted record so the local
    /// buffers can be reconciled against it.
    Finalizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTrigger {
    Start,
    Stop,
    EmergencyFlush,
    TransportLost,
    Reconciled,
}

impl Phase {
    /// Pure transition function. `None` means the trigger does not apply in
    /// the current phase and must be ignored (re-entrant stops included).
    pub fn transition(self, trigger: SessionTrigger) -> Option<Phase> {
        match (self, trigger) {
            (Phase::Idle, SessionTrigger::Start) => Some(Phase::Active),
            (Phase::Active, SessionTrigger::Stop)
            | (Phase::Active, SessionTrigger::EmergencyFlush)
            | (Phase::Active, SessionTrigger::TransportLost) => Some(Phase::Finalizing),
            (Phase::Finalizing, SessionTrigger::Reconciled) => Some(Phase::Idle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionCommand {
    Stop,
    EmergencyFlush,
}

/// Cheap clonable control surface over a running [`SessionManager`].
#[derive(Clone)]
pub struct SessionHandle {
    speaker_id: SpeakerId,
    capture: CaptureController,
    fabric: Fabric,
    conn: ConnId,
    room: String,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn stop(&self) {
        let _ = self.commands.send(SessionCommand::Stop);
    }

    /// Page-teardown path. Releases the device and announces the flush
    /// synchronously, then queues the lifecycle command; nothing here
    /// awaits or performs a network round-trip.
    pub fn emergency_flush(&self) {
        self.capture.emergency_stop(&self.speaker_id);
        self.fabric.broadcast_from(
            self.conn,
            &self.room,
            WireEvent::EmergencySaveSession {
                speaker_id: self.speaker_id.clone(),
            },
        );
        let _ = self.commands.send(SessionCommand::EmergencyFlush);
    }
}

/// Speaker-side driver: owns capture, acquisition, the live transcript
/// buffers, and the listener relay for one speaker. The persisted session
/// record itself is owned by the registry on the other side of the fabric;
/// this end only reconciles against it once the record is finalized.
pub struct SessionManager {
    speaker: Speaker,
    fabric: Fabric,
    room: String,
    conn: ConnId,
    events: mpsc::UnboundedReceiver<WireEvent>,
    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    capture: CaptureController,
    direct: Arc<dyn SpeechProvider>,
    proxied: Arc<dyn SpeechProvider>,
    store: Arc<dyn SessionStore>,
    engine: TranscriptEngine,
    reconciler: Reconciler,
    relay: SpeakerRelay,
    phase: Phase,
    session: Option<Session>,
    fragments_tx: mpsc::UnboundedSender<TranscriptFragment>,
    fragments: mpsc::UnboundedReceiver<TranscriptFragment>,
    chunks: Option<broadcast::Receiver<AudioChunk>>,
    updates_tx: mpsc::UnboundedSender<BufferUpdate>,
    updates_rx: Option<mpsc::UnboundedReceiver<BufferUpdate>>,
    media_tx: mpsc::UnboundedSender<(ConnId, mpsc::UnboundedReceiver<AudioChunk>)>,
    media_rx: Option<mpsc::UnboundedReceiver<(ConnId, mpsc::UnboundedReceiver<AudioChunk>)>>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        speaker: Speaker,
        fabric: Fabric,
        capture: CaptureController,
        direct: Arc<dyn SpeechProvider>,
        proxied: Arc<dyn SpeechProvider>,
        store: Arc<dyn SessionStore>,
        config: &Config,
    ) -> Self {
        let (conn, events) = fabric.connect();
        fabric.join(conn, &config.room);
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (fragments_tx, fragments) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        Self {
            speaker,
            relay: SpeakerRelay::new(fabric.clone(), conn),
            fabric,
            room: config.room.clone(),
            conn,
            events,
            commands_tx,
            commands,
            capture,
            direct,
            proxied,
            store,
            engine: TranscriptEngine::new(config.debounce, config.live_max_chars),
            reconciler: Reconciler::new(config.reconcile_slack),
            phase: Phase::Idle,
            session: None,
            fragments_tx,
            fragments,
            chunks: None,
            updates_tx,
            updates_rx: Some(updates_rx),
            media_tx,
            media_rx: Some(media_rx),
        }
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session.as_ref().map(|s| &s.id)
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            speaker_id: self.speaker.id.clone(),
            capture: self.capture.clone(),
            fabric: self.fabric.clone(),
            conn: self.conn,
            room: self.room.clone(),
            commands: self.commands_tx.clone(),
        }
    }

    /// Stream of live buffer updates for observer surfaces. Takeable once.
    pub fn updates(&mut self) -> Option<mpsc::UnboundedReceiver<BufferUpdate>> {
        self.updates_rx.take()
    }

    /// Stream of accepted listener media feeds, one receiver per accepted
    /// offer. Takeable once.
    pub fn media(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<(ConnId, mpsc::UnboundedReceiver<AudioChunk>)>> {
        self.media_rx.take()
    }

    /// Begins a recording session. Idempotent while one is active: the
    /// existing session id comes back and no second device stream opens.
    pub fn start(
        &mut self,
        building_id: Option<String>,
        building_name: Option<String>,
        door_label: Option<String>,
    ) -> Result<SessionId, SessionError> {
        if self.phase == Phase::Active {
            if let Some(session) = &self.session {
                debug!(speaker = %self.speaker.id, "session already active");
                return Ok(session.id.clone());
            }
        }
        let Some(next) = self.phase.transition(SessionTrigger::Start) else {
            return Err(SessionError::Finalizing);
        };

        // Device first: a capture failure must leave no announced session.
        let handle = self.capture.start(self.speaker.id.clone(), door_label)?;
        let session = Session::begin(&self.speaker, building_id, building_name);
        self.fabric.broadcast_from(
            self.conn,
            &self.room,
            WireEvent::StartStreaming {
                from: self.conn,
                session: session.clone(),
            },
        );

        let fabric = self.fabric.clone();
        let conn = self.conn;
        let room = self.room.clone();
        let selector = AcquisitionSelector::new(self.direct.clone(), self.proxied.clone())
            .with_publisher(Box::new(move |fragment| {
                fabric.broadcast_from(
                    conn,
                    &room,
                    WireEvent::TranscriptionUpdate(fragment.clone()),
                );
            }));
        selector.spawn(handle.clone(), self.fragments_tx.clone());

        self.chunks = Some(handle.subscribe());
        self.relay.set_streaming(true);
        self.phase = next;
        let id = session.id.clone();
        self.session = Some(session);
        info!(speaker = %self.speaker.id, session = %id, "session started");
        Ok(id)
    }

    /// Drives the session until it has been finalized and reconciled, or
    /// until the fabric connection is lost.
    pub async fn run(&mut self) {
        loop {
            let deadline = self.engine.next_deadline();
            tokio::select! {
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    for update in self.engine.poll_due(Instant::now()) {
                        let _ = self.updates_tx.send(update);
                    }
                }
                fragment = self.fragments.recv() => {
                    if let Some(fragment) = fragment {
                        if let Some(update) = self.engine.apply(&fragment, Instant::now()) {
                            let _ = self.updates_tx.send(update);
                        }
                    }
                }
                chunk = recv_chunk(&mut self.chunks) => match chunk {
                    Ok(chunk) => self.relay.distribute(&chunk),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(speaker = %self.speaker.id, skipped = n, "relay fan-out lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.chunks = None;
                    }
                },
                command = self.commands.recv() => {
                    if let Some(command) = command {
                        self.apply_command(command);
                    }
                }
                event = self.events.recv() => match event {
                    Some(event) => {
                        if self.apply_event(event).await {
                            return;
                        }
                    }
                    None => {
                        self.on_transport_lost().await;
                        return;
                    }
                },
            }
        }
    }

    fn apply_command(&mut self, command: SessionCommand) {
        let trigger = match command {
            SessionCommand::Stop => SessionTrigger::Stop,
            SessionCommand::EmergencyFlush => SessionTrigger::EmergencyFlush,
        };
        let Some(next) = self.phase.transition(trigger) else {
            debug!(?trigger, phase = ?self.phase, "lifecycle trigger ignored");
            return;
        };
        // Emergency flush already released the device synchronously.
        if command == SessionCommand::Stop {
            self.capture.stop(&self.speaker.id);
        }
        self.relay.set_streaming(false);
        self.fabric.broadcast_from(
            self.conn,
            &self.room,
            WireEvent::StopStreaming {
                speaker_id: self.speaker.id.clone(),
            },
        );
        self.phase = next;
        info!(speaker = %self.speaker.id, "session finalizing");
    }

    /// Returns true when the session has fully wound down.
    async fn apply_event(&mut self, event: WireEvent) -> bool {
        match event {
            WireEvent::Signal { to, from, payload } if to == self.conn => {
                if let Some(media) = self.relay.handle(from, payload) {
                    let _ = self.media_tx.send((from, media));
                }
            }
            WireEvent::PeerLeft { conn } => self.relay.on_peer_left(conn),
            WireEvent::TranscriptionSessionCompleted { session }
                if self.phase == Phase::Finalizing
                    && session.speaker_id == self.speaker.id =>
            {
                self.finish(&session.id).await;
                return true;
            }
            _ => {}
        }
        false
    }

    async fn on_transport_lost(&mut self) {
        warn!(speaker = %self.speaker.id, "fabric connection lost");
        if let Some(next) = self.phase.transition(SessionTrigger::TransportLost) {
            self.capture.stop(&self.speaker.id);
            self.relay.set_streaming(false);
            self.phase = next;
        }
        // The registry will finalize on PeerLeft; reconcile against
        // whatever it managed to persist.
        if let Some(session) = &self.session {
            let id = session.id.clone();
            self.finish(&id).await;
        }
    }

    async fn finish(&mut self, session_id: &SessionId) {
        let speaker_id = self.speaker.id.clone();
        let outcome = self
            .reconciler
            .reconcile(&mut self.engine, &speaker_id, session_id, self.store.as_ref())
            .await;
        info!(session = %session_id, ?outcome, "session reconciled");
        if let Some(next) = self.phase.transition(SessionTrigger::Reconciled) {
            self.phase = next;
        }
        self.session = None;
        self.chunks = None;
    }
}

impl Drop for SessionManager {
    /// Releases the fabric connection. Without this, a dropped manager
    /// would leak its sender and room memberships, and peers would never
    /// see the `PeerLeft` that drives their teardown.
    fn drop(&mut self) {
        self.fabric.disconnect(self.conn);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

async fn recv_chunk(
    rx: &mut Option<broadcast::Receiver<AudioChunk>>,
) -> Result<AudioChunk, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
