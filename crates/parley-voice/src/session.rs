//! Session controller: one per connection.
//!
//! A session owns its frame queue, a segmentation task that pulls frames and starts
//! turns, and at most one active turn. Speech starting (or new text) cancels the active
//! turn. All outbound events funnel through one channel returned by
//! `SessionFactory::create`.

use crate::audio::{AudioFormat, AudioFrame, FrameAssembler};
use crate::config::{validate_segmenter, SessionConfig, VoiceConfig};
use crate::engines::Backends;
use crate::error::VoiceResult;
use crate::events::{OutboundEvent, SessionPhase};
use crate::frame_queue::{FrameQueue, PushOutcome};
use crate::memory::ConversationMemory;
use crate::metrics::LatencyMetrics;
use crate::segmenter::{SegmentEvent, SegmenterConfig, SpeechSegmenter};
use crate::turn::{TurnInput, TurnOrchestrator};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DIGEST_INTERVAL: usize = 4;

/// Builds sessions from the process-wide pieces (backends, metrics, config).
pub struct SessionFactory {
    orchestrator: TurnOrchestrator,
    format: AudioFormat,
    session: SessionConfig,
    memory_turns: usize,
    segmenter: RwLock<SegmenterConfig>,
    next_id: AtomicU64,
}

impl SessionFactory {
    pub fn new(cfg: &VoiceConfig, backends: Backends, metrics: Arc<LatencyMetrics>) -> Self {
        Self {
            orchestrator: TurnOrchestrator::from_config(cfg, backends, metrics),
            format: cfg.audio,
            session: cfg.session.clone(),
            memory_turns: cfg.llm.memory_turns,
            segmenter: RwLock::new(cfg.segmenter.clone()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn orchestrator(&self) -> &TurnOrchestrator {
        &self.orchestrator
    }

    pub fn metrics(&self) -> &Arc<LatencyMetrics> {
        self.orchestrator.metrics()
    }

    pub fn audio_format(&self) -> AudioFormat {
        self.format
    }

    /// Segmenter knobs applied to sessions created from now on.
    pub fn segmenter_config(&self) -> SegmenterConfig {
        self.segmenter.read().clone()
    }

    pub fn update_segmenter(&self, cfg: SegmenterConfig) -> VoiceResult<()> {
        validate_segmenter(&cfg)?;
        info!(
            "🎚️ Segmenter updated (threshold: {}, min_speech: {}ms, min_silence: {}ms)",
            cfg.threshold, cfg.min_speech_ms, cfg.min_silence_ms
        );
        *self.segmenter.write() = cfg;
        Ok(())
    }

    /// Create a session and spawn its segmentation task. Must be called inside a
    /// Tokio runtime.
    pub fn create(&self) -> (Session, mpsc::UnboundedReceiver<OutboundEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(SessionShared {
            id,
            orchestrator: self.orchestrator.clone(),
            memory: Arc::new(Mutex::new(ConversationMemory::new(
                self.memory_turns,
                DIGEST_INTERVAL,
            ))),
            out_tx,
            out_gate: Mutex::new(()),
            turns: Mutex::new(Vec::new()),
            playback: Mutex::new(None),
            next_turn: AtomicU64::new(1),
        });

        let queue = Arc::new(FrameQueue::new(self.session.queue_capacity));
        let segmenter = SpeechSegmenter::new(
            self.segmenter_config(),
            self.format,
            Arc::clone(&self.orchestrator.backends().vad),
            Arc::clone(self.orchestrator.metrics()),
        );
        let segmentation = tokio::spawn(segmentation_loop(
            Arc::clone(&queue),
            segmenter,
            Arc::clone(&shared),
        ));

        info!("🔌 Session {} started", id);
        shared.send(OutboundEvent::State {
            state: SessionPhase::Idle,
        });

        let session = Session {
            id,
            queue,
            assembler: FrameAssembler::new(self.format),
            shared,
            segmentation: Some(segmentation),
            shutdown_timeout: Duration::from_millis(self.session.shutdown_timeout_ms),
        };
        (session, out_rx)
    }
}

/// A started turn. Turns continuing a forced cut wait behind the turn they extend.
struct TurnSlot {
    id: u64,
    cancel: CancellationToken,
    // Cancelled when the forwarder exits.
    done: CancellationToken,
}

impl TurnSlot {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.done.is_cancelled()
    }
}

struct SessionShared {
    id: u64,
    orchestrator: TurnOrchestrator,
    memory: Arc<Mutex<ConversationMemory>>,
    out_tx: mpsc::UnboundedSender<OutboundEvent>,
    // Held while forwarding a turn event, while cancelling and while starting a
    // turn, so nothing from a cancelled turn is sent after its cancellation.
    out_gate: Mutex<()>,
    // Running turn first, then turns queued behind it.
    turns: Mutex<Vec<TurnSlot>>,
    // Turn whose audio the client may still be playing, and until when.
    playback: Mutex<Option<(u64, Instant)>>,
    next_turn: AtomicU64,
}

impl SessionShared {
    fn send(&self, event: OutboundEvent) {
        let _gate = self.out_gate.lock();
        if self.out_tx.send(event).is_err() {
            debug!("Session {}: outbound channel closed", self.id);
        }
    }

    /// Cancel every live turn and tell the client to stop any playback.
    /// Returns the interrupted turn id, if any.
    fn interrupt(&self) -> Option<u64> {
        let _gate = self.out_gate.lock();
        self.interrupt_locked(&mut self.turns.lock())
    }

    // Caller holds `out_gate`.
    fn interrupt_locked(&self, turns: &mut Vec<TurnSlot>) -> Option<u64> {
        let mut interrupted = None;
        for slot in turns.drain(..) {
            if slot.is_live() {
                interrupted.get_or_insert(slot.id);
            }
            slot.cancel.cancel();
        }
        if let Some((id, until)) = self.playback.lock().take() {
            if until > Instant::now() {
                interrupted.get_or_insert(id);
            }
        }
        if let Some(turn_id) = interrupted {
            info!("✋ Session {}: barge-in interrupted turn {}", self.id, turn_id);
            let _ = self.out_tx.send(OutboundEvent::Interrupted { turn_id });
        }
        interrupted
    }

    /// Start a turn. New input interrupts whatever is live; a continuation queues
    /// behind the turn it extends.
    fn start_turn(self: &Arc<Self>, input: TurnInput, continuation: bool) -> u64 {
        let _gate = self.out_gate.lock();
        let mut turns = self.turns.lock();
        turns.retain(TurnSlot::is_live);

        let after = if continuation {
            turns.last().map(|slot| slot.done.clone())
        } else {
            self.interrupt_locked(&mut turns);
            None
        };

        let id = self.next_turn.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        let shared = Arc::clone(self);
        let token = cancel.clone();
        let finished = done.clone();
        tokio::spawn(async move {
            let _finished = finished.drop_guard();
            if let Some(previous) = after {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = previous.cancelled() => {}
                }
            }
            let mut handle = shared.orchestrator.run_turn(
                id,
                input,
                Arc::clone(&shared.memory),
                token.clone(),
            );
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    event = handle.events.recv() => match event {
                        Some(event) => {
                            if !shared.forward(&token, event) {
                                token.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            match handle.task.await {
                Ok(phase) => debug!("Turn {} ended: {:?}", handle.id, phase),
                Err(e) => warn!("Turn {} task failed: {}", handle.id, e),
            }
        });

        turns.push(TurnSlot { id, cancel, done });
        id
    }

    /// Forward one turn event unless the turn was cancelled. False when the client is gone.
    fn forward(&self, cancel: &CancellationToken, event: OutboundEvent) -> bool {
        let _gate = self.out_gate.lock();
        if cancel.is_cancelled() {
            return true;
        }
        if let OutboundEvent::Audio {
            turn_id,
            duration_ms,
            ..
        } = &event
        {
            let until = Instant::now() + Duration::from_secs_f64(duration_ms.max(0.0) / 1000.0);
            *self.playback.lock() = Some((*turn_id, until));
        }
        self.out_tx.send(event).is_ok()
    }

    fn cancel_active(&self) {
        let _gate = self.out_gate.lock();
        for slot in self.turns.lock().drain(..) {
            slot.cancel.cancel();
        }
    }

    fn live_turns(&self) -> usize {
        self.turns.lock().iter().filter(|slot| slot.is_live()).count()
    }
}

async fn segmentation_loop(
    queue: Arc<FrameQueue>,
    mut segmenter: SpeechSegmenter,
    shared: Arc<SessionShared>,
) {
    while let Some(frame) = queue.pop().await {
        match segmenter.push_frame(frame) {
            Some(SegmentEvent::SpeechStarted { .. }) => {
                shared.interrupt();
                shared.send(OutboundEvent::State {
                    state: SessionPhase::Listening,
                });
            }
            Some(SegmentEvent::Utterance(utterance)) => {
                let turn = shared.start_turn(TurnInput::Audio(utterance), false);
                debug!("Session {}: utterance started turn {}", shared.id, turn);
            }
            Some(SegmentEvent::Continued(utterance)) => {
                let turn = shared.start_turn(TurnInput::Audio(utterance), true);
                debug!("Session {}: continued speech queued turn {}", shared.id, turn);
            }
            Some(SegmentEvent::Discarded { speech_ms }) => {
                debug!(
                    "Session {}: discarded {:.0}ms of speech",
                    shared.id, speech_ms
                );
                shared.send(OutboundEvent::State {
                    state: SessionPhase::Idle,
                });
            }
            None => {}
        }
    }
    if segmenter.anomalies() > 0 {
        warn!(
            "Session {}: {} frames failed VAD",
            shared.id,
            segmenter.anomalies()
        );
    }
    debug!("Session {}: segmentation ended", shared.id);
}

pub struct Session {
    id: u64,
    queue: Arc<FrameQueue>,
    assembler: FrameAssembler,
    shared: Arc<SessionShared>,
    segmentation: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Feed raw PCM16LE bytes. Partial frames are kept for the next call. Returns the
    /// number of whole frames queued.
    pub fn push_audio(&mut self, bytes: &[u8]) -> usize {
        let frames = self.assembler.push_bytes(bytes);
        let count = frames.len();
        for frame in frames {
            self.push_frame(frame);
        }
        count
    }

    pub fn push_frame(&self, frame: AudioFrame) -> PushOutcome {
        self.queue.push(frame)
    }

    /// Start a turn from typed text, cancelling any active turn.
    pub fn submit_text(&self, text: &str) -> Option<u64> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(self.shared.start_turn(TurnInput::Text(text.to_string()), false))
    }

    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.queue.dropped()
    }

    /// Turns started and not yet finished or cancelled (running plus queued).
    pub fn live_turns(&self) -> usize {
        self.shared.live_turns()
    }

    /// Close the queue, cancel the active turn and wait (bounded) for segmentation.
    pub async fn shutdown(mut self) {
        self.queue.close();
        self.shared.cancel_active();

        if let Some(mut task) = self.segmentation.take() {
            if tokio::time::timeout(self.shutdown_timeout, &mut task)
                .await
                .is_err()
            {
                warn!(
                    "Session {}: segmentation did not stop within {:?}, aborting",
                    self.id, self.shutdown_timeout
                );
                task.abort();
            }
        }
        info!(
            "🔌 Session {} closed ({} frames dropped)",
            self.id,
            self.queue.dropped()
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.queue.close();
        self.shared.cancel_active();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VoiceResult;
    use crate::llm::ScriptedLlm;
    use crate::stt::PlaceholderStt;
    use crate::tts::PlaceholderTts;
    use crate::vad::{EnergyVad, VoiceActivity};

    fn factory() -> SessionFactory {
        let cfg = VoiceConfig::default();
        SessionFactory::new(
            &cfg,
            Backends::placeholders(cfg.audio.sample_rate),
            Arc::new(LatencyMetrics::default()),
        )
    }

    fn factory_with(cfg: &VoiceConfig, vad: Arc<dyn VoiceActivity>, llm_delay: Duration) -> SessionFactory {
        let backends = Backends::new(
            vad,
            Arc::new(PlaceholderStt::new()),
            Arc::new(ScriptedLlm::with_delay(llm_delay)),
            Arc::new(PlaceholderTts::new(cfg.audio.sample_rate)),
        );
        SessionFactory::new(cfg, backends, Arc::new(LatencyMetrics::default()))
    }

    #[tokio::test]
    async fn test_text_input_produces_reply() {
        let factory = factory();
        let (session, mut events) = factory.create();
        assert!(session.submit_text("   ").is_none());
        session.submit_text("hello").unwrap();

        let mut seen = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(2), events.recv()).await
        {
            let done = matches!(event, OutboundEvent::TurnComplete { .. });
            seen.push(event.kind());
            if done {
                break;
            }
        }
        assert!(seen.contains(&"emotion"));
        assert!(seen.contains(&"audio"));
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_segmenter_updates_apply_to_new_sessions() {
        let factory = factory();
        let mut cfg = factory.segmenter_config();
        cfg.min_silence_ms = 600;
        factory.update_segmenter(cfg).unwrap();
        assert_eq!(factory.segmenter_config().min_silence_ms, 600);

        let mut bad = factory.segmenter_config();
        bad.threshold = -0.1;
        assert!(factory.update_segmenter(bad).is_err());
        assert_eq!(factory.segmenter_config().threshold, 0.5);
    }

    #[tokio::test]
    async fn test_partial_byte_chunks_are_reassembled() {
        let factory = factory();
        let (mut session, _events) = factory.create();
        let bytes = vec![0u8; 1024 + 100];
        assert_eq!(session.push_audio(&bytes), 1);
        assert_eq!(session.push_audio(&vec![0u8; 924]), 1);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_prompt() {
        let factory = factory();
        let (session, _events) = factory.create();
        let started = Instant::now();
        session.shutdown().await;
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    /// Blocks the calling thread on every frame.
    struct StuckVad(Duration);

    impl VoiceActivity for StuckVad {
        fn score(&self, _frame: &AudioFrame) -> VoiceResult<f32> {
            std::thread::sleep(self.0);
            Ok(0.0)
        }

        fn name(&self) -> &'static str {
            "stuck"
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_aborts_stuck_segmentation_after_timeout() {
        let mut cfg = VoiceConfig::default();
        cfg.session.shutdown_timeout_ms = 50;
        let factory = factory_with(&cfg, Arc::new(StuckVad(Duration::from_millis(800))), Duration::ZERO);
        let (session, _events) = factory.create();

        session.push_frame(AudioFrame::new(vec![0; 512]));
        session.push_frame(AudioFrame::new(vec![0; 512]));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        session.shutdown().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(400), "shutdown took {:?}", elapsed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inputs_leave_one_live_turn() {
        let cfg = VoiceConfig::default();
        let factory = factory_with(&cfg, Arc::new(EnergyVad::default()), Duration::from_millis(300));
        let (session, mut events) = factory.create();
        let session = Arc::new(session);

        let barrier = Arc::new(std::sync::Barrier::new(8));
        let mut tasks = Vec::new();
        for i in 0..8 {
            let session = Arc::clone(&session);
            let barrier = Arc::clone(&barrier);
            tasks.push(tokio::task::spawn_blocking(move || {
                barrier.wait();
                session.submit_text(&format!("message {}", i))
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap());
        }
        ids.sort_unstable();
        let last = *ids.last().unwrap();
        assert_eq!(session.live_turns(), 1);

        let mut interrupted = Vec::new();
        let mut completed = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(2), events.recv()).await
        {
            match event {
                OutboundEvent::Interrupted { turn_id } => interrupted.push(turn_id),
                OutboundEvent::TurnComplete { turn_id, .. } => {
                    completed.push(turn_id);
                    break;
                }
                _ => {}
            }
        }
        interrupted.sort_unstable();
        assert_eq!(completed, vec![last]);
        assert_eq!(interrupted, ids[..ids.len() - 1].to_vec());

        let session = Arc::try_unwrap(session).ok().unwrap();
        session.shutdown().await;
    }
}
