//! Turn orchestration: one cancelable transcribe → generate → synthesize → deliver
//! pipeline per utterance or text input.
//!
//! `TurnOrchestrator::run_turn` spawns the pipeline and returns a `TurnHandle` carrying
//! the event stream, a phase watch and the cancellation token. Cancelling drops the
//! in-flight stage future; once the token fires nothing else is emitted.

use crate::audio::Utterance;
use crate::config::VoiceConfig;
use crate::engines::Backends;
use crate::error::{VoiceError, VoiceResult};
use crate::events::{OutboundEvent, SessionPhase};
use crate::knowledge::KnowledgeBase;
use crate::llm::{clean_utterance, fallback_reply, AgentReply, PromptBuilder};
use crate::memory::ConversationMemory;
use crate::metrics::{LatencyMetrics, LatencyStage};
use crate::tts::estimate_phonemes;
use base64::Engine as _;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Transcribing,
    Generating,
    Synthesizing,
    Delivering,
    Done,
    Cancelled,
    Failed,
}

impl TurnPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnPhase::Done | TurnPhase::Cancelled | TurnPhase::Failed
        )
    }
}

/// What a turn starts from.
#[derive(Debug, Clone)]
pub enum TurnInput {
    Audio(Utterance),
    Text(String),
}

/// Live turn. Dropping the handle does not cancel the turn; call `cancel`.
pub struct TurnHandle {
    pub id: u64,
    pub events: mpsc::UnboundedReceiver<OutboundEvent>,
    pub phase: watch::Receiver<TurnPhase>,
    pub cancel: CancellationToken,
    pub task: JoinHandle<TurnPhase>,
}

impl TurnHandle {
    pub fn current_phase(&self) -> TurnPhase {
        *self.phase.borrow()
    }
}

/// Shared, per-process turn machinery. Cheap to clone.
#[derive(Clone)]
pub struct TurnOrchestrator {
    backends: Backends,
    metrics: Arc<LatencyMetrics>,
    prompt: Arc<PromptBuilder>,
    llm_timeout: Duration,
    language_hint: Option<String>,
}

impl TurnOrchestrator {
    pub fn new(
        backends: Backends,
        metrics: Arc<LatencyMetrics>,
        prompt: PromptBuilder,
        llm_timeout: Duration,
    ) -> Self {
        Self {
            backends,
            metrics,
            prompt: Arc::new(prompt),
            llm_timeout,
            language_hint: None,
        }
    }

    pub fn from_config(cfg: &VoiceConfig, backends: Backends, metrics: Arc<LatencyMetrics>) -> Self {
        Self {
            language_hint: cfg.session.language_hint.clone(),
            ..Self::new(
                backends,
                metrics,
                PromptBuilder::from_config(&cfg.llm).with_knowledge(
                    KnowledgeBase::from_config(&cfg.knowledge),
                    cfg.knowledge.top_k,
                ),
                Duration::from_millis(cfg.turn.llm_timeout_ms),
            )
        }
    }

    pub fn with_language_hint(mut self, language: Option<String>) -> Self {
        self.language_hint = language;
        self
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn metrics(&self) -> &Arc<LatencyMetrics> {
        &self.metrics
    }

    /// Synthesize outside of a turn (standalone synthesis surface).
    pub async fn synthesize(&self, text: &str) -> VoiceResult<crate::tts::SpeechAudio> {
        let started = Instant::now();
        let audio = self.backends.tts.synthesize(&clean_utterance(text)).await?;
        self.metrics.record(LatencyStage::Tts, elapsed_ms(started));
        Ok(audio)
    }

    /// Start a turn. `cancel` is usually a fresh token owned by the session.
    pub fn run_turn(
        &self,
        id: u64,
        input: TurnInput,
        memory: Arc<Mutex<ConversationMemory>>,
        cancel: CancellationToken,
    ) -> TurnHandle {
        let initial = match input {
            TurnInput::Audio(_) => TurnPhase::Transcribing,
            TurnInput::Text(_) => TurnPhase::Generating,
        };
        let (event_tx, events) = mpsc::unbounded_channel();
        let (phase_tx, phase) = watch::channel(initial);

        let runner = TurnRunner {
            id,
            orchestrator: self.clone(),
            memory,
            cancel: cancel.clone(),
            event_tx,
            phase_tx,
        };
        let task = tokio::spawn(runner.drive(input));

        TurnHandle {
            id,
            events,
            phase,
            cancel,
            task,
        }
    }
}

struct TurnRunner {
    id: u64,
    orchestrator: TurnOrchestrator,
    memory: Arc<Mutex<ConversationMemory>>,
    cancel: CancellationToken,
    event_tx: mpsc::UnboundedSender<OutboundEvent>,
    phase_tx: watch::Sender<TurnPhase>,
}

impl TurnRunner {
    async fn drive(self, input: TurnInput) -> TurnPhase {
        let started = Instant::now();
        let cancel = self.cancel.clone();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(VoiceError::Cancelled),
            result = self.pipeline(input, started) => result,
        };

        let terminal = match outcome {
            Ok(()) => TurnPhase::Done,
            Err(VoiceError::Cancelled) => {
                info!("🛑 Turn {} cancelled", self.id);
                TurnPhase::Cancelled
            }
            Err(VoiceError::ChannelSend(e)) => {
                debug!("Turn {} lost its event consumer: {}", self.id, e);
                TurnPhase::Failed
            }
            Err(e) => {
                warn!("Turn {} failed: {}", self.id, e);
                let _ = self.emit(OutboundEvent::error(Some(self.id), e.to_string()));
                TurnPhase::Failed
            }
        };

        if terminal != TurnPhase::Cancelled {
            let _ = self.emit(OutboundEvent::State {
                state: SessionPhase::Idle,
            });
        }
        self.phase_tx.send_replace(terminal);
        terminal
    }

    async fn pipeline(&self, input: TurnInput, started: Instant) -> VoiceResult<()> {
        let o = &self.orchestrator;
        self.emit(OutboundEvent::State {
            state: SessionPhase::Thinking,
        })?;

        // 1. Transcribe
        let text = match input {
            TurnInput::Text(text) => text.trim().to_string(),
            TurnInput::Audio(utterance) => {
                self.set_phase(TurnPhase::Transcribing);
                let t = Instant::now();
                let text = o
                    .backends
                    .stt
                    .transcribe(&utterance, o.language_hint.as_deref())
                    .await?;
                o.metrics.record(LatencyStage::Stt, elapsed_ms(t));
                let text = text.trim().to_string();
                if !text.is_empty() {
                    self.emit(OutboundEvent::Transcript {
                        turn_id: self.id,
                        text: text.clone(),
                    })?;
                }
                text
            }
        };
        if text.is_empty() {
            debug!("Turn {}: empty transcript, nothing to answer", self.id);
            return Ok(());
        }
        info!("💬 Turn {}: {:?}", self.id, text);

        // 2. Generate
        self.set_phase(TurnPhase::Generating);
        let prompt = {
            let mut memory = self.memory.lock();
            memory.add_user(&text);
            o.prompt.build(&text, &memory)
        };
        let t = Instant::now();
        let generated = match tokio::time::timeout(o.llm_timeout, o.backends.llm.generate(&prompt)).await
        {
            Ok(result) => result,
            Err(_) => Err(VoiceError::GenerationTimeout(o.llm_timeout.as_millis() as u64)),
        };
        let llm_ms = elapsed_ms(t);
        o.metrics.record(LatencyStage::Llm, llm_ms);

        let mut reply = generated.unwrap_or_else(|e| {
            warn!("LLM generation failed, using fallback: {}", e);
            fallback_reply()
        });
        reply.utterance = clean_utterance(&reply.utterance);
        self.memory
            .lock()
            .add_assistant(&reply.utterance, Some(reply.emote.kind.as_str()));

        // 3. Expression before audio
        self.emit(OutboundEvent::Emotion {
            turn_id: self.id,
            emotion: reply.emote,
        })?;
        if let Some(gesture) = reply.visible_gesture() {
            self.emit(OutboundEvent::Gesture {
                turn_id: self.id,
                gesture,
            })?;
        }

        // 4. Synthesize and deliver
        self.set_phase(TurnPhase::Synthesizing);
        let t = Instant::now();
        match o.backends.tts.synthesize(&reply.utterance).await {
            Ok(audio) => {
                o.metrics.record(LatencyStage::Tts, elapsed_ms(t));
                self.set_phase(TurnPhase::Delivering);
                if reply.phoneme_hints.is_empty() {
                    reply.phoneme_hints = estimate_phonemes(&reply.utterance, audio.duration_ms);
                }
                self.emit(OutboundEvent::State {
                    state: SessionPhase::Speaking,
                })?;
                self.emit(OutboundEvent::Audio {
                    turn_id: self.id,
                    text: reply.utterance.clone(),
                    audio: base64::engine::general_purpose::STANDARD.encode(&audio.bytes),
                    duration_ms: audio.duration_ms,
                    phoneme_hints: reply.phoneme_hints.clone(),
                })?;
            }
            Err(e) => {
                // Text and emotion are already out; deliver without audio.
                warn!("TTS failed for turn {}: {}", self.id, e);
            }
        }

        let total_ms = elapsed_ms(started);
        o.metrics.record(LatencyStage::Total, total_ms);
        self.complete(reply, llm_ms, total_ms)
    }

    fn complete(&self, reply: AgentReply, llm_ms: f64, total_ms: f64) -> VoiceResult<()> {
        info!(
            "✅ Turn {} done (llm {:.0}ms, total {:.0}ms)",
            self.id, llm_ms, total_ms
        );
        self.emit(OutboundEvent::TurnComplete {
            turn_id: self.id,
            response: reply,
            llm_latency_ms: llm_ms,
            total_latency_ms: total_ms,
        })
    }

    fn set_phase(&self, phase: TurnPhase) {
        debug!("Turn {} → {:?}", self.id, phase);
        self.phase_tx.send_replace(phase);
    }

    fn emit(&self, event: OutboundEvent) -> VoiceResult<()> {
        if self.cancel.is_cancelled() {
            return Err(VoiceError::Cancelled);
        }
        self.event_tx
            .send(event)
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}
