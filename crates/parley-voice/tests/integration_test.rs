//! End-to-end session tests: frames in, events out, with scripted backends.

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_voice::{
    AgentReply, AudioFrame, Backends, EnergyVad, Emotion, LanguageModel, LatencyMetrics,
    LatencyStage, OutboundEvent, PlaceholderTts, Prompt, ScriptedLlm, SessionFactory,
    SessionPhase, SpeechToText, Utterance, VoiceConfig, VoiceResult,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

/// STT that records utterance durations and returns a fixed transcript.
#[derive(Default)]
struct RecordingStt {
    durations: Mutex<Vec<f64>>,
    delay: Duration,
}

#[async_trait]
impl SpeechToText for RecordingStt {
    async fn transcribe(&self, utterance: &Utterance, _language: Option<&str>) -> VoiceResult<String> {
        self.durations.lock().push(utterance.duration_ms);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok("how are you today?".to_string())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

struct SlowLlm(Duration);

#[async_trait]
impl LanguageModel for SlowLlm {
    async fn generate(&self, prompt: &Prompt) -> VoiceResult<AgentReply> {
        tokio::time::sleep(self.0).await;
        ScriptedLlm::new().generate(prompt).await
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn voiced() -> AudioFrame {
    AudioFrame::new(vec![8000; 512])
}

fn silent() -> AudioFrame {
    AudioFrame::new(vec![0; 512])
}

fn config() -> VoiceConfig {
    let mut cfg = VoiceConfig::default();
    cfg.session.queue_capacity = 256;
    cfg
}

fn factory(
    cfg: &VoiceConfig,
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    metrics: Arc<LatencyMetrics>,
) -> SessionFactory {
    let backends = Backends::new(
        Arc::new(EnergyVad::default()),
        stt,
        llm,
        Arc::new(PlaceholderTts::new(cfg.audio.sample_rate)),
    );
    SessionFactory::new(cfg, backends, metrics)
}

/// Collect events until `stop` matches (inclusive) or nothing arrives for 3s.
async fn collect_until(
    rx: &mut UnboundedReceiver<OutboundEvent>,
    stop: impl Fn(&OutboundEvent) -> bool,
) -> Vec<OutboundEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_secs(3), rx.recv()).await {
        let done = stop(&event);
        events.push(event);
        if done {
            break;
        }
    }
    events
}

fn position(events: &[OutboundEvent], kind: &str) -> Option<usize> {
    events.iter().position(|e| e.kind() == kind)
}

#[tokio::test]
async fn test_silence_then_speech_produces_one_turn() {
    init_tracing();
    let cfg = config();
    let stt = Arc::new(RecordingStt::default());
    let metrics = Arc::new(LatencyMetrics::default());
    let factory = factory(&cfg, stt.clone(), Arc::new(ScriptedLlm::new()), metrics.clone());
    let (session, mut events) = factory.create();

    // Initial idle state
    let first = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
    assert_eq!(first, OutboundEvent::State { state: SessionPhase::Idle });

    for _ in 0..10 {
        session.push_frame(silent());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err(), "silence must not produce events");
    assert!(stt.durations.lock().is_empty());

    for _ in 0..20 {
        session.push_frame(voiced());
    }
    for _ in 0..25 {
        session.push_frame(silent());
    }

    let seen = collect_until(&mut events, |e| matches!(e, OutboundEvent::TurnComplete { .. })).await;
    assert_eq!(
        seen[0],
        OutboundEvent::State {
            state: SessionPhase::Listening
        }
    );
    let emotion = position(&seen, "emotion").expect("emotion event");
    let audio = position(&seen, "audio").expect("audio event");
    assert!(position(&seen, "transcript").unwrap() < emotion);
    assert!(emotion < audio);
    assert!(position(&seen, "turn_complete").unwrap() > audio);

    let durations = stt.durations.lock().clone();
    assert_eq!(durations.len(), 1);
    assert!((durations[0] - 640.0).abs() < 1.0);

    assert_eq!(metrics.stats(LatencyStage::Total).count, 1);
    assert!(metrics.stats(LatencyStage::Vad).count >= 55);
    session.shutdown().await;
}

#[tokio::test]
async fn test_speech_past_max_utterance_is_answered_in_order() {
    init_tracing();
    let mut cfg = config();
    cfg.segmenter.max_utterance_ms = 640;
    let stt = Arc::new(RecordingStt {
        delay: Duration::from_millis(100),
        ..RecordingStt::default()
    });
    let factory = factory(&cfg, stt.clone(), Arc::new(ScriptedLlm::new()), Arc::new(LatencyMetrics::default()));
    let (session, mut events) = factory.create();

    for _ in 0..30 {
        session.push_frame(voiced());
    }
    for _ in 0..25 {
        session.push_frame(silent());
    }

    let seen = collect_until(
        &mut events,
        |e| matches!(e, OutboundEvent::TurnComplete { turn_id: 2, .. }),
    )
    .await;
    assert!(position(&seen, "interrupted").is_none(), "events: {:?}", seen);
    let completed: Vec<u64> = seen
        .iter()
        .filter_map(|e| match e {
            OutboundEvent::TurnComplete { turn_id, .. } => Some(*turn_id),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec![1, 2]);

    let listening = seen
        .iter()
        .filter(|e| **e == OutboundEvent::State { state: SessionPhase::Listening })
        .count();
    assert_eq!(listening, 1);

    let durations = stt.durations.lock().clone();
    assert_eq!(durations.len(), 2);
    assert!((durations[0] - 640.0).abs() < 1.0);
    assert!((durations[1] - 320.0).abs() < 1.0);
    session.shutdown().await;
}

#[tokio::test]
async fn test_llm_timeout_yields_apology() {
    init_tracing();
    let mut cfg = config();
    cfg.turn.llm_timeout_ms = 50;
    let factory = factory(
        &cfg,
        Arc::new(RecordingStt::default()),
        Arc::new(SlowLlm(Duration::from_millis(200))),
        Arc::new(LatencyMetrics::default()),
    );
    let (session, mut events) = factory.create();

    let started = Instant::now();
    session.submit_text("are you there?").unwrap();
    let seen = collect_until(&mut events, |e| e.kind() == "emotion").await;
    let elapsed = started.elapsed();

    match seen.last() {
        Some(OutboundEvent::Emotion { emotion, .. }) => {
            assert_eq!(emotion.kind, Emotion::Sad);
            assert!((emotion.intensity - 0.3).abs() < 1e-6);
        }
        other => panic!("expected emotion, got {:?}", other),
    }
    assert!(elapsed < Duration::from_millis(180), "apology took {:?}", elapsed);

    let rest = collect_until(&mut events, |e| e.kind() == "turn_complete").await;
    match rest.last() {
        Some(OutboundEvent::TurnComplete { response, .. }) => {
            assert_eq!(
                response.utterance,
                "I'm having trouble thinking right now. Can you try again?"
            );
        }
        other => panic!("expected turn_complete, got {:?}", other),
    }
    session.shutdown().await;
}

#[tokio::test]
async fn test_barge_in_cancels_generating_turn() {
    init_tracing();
    let cfg = config();
    let factory = factory(
        &cfg,
        Arc::new(RecordingStt::default()),
        Arc::new(SlowLlm(Duration::from_millis(400))),
        Arc::new(LatencyMetrics::default()),
    );
    let (session, mut events) = factory.create();

    for _ in 0..20 {
        session.push_frame(voiced());
    }
    for _ in 0..25 {
        session.push_frame(silent());
    }
    let first_turn = collect_until(&mut events, |e| e.kind() == "transcript").await;
    let turn_one = match first_turn.last() {
        Some(OutboundEvent::Transcript { turn_id, .. }) => *turn_id,
        other => panic!("expected transcript, got {:?}", other),
    };

    // User speaks again while the first turn is generating.
    for _ in 0..20 {
        session.push_frame(voiced());
    }
    for _ in 0..25 {
        session.push_frame(silent());
    }

    let seen = collect_until(&mut events, |e| e.kind() == "turn_complete").await;
    assert!(seen.contains(&OutboundEvent::Interrupted { turn_id: turn_one }));

    let after_interrupt = position(&seen, "interrupted").unwrap();
    for event in &seen[after_interrupt + 1..] {
        let stale = match event {
            OutboundEvent::Transcript { turn_id, .. }
            | OutboundEvent::Emotion { turn_id, .. }
            | OutboundEvent::Gesture { turn_id, .. }
            | OutboundEvent::Audio { turn_id, .. }
            | OutboundEvent::TurnComplete { turn_id, .. } => *turn_id == turn_one,
            _ => false,
        };
        assert!(!stale, "event from cancelled turn: {:?}", event);
    }

    match seen.last() {
        Some(OutboundEvent::TurnComplete { turn_id, .. }) => assert!(*turn_id > turn_one),
        other => panic!("expected second turn to complete, got {:?}", other),
    }
    session.shutdown().await;
}

#[tokio::test]
async fn test_text_input_cancels_previous_turn() {
    init_tracing();
    let cfg = config();
    let factory = factory(
        &cfg,
        Arc::new(RecordingStt::default()),
        Arc::new(SlowLlm(Duration::from_millis(300))),
        Arc::new(LatencyMetrics::default()),
    );
    let (session, mut events) = factory.create();

    let first = session.submit_text("first question?").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = session.submit_text("never mind, hello!").unwrap();
    assert_ne!(first, second);

    let seen = collect_until(&mut events, |e| e.kind() == "turn_complete").await;
    assert!(seen.contains(&OutboundEvent::Interrupted { turn_id: first }));
    assert!(!seen
        .iter()
        .any(|e| matches!(e, OutboundEvent::Emotion { turn_id, .. } if *turn_id == first)));
    session.shutdown().await;
}

#[tokio::test]
async fn test_metrics_shared_across_sessions() {
    init_tracing();
    let cfg = config();
    let metrics = Arc::new(LatencyMetrics::new(3));
    let factory = factory(
        &cfg,
        Arc::new(RecordingStt::default()),
        Arc::new(ScriptedLlm::new()),
        metrics.clone(),
    );

    for text in ["hello", "thanks!", "what now?", "great"] {
        let (session, mut events) = factory.create();
        session.submit_text(text).unwrap();
        collect_until(&mut events, |e| e.kind() == "turn_complete").await;
        session.shutdown().await;
    }

    let total = metrics.stats(LatencyStage::Total);
    assert_eq!(total.count, 3);
    assert!(total.min <= total.avg && total.avg <= total.max);
    assert_eq!(metrics.recent(LatencyStage::Llm, 10).len(), 3);
}

#[tokio::test]
async fn test_overflow_drops_oldest_frames() {
    init_tracing();
    let mut cfg = config();
    cfg.session.queue_capacity = 4;
    let factory = factory(
        &cfg,
        Arc::new(RecordingStt::default()),
        Arc::new(ScriptedLlm::new()),
        Arc::new(LatencyMetrics::default()),
    );
    let (session, _events) = factory.create();

    // Push faster than the segmentation task can be scheduled on this thread.
    for _ in 0..40 {
        session.push_frame(silent());
    }
    assert!(session.queued_frames() <= 4);
    assert!(session.dropped_frames() >= 36 - 4);
    session.shutdown().await;
}
