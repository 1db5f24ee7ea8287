//! Shared test utilities

#![allow(dead_code)]

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Notify, mpsc};

use murmur::config::file::MurmurConfigFile;
use murmur::llm::{ChatRequest, ChatSource, TextStream};
use murmur::voice::{
    AudioSink, AudioStream, BufferReader, Player, ReaderCancel, Synthesizer, Transcriber,
    VoiceProfile,
};
use murmur::{Config, Error, Result, Services, Session, UiUpdate};

/// Defaults with `.` as the delimiter and a fast playback poll
pub fn test_config() -> Config {
    let mut config =
        Config::from_sources(MurmurConfigFile::default(), |_| None).expect("default config");
    config.pipeline.sentence_delimiters = ".".to_string();
    config.pipeline.gate_log_interval = Duration::from_millis(20);
    config.playback.min_buffer_bytes = 1;
    config.playback.poll_interval = Duration::from_millis(10);
    config
}

/// Chat source that replays fixed fragments
#[derive(Default)]
pub struct FakeChat {
    fragments: Vec<String>,
    fail_after: bool,
    hold: Mutex<Option<Arc<Notify>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl FakeChat {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    /// Block the first request until `gate` is notified
    pub fn held_by(self, gate: Arc<Notify>) -> Self {
        *self.hold.lock().unwrap() = Some(gate);
        self
    }

    /// End the stream with an error after the fragments
    pub fn failing(mut self) -> Self {
        self.fail_after = true;
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatSource for FakeChat {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<TextStream> {
        self.requests.lock().unwrap().push(request.clone());

        let hold = self.hold.lock().unwrap().take();
        if let Some(gate) = hold {
            gate.notified().await;
        }

        let mut items: Vec<Result<String>> =
            self.fragments.iter().cloned().map(Ok).collect();
        if self.fail_after {
            items.push(Err(Error::Chat("stream reset".to_string())));
        }
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Synthesizer whose audio is the sentence text, split in two chunks
///
/// The n-th call waits `latencies[n]` between its chunks.
#[derive(Default)]
pub struct ScriptedSynth {
    latencies: Vec<Duration>,
    fail_on: Option<usize>,
    calls: AtomicUsize,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl ScriptedSynth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latencies(mut self, latencies: &[Duration]) -> Self {
        self.latencies = latencies.to_vec();
        self
    }

    /// Reject the n-th call (0-based)
    pub fn failing_on(mut self, call: usize) -> Self {
        self.fail_on = Some(call);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most syntheses ever in progress at once
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynth {
    async fn synthesize(&self, text: &str, _profile: &VoiceProfile) -> Result<AudioStream> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on == Some(call) {
            return Err(Error::Tts(format!("synthesis rejected for call {call}")));
        }

        let latency = self.latencies.get(call).copied().unwrap_or_default();
        let bytes = text.as_bytes().to_vec();
        let mid = bytes.len() / 2;
        let active = Arc::clone(&self.active);
        let max_active = Arc::clone(&self.max_active);

        let stream = async_stream::stream! {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_active.fetch_max(now, Ordering::SeqCst);

            yield Ok::<_, Error>(Bytes::copy_from_slice(&bytes[..mid]));
            tokio::time::sleep(latency).await;
            yield Ok::<_, Error>(Bytes::copy_from_slice(&bytes[mid..]));

            active.fetch_sub(1, Ordering::SeqCst);
        };
        Ok(Box::pin(stream))
    }
}

/// Transcriber that always hears the same words
pub struct FixedTranscriber {
    pub text: String,
    pub seen: Mutex<Vec<(usize, String)>>,
}

impl FixedTranscriber {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, audio: &[u8], format: &str) -> Result<String> {
        self.seen
            .lock()
            .unwrap()
            .push((audio.len(), format.to_string()));
        Ok(self.text.clone())
    }
}

/// Sink whose players copy every byte they read into `played`
#[derive(Default)]
pub struct RecordingSink {
    binds: AtomicUsize,
    played: Arc<Mutex<Vec<u8>>>,
    refuse: bool,
}

impl RecordingSink {
    /// Sink whose every bind fails, like a machine without an output device
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn played(&self) -> Vec<u8> {
        self.played.lock().unwrap().clone()
    }
}

struct RecordingPlayer {
    source: Option<BufferReader>,
    stop: ReaderCancel,
    played: Arc<Mutex<Vec<u8>>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl AudioSink for RecordingSink {
    fn bind(&self, source: BufferReader) -> Result<Box<dyn Player>> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(Error::Audio("no output device".to_string()));
        }
        Ok(Box::new(RecordingPlayer {
            stop: source.cancel_handle(),
            source: Some(source),
            played: Arc::clone(&self.played),
            worker: None,
        }))
    }
}

impl Player for RecordingPlayer {
    fn play(&mut self) {
        let Some(mut source) = self.source.take() else {
            return;
        };
        let played = Arc::clone(&self.played);
        self.worker = Some(std::thread::spawn(move || {
            let mut chunk = [0u8; 64];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => played.lock().unwrap().extend_from_slice(&chunk[..n]),
                }
            }
        }));
    }

    fn is_playing(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    fn buffered_size(&self) -> usize {
        0
    }

    fn close(&mut self) {
        self.stop.cancel();
        if let Some(worker) = self.worker.take() {
            worker.join().unwrap();
        }
    }
}

/// Fakes wired into a session
pub struct Harness {
    pub session: Session,
    pub chat: Arc<FakeChat>,
    pub synth: Arc<ScriptedSynth>,
    pub sink: Arc<RecordingSink>,
    pub transcriber: Arc<FixedTranscriber>,
    pub updates: mpsc::Receiver<UiUpdate>,
}

impl Harness {
    pub fn new(chat: FakeChat, synth: ScriptedSynth) -> Self {
        Self::with_config(chat, synth, &test_config())
    }

    pub fn with_config(chat: FakeChat, synth: ScriptedSynth, config: &Config) -> Self {
        Self::build(chat, synth, RecordingSink::default(), config)
    }

    pub fn with_sink(chat: FakeChat, synth: ScriptedSynth, sink: RecordingSink) -> Self {
        Self::build(chat, synth, sink, &test_config())
    }

    fn build(chat: FakeChat, synth: ScriptedSynth, sink: RecordingSink, config: &Config) -> Self {
        let chat = Arc::new(chat);
        let synth = Arc::new(synth);
        let sink = Arc::new(sink);
        let transcriber = Arc::new(FixedTranscriber::new("what is the time."));
        let (updates_tx, updates) = mpsc::channel(64);

        let services = Services {
            chat: chat.clone(),
            synth: synth.clone(),
            transcriber: transcriber.clone(),
            sink: sink.clone(),
        };

        Self {
            session: Session::new(services, config, updates_tx),
            chat,
            synth,
            sink,
            transcriber,
            updates,
        }
    }

    /// Next update, failing the test after a second of silence
    pub async fn next_update(&mut self) -> UiUpdate {
        tokio::time::timeout(Duration::from_secs(1), self.updates.recv())
            .await
            .expect("timed out waiting for update")
            .expect("update channel closed")
    }
}

/// Yield until `check` holds, failing the test after a second
pub async fn wait_until(check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
