//! Streaming pipeline integration tests
//!
//! Runs whole turns against fake chat, synthesis and audio sink

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Notify, mpsc};
use tokio_test::{assert_pending, task};
use tokio_util::sync::CancellationToken;

use murmur::llm::Role;
use murmur::pipeline::{AudioChunk, Sentence, run_synthesis};
use murmur::voice::{PlaybackEngine, PlaybackState, VoiceProfile};
use murmur::{Error, UiUpdate};

mod common;

use common::{FakeChat, Harness, RecordingSink, ScriptedSynth, test_config, wait_until};

fn profile() -> VoiceProfile {
    VoiceProfile {
        voice: "alloy".to_string(),
        emotion: "neutral".to_string(),
        speed: 1.0,
    }
}

fn chunk(payload: &'static [u8]) -> AudioChunk {
    AudioChunk {
        sentence: 0,
        payload: Bytes::from_static(payload),
    }
}

#[tokio::test]
async fn test_synthesis_keeps_sentence_order_with_reversed_latency() {
    let synth = Arc::new(ScriptedSynth::new().with_latencies(&[
        Duration::from_millis(60),
        Duration::from_millis(30),
        Duration::ZERO,
    ]));

    let (sentence_tx, sentence_rx) = mpsc::channel(8);
    let (audio_tx, mut audio_rx) = mpsc::channel(64);
    for (index, text) in ["s1 slow.", "s2 medium.", "s3 fast."].into_iter().enumerate() {
        sentence_tx
            .send(Sentence {
                index,
                text: text.to_string(),
            })
            .await
            .unwrap();
    }
    drop(sentence_tx);

    run_synthesis(
        synth.clone(),
        profile(),
        sentence_rx,
        audio_tx,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let mut order = Vec::new();
    let mut audio = Vec::new();
    while let Some(chunk) = audio_rx.recv().await {
        order.push(chunk.sentence);
        audio.extend_from_slice(&chunk.payload);
    }

    assert_eq!(order, [0, 0, 1, 1, 2, 2]);
    assert_eq!(audio, b"s1 slow.s2 medium.s3 fast.");
    assert_eq!(synth.max_active(), 1);
}

#[tokio::test]
async fn test_engine_waits_for_threshold_then_initializes_once_on_eos() {
    let sink = Arc::new(RecordingSink::default());
    let mut config = test_config().playback;
    config.min_buffer_bytes = 100;

    let (tx, rx) = mpsc::channel(8);
    let engine = Arc::new(PlaybackEngine::new(
        rx,
        sink.clone(),
        config,
        CancellationToken::new(),
    ));

    let running = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    tx.send(chunk(b"0123456789")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.binds(), 0);
    assert_eq!(engine.state(), PlaybackState::Buffering);

    drop(tx);
    running.await.unwrap().unwrap();

    assert_eq!(sink.binds(), 1);
    assert_eq!(sink.played(), b"0123456789");
    assert_eq!(engine.state(), PlaybackState::Stopped);
}

#[tokio::test]
async fn test_engine_reset_then_graceful_stop_without_chunks() {
    let sink = Arc::new(RecordingSink::default());
    let (tx, rx) = mpsc::channel::<AudioChunk>(1);
    let engine = PlaybackEngine::new(rx, sink.clone(), test_config().playback, CancellationToken::new());
    drop(tx);

    engine.reset();
    engine.graceful_stop().await.unwrap();

    assert_eq!(sink.binds(), 0);
    assert_eq!(engine.state(), PlaybackState::Stopped);
}

#[tokio::test]
async fn test_turn_plays_reply_and_publishes_history() {
    let mut harness = Harness::new(
        FakeChat::new(&["Hello", " there. How", " are you? Fine"]),
        ScriptedSynth::new(),
    );

    let reply = harness.session.ask("hi").await.unwrap();
    assert_eq!(reply, "Hello there. How are you? Fine");

    // "?" is not a delimiter in the test config
    assert_eq!(harness.synth.calls(), 2);
    assert_eq!(harness.sink.played(), b"Hello there.How are you? Fine");
    assert_eq!(harness.sink.binds(), 1);

    let UiUpdate::History(history) = harness.next_update().await else {
        panic!("expected history update");
    };
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].content, reply);
    assert!(!harness.session.is_busy());
}

#[tokio::test]
async fn test_second_turn_waits_for_first() {
    let release = Arc::new(Notify::new());
    let harness = Harness::new(
        FakeChat::new(&["Done."]).held_by(Arc::clone(&release)),
        ScriptedSynth::new(),
    );
    let session = harness.session.clone();

    let first = session.spawn_turn("first".to_string());
    wait_until(|| harness.chat.requests().len() == 1).await;
    assert!(session.is_busy());

    let mut second = task::spawn(session.ask("second"));
    assert_pending!(second.poll());
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_pending!(second.poll());
    assert_eq!(harness.chat.requests().len(), 1);

    release.notify_one();
    first.await.unwrap().unwrap();
    second.await.unwrap();

    // The second request saw the first turn's full exchange
    let requests = harness.chat.requests();
    assert_eq!(requests.len(), 2);
    let contents: Vec<_> = requests[1].messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["first", "Done.", "second"]);
    assert!(!session.is_busy());
}

#[tokio::test]
async fn test_synthesis_failure_on_second_sentence() {
    let mut harness = Harness::new(
        FakeChat::new(&["One. Two. Three."]),
        ScriptedSynth::new().failing_on(1),
    );

    let result = harness.session.ask("count").await;
    assert!(matches!(result, Err(Error::Tts(_))));

    assert_eq!(harness.sink.played(), b"One.");
    assert_eq!(harness.synth.calls(), 2);
    assert!(!harness.session.is_busy());

    assert!(matches!(harness.next_update().await, UiUpdate::History(h) if h.len() == 2));
    assert!(matches!(harness.next_update().await, UiUpdate::TurnFailed(_)));

    // The gate is open again
    let reply = tokio::time::timeout(Duration::from_secs(1), harness.session.ask("again"))
        .await
        .unwrap();
    assert!(reply.is_ok());
}

#[tokio::test]
async fn test_missing_output_device_fails_turn() {
    let mut harness = Harness::with_sink(
        FakeChat::new(&["Nobody hears this."]),
        ScriptedSynth::new(),
        RecordingSink::refusing(),
    );

    let result = tokio::time::timeout(Duration::from_secs(5), harness.session.ask("hello"))
        .await
        .unwrap();
    assert!(matches!(result, Err(Error::Audio(_))));
    assert_eq!(harness.sink.binds(), 1);
    assert!(!harness.session.is_busy());

    let UiUpdate::History(history) = harness.next_update().await else {
        panic!("expected history update");
    };
    assert_eq!(history[1].content, "Nobody hears this.");
    assert!(matches!(harness.next_update().await, UiUpdate::TurnFailed(_)));
}

#[tokio::test]
async fn test_chat_failure_keeps_partial_reply() {
    let mut harness = Harness::new(
        FakeChat::new(&["Partial answer. And"]).failing(),
        ScriptedSynth::new(),
    );

    let result = harness.session.ask("q").await;
    assert!(matches!(result, Err(Error::Chat(_))));

    // What arrived before the failure is still spoken and recorded
    assert_eq!(harness.sink.played(), b"Partial answer.And");
    let UiUpdate::History(history) = harness.next_update().await else {
        panic!("expected history update");
    };
    assert_eq!(history[1].content, "Partial answer. And");
}

#[tokio::test]
async fn test_cancel_releases_gate() {
    let release = Arc::new(Notify::new());
    let harness = Harness::new(
        FakeChat::new(&["never."]).held_by(release),
        ScriptedSynth::new(),
    );
    let session = harness.session.clone();

    let turn = session.spawn_turn("hang".to_string());
    wait_until(|| harness.chat.requests().len() == 1).await;

    assert!(session.cancel_turn());
    let result = tokio::time::timeout(Duration::from_secs(1), turn)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(!session.is_busy());
    assert!(!session.cancel_turn());
    assert_eq!(harness.sink.binds(), 0);
}
