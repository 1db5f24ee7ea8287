//! Playback engine for one turn's audio stream
//!
//! Ingestion drains the upstream chunk channel into a [`PlaybackBuffer`]
//! from its own task, whatever the playback state. [`PlaybackEngine::play`]
//! waits for enough data, binds a player and starts it, while
//! [`PlaybackEngine::graceful_stop`] supervises playback and releases the
//! player once everything has been rendered.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::playback::{AudioSink, PlaybackBuffer, Player};
use crate::config::PlaybackConfig;
use crate::pipeline::{AudioChunk, recv};
use crate::{Error, Result};

/// Where the engine is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Freshly reset, nothing buffered
    Idle,
    /// Waiting for the buffering threshold or end of stream
    Buffering,
    /// Binding a player to the buffer
    Initializing,
    /// Player is rendering audio
    Playing,
    /// Upstream is done; waiting for the player to run dry
    Draining,
    /// Player closed and released
    Stopped,
}

/// Ingestion progress since the last reset
#[derive(Debug, Clone, Copy, Default)]
struct Ingest {
    received: usize,
    finished: bool,
}

/// Player condition as seen by the supervisor
enum PlayerStatus {
    Active,
    Finished,
    Stalled,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Buffers a turn's audio chunks and renders them through an [`AudioSink`]
pub struct PlaybackEngine {
    sink: Arc<dyn AudioSink>,
    config: PlaybackConfig,
    cancel: CancellationToken,
    buffer: PlaybackBuffer,
    upstream: Mutex<Option<mpsc::Receiver<AudioChunk>>>,
    ingest: Arc<watch::Sender<Ingest>>,
    ingest_task: Mutex<Option<JoinHandle<()>>>,
    state: watch::Sender<PlaybackState>,
    player: Mutex<Option<Box<dyn Player>>>,
}

impl PlaybackEngine {
    #[must_use]
    pub fn new(
        upstream: mpsc::Receiver<AudioChunk>,
        sink: Arc<dyn AudioSink>,
        config: PlaybackConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sink,
            config,
            cancel,
            buffer: PlaybackBuffer::new(),
            upstream: Mutex::new(Some(upstream)),
            ingest: Arc::new(watch::Sender::new(Ingest::default())),
            ingest_task: Mutex::new(None),
            state: watch::Sender::new(PlaybackState::Idle),
            player: Mutex::new(None),
        }
    }

    /// Reset, then play and supervise until all audio has been rendered
    ///
    /// # Errors
    ///
    /// Returns error if no player could be bound, or the turn is cancelled
    pub async fn run(&self) -> Result<()> {
        self.reset();
        let (played, stopped) = tokio::join!(self.play(), self.graceful_stop());
        played.and(stopped)
    }

    /// Clear the buffer and return to [`PlaybackState::Idle`]
    pub fn reset(&self) {
        self.buffer.reset();
        self.ingest.send_replace(Ingest::default());
        self.set_state(PlaybackState::Idle);
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> PlaybackState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state.subscribe()
    }

    /// Wait for the buffering threshold, then bind and start a player
    ///
    /// Nothing is bound if upstream finishes without sending any audio.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decoder`] if the player cannot be started, or
    /// [`Error::Cancelled`]
    pub async fn play(&self) -> Result<()> {
        self.ensure_ingesting();
        self.set_state(PlaybackState::Buffering);

        let threshold = self.config.min_buffer_bytes;
        let mut progress = self.ingest.subscribe();
        let ingest = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                self.set_state(PlaybackState::Stopped);
                return Err(Error::Cancelled);
            }
            ready = progress.wait_for(|i| i.finished || i.received >= threshold) => {
                ready.map(|i| *i).map_err(|_| Error::Pipeline("ingestion progress dropped".to_string()))?
            }
        };

        if ingest.finished && ingest.received == 0 {
            tracing::debug!("no audio for this turn");
            self.set_state(PlaybackState::Stopped);
            return Ok(());
        }

        tracing::debug!(
            buffered = ingest.received,
            finished = ingest.finished,
            "buffer ready"
        );

        if let Err(e) = self.start_player().await {
            tracing::error!(error = %e, "audio output failed");
            self.set_state(PlaybackState::Stopped);
            return Err(e);
        }
        Ok(())
    }

    /// Supervise playback and release the player once it has run dry
    ///
    /// Returns immediately if upstream finishes without audio. A player that
    /// stops while more audio is expected is rebuilt.
    ///
    /// # Errors
    ///
    /// Returns error if a rebuild fails, or [`Error::Cancelled`]
    pub async fn graceful_stop(&self) -> Result<()> {
        self.ensure_ingesting();

        let mut states = self.state.subscribe();
        let mut progress = self.ingest.subscribe();
        let mut rebuilds = 0u32;

        let result = loop {
            let state = *states.borrow_and_update();
            let ingest = *progress.borrow_and_update();

            if state == PlaybackState::Stopped || (ingest.finished && ingest.received == 0) {
                break Ok(());
            }

            if matches!(state, PlaybackState::Playing | PlaybackState::Draining) {
                match self.player_status() {
                    PlayerStatus::Active => {
                        if ingest.finished && state == PlaybackState::Playing {
                            self.set_state(PlaybackState::Draining);
                        }
                    }
                    PlayerStatus::Finished => break Ok(()),
                    PlayerStatus::Stalled => {
                        rebuilds += 1;
                        if rebuilds > self.config.max_init_attempts {
                            break Err(Error::Decoder("player keeps stalling".to_string()));
                        }
                        tracing::warn!(rebuilds, "player stopped early, rebuilding");
                        self.close_player();
                        if let Err(e) = self.start_player().await {
                            break Err(e);
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break Err(Error::Cancelled),
                _ = states.changed() => {}
                _ = progress.changed() => {}
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
        };

        self.close_player();
        self.set_state(PlaybackState::Stopped);
        tracing::debug!(ok = result.is_ok(), "playback stopped");
        result
    }

    /// Spawn the ingestion task unless it is already running
    fn ensure_ingesting(&self) {
        let Some(mut upstream) = lock(&self.upstream).take() else {
            return;
        };

        let buffer = self.buffer.clone();
        let progress = Arc::clone(&self.ingest);
        let cancel = self.cancel.clone();

        let task = tokio::spawn(async move {
            let mut chunks = 0usize;
            loop {
                match recv(&mut upstream, &cancel).await {
                    Ok(Some(chunk)) => {
                        buffer.append(&chunk.payload);
                        progress.send_modify(|p| p.received += chunk.payload.len());
                        chunks += 1;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        tracing::debug!("ingestion cancelled");
                        break;
                    }
                }
            }

            buffer.finish();
            progress.send_modify(|p| p.finished = true);
            tracing::debug!(chunks, bytes = buffer.received(), "audio upstream finished");
        });

        *lock(&self.ingest_task) = Some(task);
    }

    /// Bind a player to the buffer and start it, retrying if it will not play
    async fn start_player(&self) -> Result<()> {
        self.set_state(PlaybackState::Initializing);

        for attempt in 1..=self.config.max_init_attempts.max(1) {
            let sink = Arc::clone(&self.sink);
            let reader = self.buffer.reader();
            let mut player = tokio::task::spawn_blocking(move || sink.bind(reader))
                .await
                .map_err(|e| Error::Pipeline(format!("decoder task failed: {e}")))??;

            player.play();
            let playing = player.is_playing();
            // A short stream may already be fully consumed by the time we look
            let drained = self.buffer.is_finished() && self.buffer.is_empty();
            if playing || drained {
                tracing::debug!(attempt, "player started");
                *lock(&self.player) = Some(player);
                self.set_state(PlaybackState::Playing);
                return Ok(());
            }

            tracing::warn!(attempt, "player did not start");
            player.close();
        }

        Err(Error::Decoder(format!(
            "player failed to start after {} attempts",
            self.config.max_init_attempts
        )))
    }

    fn player_status(&self) -> PlayerStatus {
        let guard = lock(&self.player);
        let Some(player) = guard.as_ref() else {
            return PlayerStatus::Stalled;
        };

        // The buffer is marked finished before any reader can see EOF, so
        // it is checked directly rather than through the progress snapshot
        if player.is_playing() {
            PlayerStatus::Active
        } else if self.buffer.is_finished() && self.buffer.is_empty() && player.buffered_size() == 0
        {
            PlayerStatus::Finished
        } else {
            PlayerStatus::Stalled
        }
    }

    fn close_player(&self) {
        if let Some(mut player) = lock(&self.player).take() {
            player.close();
        }
    }

    fn set_state(&self, next: PlaybackState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::trace!(from = ?previous, to = ?next, "playback state");
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.ingest_task).take() {
            task.abort();
        }
        self.close_player();
    }
}
