//! Audio playback to speakers
//!
//! Encoded audio accumulates in a [`PlaybackBuffer`]. A player binds a
//! decoder to a [`BufferReader`] over that buffer and feeds decoded samples
//! to the output device. The device itself is opened once per process and
//! reused across turns.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::{Error, Result};

/// How long a blocked reader sleeps before re-checking its flags
const READ_WAIT: Duration = Duration::from_millis(50);

/// Seconds of decoded audio allowed to queue ahead of the device
const MAX_QUEUED_SECONDS: usize = 2;

#[derive(Debug, Default)]
struct BufferState {
    bytes: VecDeque<u8>,
    received: usize,
    finished: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BufferState>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Growable byte buffer between audio ingestion and the decoder
#[derive(Debug, Clone, Default)]
pub struct PlaybackBuffer {
    shared: Arc<Shared>,
}

impl PlaybackBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append encoded bytes and wake any waiting reader
    pub fn append(&self, bytes: &[u8]) {
        let mut state = self.shared.lock();
        state.bytes.extend(bytes);
        state.received += bytes.len();
        drop(state);
        self.shared.ready.notify_all();
    }

    /// Mark end of stream; readers return EOF once the buffer empties
    pub fn finish(&self) {
        self.shared.lock().finished = true;
        self.shared.ready.notify_all();
    }

    /// Drop all content and clear the end-of-stream mark
    pub fn reset(&self) {
        let mut state = self.shared.lock();
        *state = BufferState::default();
        drop(state);
        self.shared.ready.notify_all();
    }

    /// Bytes not yet read by a decoder
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes appended since the last reset
    #[must_use]
    pub fn received(&self) -> usize {
        self.shared.lock().received
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.lock().finished
    }

    /// A blocking reader that consumes from the front of the buffer
    #[must_use]
    pub fn reader(&self) -> BufferReader {
        BufferReader {
            shared: Arc::clone(&self.shared),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Blocking [`Read`] over a [`PlaybackBuffer`]
///
/// `read` waits for data and returns `Ok(0)` only once the buffer is
/// finished and drained, or the reader has been cancelled.
#[derive(Debug)]
pub struct BufferReader {
    shared: Arc<Shared>,
    cancelled: Arc<AtomicBool>,
}

impl BufferReader {
    /// Handle that can unblock this reader from another thread
    #[must_use]
    pub fn cancel_handle(&self) -> ReaderCancel {
        ReaderCancel {
            shared: Arc::clone(&self.shared),
            cancelled: Arc::clone(&self.cancelled),
        }
    }
}

impl Read for BufferReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.shared.lock();
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return Ok(0);
            }
            if !state.bytes.is_empty() {
                return state.bytes.read(buf);
            }
            if state.finished {
                return Ok(0);
            }
            state = self
                .shared
                .ready
                .wait_timeout(state, READ_WAIT)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Cancels a [`BufferReader`], making its next read return EOF
#[derive(Debug, Clone)]
pub struct ReaderCancel {
    shared: Arc<Shared>,
    cancelled: Arc<AtomicBool>,
}

impl ReaderCancel {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.shared.ready.notify_all();
    }
}

/// Output device that players can be bound to
pub trait AudioSink: Send + Sync {
    /// Bind a decoder to `source`
    ///
    /// May block until enough data has arrived to validate the stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decoder`] if no audio can be decoded from `source`
    fn bind(&self, source: BufferReader) -> Result<Box<dyn Player>>;
}

/// A decoder bound to one buffer, rendering into a sink
pub trait Player: Send {
    /// Start rendering; calling again once started has no effect
    fn play(&mut self);

    /// Whether audio is still being decoded or rendered
    fn is_playing(&self) -> bool;

    /// Decoded samples waiting for the device
    fn buffered_size(&self) -> usize;

    /// Stop and release the decoder
    fn close(&mut self);
}

type SampleQueue = Arc<Mutex<VecDeque<f32>>>;

fn lock_queue(queue: &SampleQueue) -> MutexGuard<'_, VecDeque<f32>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The default output device, driven from a dedicated thread
pub struct DeviceSink {
    queue: SampleQueue,
    sample_rate: u32,
    shutdown: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceSink {
    /// Open the default output device at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if no usable output device or config is available
    pub fn open(sample_rate: u32) -> Result<Self> {
        let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let device_queue = Arc::clone(&queue);
        let thread = std::thread::Builder::new()
            .name("murmur-audio-out".to_string())
            .spawn(move || {
                let stream = match build_output_stream(sample_rate, device_queue) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Returns once the sender is dropped
                let _ = shutdown_rx.recv();
                drop(stream);
                tracing::debug!("audio output closed");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                queue,
                sample_rate,
                shutdown: Some(shutdown_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(Error::Audio("audio output thread exited".to_string())),
        }
    }
}

impl AudioSink for DeviceSink {
    fn bind(&self, source: BufferReader) -> Result<Box<dyn Player>> {
        let player = Mp3Player::new(source, Arc::clone(&self.queue), self.sample_rate)?;
        Ok(Box::new(player))
    }
}

impl Drop for DeviceSink {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn build_output_stream(sample_rate: u32, queue: SampleQueue) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
        c.channels() == channels
            && c.min_sample_rate() <= SampleRate(sample_rate)
            && c.max_sample_rate() >= SampleRate(sample_rate)
    };

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| supports(c, 1))
        .or_else(|| {
            // Fallback: stereo, same sample on both channels
            device
                .supported_output_configs()
                .ok()?
                .find(|c| supports(c, 2))
        })
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    let config: StreamConfig = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();
    let channels = usize::from(config.channels);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut queue = lock_queue(&queue);
                for frame in data.chunks_mut(channels) {
                    let sample = queue.pop_front().unwrap_or(0.0);
                    frame.fill(sample);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio output opened"
    );

    Ok(stream)
}

type Mp3Decoder = minimp3::Decoder<BufferReader>;

/// MP3 decoder feeding a device's sample queue
pub struct Mp3Player {
    pending: Option<(Mp3Decoder, Vec<f32>)>,
    queue: SampleQueue,
    sample_rate: u32,
    stop: ReaderCancel,
    worker: Option<JoinHandle<()>>,
}

impl Mp3Player {
    /// Bind a decoder to `source`, blocking until the first frame decodes
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decoder`] if the stream ends before any frame
    pub(crate) fn new(source: BufferReader, queue: SampleQueue, sample_rate: u32) -> Result<Self> {
        let stop = source.cancel_handle();
        let mut decoder = minimp3::Decoder::new(source);

        let first = loop {
            match decoder.next_frame() {
                Ok(frame) => break frame,
                Err(minimp3::Error::InsufficientData | minimp3::Error::SkippedData) => {}
                Err(minimp3::Error::Eof) => {
                    return Err(Error::Decoder("no MP3 frame in audio stream".to_string()));
                }
                Err(e) => return Err(Error::Decoder(format!("MP3 decode error: {e}"))),
            }
        };

        if u32::try_from(first.sample_rate).ok() != Some(sample_rate) {
            tracing::warn!(
                stream_rate = first.sample_rate,
                device_rate = sample_rate,
                "sample rate mismatch, audio will play at the wrong pitch"
            );
        }

        Ok(Self {
            pending: Some((decoder, to_mono(&first))),
            queue,
            sample_rate,
            stop,
            worker: None,
        })
    }
}

impl Player for Mp3Player {
    fn play(&mut self) {
        let Some((decoder, first)) = self.pending.take() else {
            return;
        };

        let queue = Arc::clone(&self.queue);
        let stop = Arc::clone(&self.stop.cancelled);
        let max_queued = self.sample_rate as usize * MAX_QUEUED_SECONDS;

        let spawned = std::thread::Builder::new()
            .name("murmur-decode".to_string())
            .spawn(move || decode_loop(decoder, first, &queue, &stop, max_queued));

        match spawned {
            Ok(handle) => self.worker = Some(handle),
            Err(e) => tracing::error!(error = %e, "failed to start decoder thread"),
        }
    }

    fn is_playing(&self) -> bool {
        let decoding = self.worker.as_ref().is_some_and(|w| !w.is_finished());
        decoding || !lock_queue(&self.queue).is_empty()
    }

    fn buffered_size(&self) -> usize {
        lock_queue(&self.queue).len()
    }

    fn close(&mut self) {
        self.stop.cancel();
        self.pending = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        lock_queue(&self.queue).clear();
    }
}

impl Drop for Mp3Player {
    fn drop(&mut self) {
        self.close();
    }
}

fn decode_loop(
    mut decoder: Mp3Decoder,
    first: Vec<f32>,
    queue: &SampleQueue,
    stop: &AtomicBool,
    max_queued: usize,
) {
    lock_queue(queue).extend(first);
    let mut frames = 1usize;

    while !stop.load(Ordering::Acquire) {
        // Keep the device queue bounded so close() stays prompt
        if lock_queue(queue).len() > max_queued {
            std::thread::sleep(Duration::from_millis(20));
            continue;
        }

        match decoder.next_frame() {
            Ok(frame) => {
                lock_queue(queue).extend(to_mono(&frame));
                frames += 1;
            }
            Err(minimp3::Error::InsufficientData | minimp3::Error::SkippedData) => {}
            Err(minimp3::Error::Eof) => break,
            Err(e) => {
                tracing::error!(error = %e, "MP3 decode error");
                break;
            }
        }
    }

    tracing::debug!(frames, "decoder finished");
}

/// Convert a decoded frame to mono f32, averaging stereo channels
fn to_mono(frame: &minimp3::Frame) -> Vec<f32> {
    if frame.channels == 2 {
        frame
            .data
            .chunks(2)
            .map(|chunk| {
                let left = f32::from(chunk[0]) / 32768.0;
                let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                f32::midpoint(left, right)
            })
            .collect()
    } else {
        frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect()
    }
}
