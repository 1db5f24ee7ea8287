//! Streaming turn pipeline
//!
//! ```text
//! chat stream ──text──▶ segmenter ──sentences──▶ synthesis ──chunks──▶ playback
//! ```
//!
//! Every stage is a free-standing async function that owns its receiver and
//! sender. Dropping a sender is how a stage tells its successor it is done,
//! whether it finished or failed.

mod completion;
mod segmenter;
mod synthesis;

pub use completion::{Completion, run_completion};
pub use segmenter::{SentenceSegmenter, run_segmenter};
pub use synthesis::run_synthesis;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// A delimiter-terminated span of generated text, the unit of synthesis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    /// Position of the sentence within the reply, starting at 0
    pub index: usize,
    /// Trimmed sentence text
    pub text: String,
}

/// A fragment of encoded audio for one sentence
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Index of the sentence this audio belongs to
    pub sentence: usize,
    /// Encoded audio bytes
    pub payload: Bytes,
}

/// Receive the next item unless the turn is cancelled first
pub(crate) async fn recv<T>(
    rx: &mut mpsc::Receiver<T>,
    cancel: &CancellationToken,
) -> Result<Option<T>> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        item = rx.recv() => Ok(item),
    }
}

/// Send an item downstream unless the turn is cancelled first
///
/// Returns `Ok(false)` when the receiving stage has gone away.
pub(crate) async fn forward<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    cancel: &CancellationToken,
) -> Result<bool> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        sent = tx.send(item) => Ok(sent.is_ok()),
    }
}
