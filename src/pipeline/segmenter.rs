//! Sentence segmentation of incremental chat output

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Sentence, forward, recv};
use crate::Result;

/// Buffers text fragments and yields complete sentences as soon as a
/// delimiter closes them
#[derive(Debug, Clone)]
pub struct SentenceSegmenter {
    delimiters: Vec<char>,
    buffer: String,
    next_index: usize,
}

impl SentenceSegmenter {
    /// Create a segmenter that splits on any character of `delimiters`
    #[must_use]
    pub fn new(delimiters: &str) -> Self {
        Self {
            delimiters: delimiters.chars().collect(),
            buffer: String::new(),
            next_index: 0,
        }
    }

    /// Append a fragment and return every sentence it completes, in order
    ///
    /// Text after the last delimiter stays buffered for the next call.
    pub fn push(&mut self, fragment: &str) -> Vec<Sentence> {
        let Self {
            delimiters,
            buffer,
            next_index,
        } = self;

        buffer.push_str(fragment);
        let content = std::mem::take(buffer);
        let mut sentences = Vec::new();

        for piece in content.split_inclusive(|c: char| delimiters.contains(&c)) {
            match piece.chars().next_back() {
                Some(delimiter) if delimiters.contains(&delimiter) => {
                    let body = piece[..piece.len() - delimiter.len_utf8()].trim();
                    if body.is_empty() {
                        continue;
                    }
                    sentences.push(Sentence {
                        index: *next_index,
                        text: format!("{body}{delimiter}"),
                    });
                    *next_index += 1;
                }
                // split_inclusive only leaves an undelimited piece at the end
                _ => buffer.push_str(piece),
            }
        }

        sentences
    }

    /// Flush whatever is left once the source stream has ended
    pub fn finish(&mut self) -> Option<Sentence> {
        let rest = std::mem::take(&mut self.buffer);
        let text = rest.trim();
        if text.is_empty() {
            return None;
        }

        let sentence = Sentence {
            index: self.next_index,
            text: text.to_string(),
        };
        self.next_index += 1;
        Some(sentence)
    }

    /// Text buffered but not yet emitted
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

/// Run the segmenter as a pipeline stage
///
/// Closes `tx` after the final flush when `rx` closes.
///
/// # Errors
///
/// Returns [`crate::Error::Cancelled`] if the turn is cancelled
pub async fn run_segmenter(
    mut segmenter: SentenceSegmenter,
    mut rx: mpsc::Receiver<String>,
    tx: mpsc::Sender<Sentence>,
    cancel: CancellationToken,
) -> Result<()> {
    while let Some(fragment) = recv(&mut rx, &cancel).await? {
        for sentence in segmenter.push(&fragment) {
            tracing::debug!(index = sentence.index, text = %sentence.text, "sentence ready");
            if !forward(&tx, sentence, &cancel).await? {
                tracing::debug!("sentence consumer gone, stopping segmenter");
                return Ok(());
            }
        }
    }

    if let Some(sentence) = segmenter.finish() {
        tracing::debug!(index = sentence.index, text = %sentence.text, "flushing final sentence");
        forward(&tx, sentence, &cancel).await?;
    }

    Ok(())
}
