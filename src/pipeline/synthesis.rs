//! Speech synthesis stage

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{AudioChunk, Sentence, forward, recv};
use crate::Result;
use crate::voice::{Synthesizer, VoiceProfile};

/// Synthesize sentences one at a time, in arrival order
///
/// All audio for a sentence is forwarded before the next sentence is
/// requested. A synthesis failure ends the stage; audio already forwarded
/// stays downstream.
///
/// # Errors
///
/// Returns the synthesizer's error, or [`crate::Error::Cancelled`]
pub async fn run_synthesis(
    synth: Arc<dyn Synthesizer>,
    profile: VoiceProfile,
    mut rx: mpsc::Receiver<Sentence>,
    tx: mpsc::Sender<AudioChunk>,
    cancel: CancellationToken,
) -> Result<()> {
    while let Some(sentence) = recv(&mut rx, &cancel).await? {
        if !speak(synth.as_ref(), &profile, &sentence, &tx, &cancel).await? {
            tracing::debug!("audio consumer gone, stopping synthesis");
            return Ok(());
        }
    }

    tracing::debug!("sentence source closed, synthesis done");
    Ok(())
}

/// Forward every chunk of one sentence; `Ok(false)` if downstream went away
async fn speak(
    synth: &dyn Synthesizer,
    profile: &VoiceProfile,
    sentence: &Sentence,
    tx: &mpsc::Sender<AudioChunk>,
    cancel: &CancellationToken,
) -> Result<bool> {
    let mut audio = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(crate::Error::Cancelled),
        opened = synth.synthesize(&sentence.text, profile) => opened.inspect_err(|e| {
            tracing::error!(index = sentence.index, error = %e, "synthesis failed");
        })?,
    };

    let mut bytes = 0usize;
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(crate::Error::Cancelled),
            next = audio.next() => next,
        };

        let Some(payload) = next else { break };
        let payload = payload.inspect_err(|e| {
            tracing::error!(index = sentence.index, error = %e, "audio stream failed");
        })?;
        if payload.is_empty() {
            continue;
        }

        bytes += payload.len();
        let chunk = AudioChunk {
            sentence: sentence.index,
            payload,
        };
        if !forward(tx, chunk, cancel).await? {
            return Ok(false);
        }
    }

    tracing::debug!(index = sentence.index, bytes, "sentence synthesized");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::Error;
    use crate::voice::AudioStream;

    /// Splits the text into two chunks, failing on a chosen sentence
    struct Halves {
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl Synthesizer for Halves {
        async fn synthesize(&self, text: &str, _profile: &VoiceProfile) -> Result<AudioStream> {
            if self.fail_on == Some(text) {
                return Err(Error::Tts("boom".to_string()));
            }
            let mid = text.len() / 2;
            let parts = vec![
                Ok(Bytes::copy_from_slice(&text.as_bytes()[..mid])),
                Ok(Bytes::copy_from_slice(&text.as_bytes()[mid..])),
            ];
            Ok(Box::pin(futures::stream::iter(parts)))
        }
    }

    fn profile() -> VoiceProfile {
        VoiceProfile {
            voice: "alloy".to_string(),
            emotion: "neutral".to_string(),
            speed: 1.0,
        }
    }

    fn sentence(index: usize, text: &str) -> Sentence {
        Sentence {
            index,
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn chunks_tagged_with_sentence_index() {
        let (sentence_tx, sentence_rx) = mpsc::channel(4);
        let (audio_tx, mut audio_rx) = mpsc::channel(16);
        sentence_tx.send(sentence(0, "abcd")).await.unwrap();
        sentence_tx.send(sentence(1, "efgh")).await.unwrap();
        drop(sentence_tx);

        run_synthesis(
            Arc::new(Halves { fail_on: None }),
            profile(),
            sentence_rx,
            audio_tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut got = Vec::new();
        while let Some(chunk) = audio_rx.recv().await {
            got.push((chunk.sentence, chunk.payload));
        }
        assert_eq!(
            got,
            [
                (0, Bytes::from_static(b"ab")),
                (0, Bytes::from_static(b"cd")),
                (1, Bytes::from_static(b"ef")),
                (1, Bytes::from_static(b"gh")),
            ]
        );
    }

    #[tokio::test]
    async fn failure_stops_stage_and_closes_output() {
        let (sentence_tx, sentence_rx) = mpsc::channel(4);
        let (audio_tx, mut audio_rx) = mpsc::channel(16);
        for (i, text) in ["one.", "two.", "three."].into_iter().enumerate() {
            sentence_tx.send(sentence(i, text)).await.unwrap();
        }
        drop(sentence_tx);

        let result = run_synthesis(
            Arc::new(Halves {
                fail_on: Some("two."),
            }),
            profile(),
            sentence_rx,
            audio_tx,
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(Error::Tts(_))));

        let mut indexes = Vec::new();
        while let Some(chunk) = audio_rx.recv().await {
            indexes.push(chunk.sentence);
        }
        assert_eq!(indexes, [0, 0]);
    }

    #[tokio::test]
    async fn cancelled_before_work() {
        let (_sentence_tx, sentence_rx) = mpsc::channel::<Sentence>(1);
        let (audio_tx, _audio_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run_synthesis(
            Arc::new(Halves { fail_on: None }),
            profile(),
            sentence_rx,
            audio_tx,
            cancel,
        )
        .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
