//! Chat completion stage

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::forward;
use crate::llm::{ChatRequest, ChatSource};
use crate::{Error, Result};

/// What the completion stage produced
#[derive(Debug)]
pub struct Completion {
    /// Every fragment received, concatenated; partial if `result` is an error
    pub text: String,
    /// How the stream ended
    pub result: Result<()>,
}

/// Stream a chat reply, forwarding each fragment to `tx`
///
/// The reply text is returned even when the stream fails part way, so the
/// caller can still record a partial answer.
pub async fn run_completion(
    chat: Arc<dyn ChatSource>,
    request: ChatRequest,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> Completion {
    let mut text = String::new();
    let result = stream_into(chat.as_ref(), &request, &tx, &cancel, &mut text).await;

    match &result {
        Ok(()) => tracing::debug!(chars = text.chars().count(), "chat stream complete"),
        Err(e) => tracing::warn!(error = %e, chars = text.chars().count(), "chat stream ended early"),
    }

    Completion { text, result }
}

async fn stream_into(
    chat: &dyn ChatSource,
    request: &ChatRequest,
    tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
    text: &mut String,
) -> Result<()> {
    let mut stream = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(Error::Cancelled),
        opened = chat.stream_chat(request) => opened?,
    };

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            next = stream.next() => next,
        };

        let Some(fragment) = next else {
            return Ok(());
        };
        let fragment = fragment?;
        text.push_str(&fragment);

        if !forward(tx, fragment, cancel).await? {
            tracing::debug!("text consumer gone, stopping chat stream");
            return Ok(());
        }
    }
}
