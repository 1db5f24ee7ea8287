//! Single-turn admission gate

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::{Error, Result};

/// Admits one turn at a time
///
/// Holding a [`TurnPermit`] marks a turn as in flight; dropping it, on any
/// exit path, lets the next turn in.
#[derive(Debug, Clone)]
pub struct TurnGate {
    slot: Arc<Semaphore>,
    log_interval: Duration,
}

/// Proof that the holder owns the in-flight slot
#[derive(Debug)]
pub struct TurnPermit {
    _permit: OwnedSemaphorePermit,
}

impl TurnGate {
    /// Create an open gate that logs every `log_interval` while a caller waits
    #[must_use]
    pub fn new(log_interval: Duration) -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
            log_interval,
        }
    }

    /// Wait until no other turn is in flight, then claim the slot
    ///
    /// # Errors
    ///
    /// Returns error if the gate has been closed
    pub async fn acquire(&self) -> Result<TurnPermit> {
        match Arc::clone(&self.slot).try_acquire_owned() {
            Ok(permit) => return Ok(TurnPermit { _permit: permit }),
            Err(TryAcquireError::Closed) => return Err(closed()),
            Err(TryAcquireError::NoPermits) => {}
        }

        let waiting_since = tokio::time::Instant::now();
        let acquire = Arc::clone(&self.slot).acquire_owned();
        tokio::pin!(acquire);

        let period = self.log_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(waiting_since + period, period);

        loop {
            tokio::select! {
                permit = &mut acquire => {
                    let permit = permit.map_err(|_| closed())?;
                    tracing::debug!(
                        waited_ms = u64::try_from(waiting_since.elapsed().as_millis()).unwrap_or(u64::MAX),
                        "turn admitted"
                    );
                    return Ok(TurnPermit { _permit: permit });
                }
                _ = ticker.tick() => {
                    tracing::info!("waiting for the previous turn to finish");
                }
            }
        }
    }

    /// Whether a turn currently holds the slot
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }
}

fn closed() -> Error {
    Error::Pipeline("turn gate closed".to_string())
}
