//! Audio capture through an external recorder process
//!
//! The recorder writes encoded audio to stdout until it is interrupted.
//! The default is `sox -d -t wav -`, which flushes a complete WAV stream
//! on SIGINT.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::{Error, Result};

/// How long a recorder gets to exit after being interrupted
const STOP_GRACE: Duration = Duration::from_secs(3);

struct Recording {
    child: Child,
    output: JoinHandle<std::io::Result<Vec<u8>>>,
    started_at: Instant,
}

/// Starts and stops one recorder process at a time
pub struct AudioRecorder {
    command: Vec<String>,
    active: Option<Recording>,
    buffer: Vec<u8>,
}

impl AudioRecorder {
    /// Create a recorder that runs `command` (program followed by args)
    #[must_use]
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            active: None,
            buffer: Vec::new(),
        }
    }

    /// Clear the buffer and launch the recorder
    ///
    /// # Errors
    ///
    /// Returns error if already recording or the process cannot be spawned
    pub fn start(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Err(Error::Capture("already recording".to_string()));
        }

        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| Error::Config("capture command is empty".to_string()))?;

        self.buffer.clear();

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Capture(format!("failed to start {program}: {e}")))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Capture("recorder stdout not captured".to_string()))?;

        let output = tokio::spawn(async move {
            let mut bytes = Vec::new();
            stdout.read_to_end(&mut bytes).await?;
            Ok(bytes)
        });

        tracing::info!(program = %program, pid = child.id(), "recording started");

        self.active = Some(Recording {
            child,
            output,
            started_at: Instant::now(),
        });
        Ok(())
    }

    /// Interrupt the recorder and wait for it to flush its output
    ///
    /// # Errors
    ///
    /// Returns error if not recording, or if the recorder failed before it
    /// was asked to stop
    pub async fn stop(&mut self) -> Result<()> {
        let Some(Recording {
            mut child,
            output,
            started_at,
        }) = self.active.take()
        else {
            return Err(Error::Capture("stop called without start".to_string()));
        };

        if let Some(status) = child.try_wait()? {
            if !status.success() {
                output.abort();
                return Err(Error::Capture(format!("recorder exited early: {status}")));
            }
        } else {
            interrupt(&mut child)?;
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(status) => tracing::debug!(status = %status?, "recorder exited"),
                Err(_) => {
                    tracing::warn!("recorder ignored interrupt, killing");
                    child.kill().await?;
                }
            }
        }

        self.buffer = output
            .await
            .map_err(|e| Error::Capture(format!("recorder output task failed: {e}")))??;

        tracing::info!(
            bytes = self.buffer.len(),
            elapsed_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "recording stopped"
        );
        Ok(())
    }

    /// Audio captured by the last completed recording
    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return Ok(());
    };

    match signal::kill(Pid::from_raw(pid), Signal::SIGINT) {
        // Already gone
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::Capture(format!("failed to interrupt recorder: {e}"))),
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) -> Result<()> {
    child.start_kill()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn stop_without_start_is_an_error() {
        let mut recorder = AudioRecorder::new(sh("true"));
        assert!(matches!(recorder.stop().await, Err(Error::Capture(_))));
    }

    #[tokio::test]
    async fn empty_command_rejected() {
        let mut recorder = AudioRecorder::new(Vec::new());
        assert!(matches!(recorder.start(), Err(Error::Config(_))));
        assert!(!recorder.is_recording());
    }

    #[tokio::test]
    async fn double_start_rejected() {
        let mut recorder = AudioRecorder::new(sh("exec sleep 30"));
        recorder.start().unwrap();
        assert!(recorder.start().is_err());
        recorder.stop().await.unwrap();
    }
}
