//! Interactive interpreter sessions driven through a chat channel.

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crb_core::{
    config::SandboxLimits,
    sandbox::{ChannelDeletion, ReplChannel, SandboxOutcome, SandboxState},
    SandboxError,
};

use crate::{
    preamble,
    process::{ReadStep, SandboxSession},
};

/// Console prompts the shim passes along; they are not worth a chat message.
const CONSOLE_PROMPTS: [&str; 2] = [">>>", "..."];

/// Which side the loop is waiting on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    AwaitingOutput,
    AwaitingInput,
}

/// A REPL whose input comes from, and output goes to, a [`ReplChannel`].
#[derive(Clone, Debug)]
pub struct InteractiveSession {
    limits: SandboxLimits,
    delete_channel: bool,
}

impl InteractiveSession {
    pub fn new(limits: SandboxLimits, delete_channel: bool) -> Self {
        Self {
            limits,
            delete_channel,
        }
    }

    /// Run until the interpreter exits or is torn down.
    ///
    /// Output timeouts, the byte cap, input-wait timeouts and cancellation all
    /// end the session with `TERMINATED_STATUS`.
    pub async fn run(
        &self,
        channel: &dyn ReplChannel,
        cancel: &CancellationToken,
    ) -> Result<SandboxOutcome, SandboxError> {
        let token = sentinel();
        let shim = preamble::input_shim(&token);
        let mut session =
            SandboxSession::spawn(&self.limits, &["-u", "-E", "-I", "-c", &shim], true)?;
        session.state = SandboxState::Running;

        let mut lines = LineSplitter::new(token);
        let mut phase = Phase::AwaitingOutput;
        let mut deleted = false;

        while !session.state.is_terminal() {
            match phase {
                Phase::AwaitingInput => {
                    flush(channel, &mut lines.pending).await;
                    let input = tokio::select! {
                        _ = cancel.cancelled() => None,
                        next = timeout(self.limits.input_timeout, channel.next_input()) => match next {
                            Ok(Ok(text)) => Some(Ok(text)),
                            Ok(Err(e)) => Some(Err(e)),
                            Err(_) => {
                                tracing::info!("repl input wait timed out");
                                None
                            }
                        },
                    };
                    match input {
                        Some(Ok(text)) => {
                            session.write_line(&text).await?;
                            phase = Phase::AwaitingOutput;
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "repl channel failed");
                            deleted = self.shut_down(&mut session, channel, SandboxState::Terminated).await?;
                        }
                        None => {
                            let state = if cancel.is_cancelled() {
                                SandboxState::Terminated
                            } else {
                                SandboxState::TimedOut
                            };
                            deleted = self.shut_down(&mut session, channel, state).await?;
                        }
                    }
                }
                Phase::AwaitingOutput => match session.read_step(self.limits.read_timeout, cancel).await {
                    ReadStep::Chunk(chunk) => {
                        if session.record_bytes(chunk.len(), self.limits.output_max) {
                            deleted = self.shut_down(&mut session, channel, SandboxState::Overflowed).await?;
                            continue;
                        }
                        if lines.push(&chunk) {
                            phase = Phase::AwaitingInput;
                        }
                    }
                    ReadStep::Eof => {
                        lines.finish();
                        session.finish_on_eof(self.limits.read_timeout).await?;
                    }
                    ReadStep::TimedOut => {
                        deleted = self.shut_down(&mut session, channel, SandboxState::TimedOut).await?;
                    }
                    ReadStep::Cancelled => {
                        deleted = self.shut_down(&mut session, channel, SandboxState::Terminated).await?;
                    }
                },
            }
        }

        if !deleted {
            lines.finish();
            flush(channel, &mut lines.pending).await;
        }
        let transcript = std::mem::take(&mut lines.transcript);
        session.outcome(transcript).await
    }

    /// Delete the channel first (when configured), then kill the process.
    /// Returns whether the channel is gone.
    async fn shut_down(
        &self,
        session: &mut SandboxSession,
        channel: &dyn ReplChannel,
        state: SandboxState,
    ) -> Result<bool, SandboxError> {
        let mut deleted = false;
        if self.delete_channel {
            match channel.delete().await {
                ChannelDeletion::Deleted => deleted = true,
                ChannelDeletion::AlreadyGone => {
                    tracing::debug!("repl channel already gone");
                    deleted = true;
                }
                ChannelDeletion::Forbidden => {
                    tracing::warn!("not allowed to delete repl channel");
                }
                ChannelDeletion::Failed(e) => {
                    tracing::warn!(error = %e, "failed to delete repl channel");
                }
            }
        }
        session.terminate(state).await?;
        Ok(deleted)
    }
}

async fn flush(channel: &dyn ReplChannel, pending: &mut String) {
    if pending.trim().is_empty() {
        pending.clear();
        return;
    }
    let text = std::mem::take(pending);
    if let Err(e) = channel.send_output(&text).await {
        tracing::warn!(error = %e, "failed to send repl output");
    }
}

/// Per-session sentinel: 8 random hex chars.
fn sentinel() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Splits the merged output stream into lines and strips sentinels.
struct LineSplitter {
    token: String,
    partial: Vec<u8>,
    pending: String,
    transcript: String,
}

impl LineSplitter {
    fn new(token: String) -> Self {
        Self {
            token,
            partial: Vec::new(),
            pending: String::new(),
            transcript: String::new(),
        }
    }

    /// Feed a chunk; true when the interpreter is now blocked on input.
    fn push(&mut self, chunk: &[u8]) -> bool {
        self.partial.extend_from_slice(chunk);
        let Some(end) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return false;
        };
        let complete: Vec<u8> = self.partial.drain(..=end).collect();
        let text = String::from_utf8_lossy(&complete).into_owned();

        let mut requested = false;
        for line in text.split_inclusive('\n') {
            requested |= self.push_line(line);
        }
        requested
    }

    fn push_line(&mut self, line: &str) -> bool {
        let Some(at) = line.find(&self.token) else {
            self.emit(line);
            return false;
        };
        let before = &line[..at];
        let prompt = line[at + self.token.len()..].trim_end_matches('\n');
        self.emit(before);

        let shown = prompt.trim();
        if !shown.is_empty() && !CONSOLE_PROMPTS.contains(&shown) {
            self.emit(prompt);
            self.emit("\n");
        }
        true
    }

    fn emit(&mut self, text: &str) {
        self.pending.push_str(text);
        self.transcript.push_str(text);
    }

    /// Flush a trailing line without newline.
    fn finish(&mut self) {
        if self.partial.is_empty() {
            return;
        }
        let rest = std::mem::take(&mut self.partial);
        let text = String::from_utf8_lossy(&rest).into_owned();
        self.emit(&text);
    }
}
