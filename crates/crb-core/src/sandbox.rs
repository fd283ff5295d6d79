//! Local interpreter sessions: states, outcomes and the chat-side port used by
//! interactive sessions.

use async_trait::async_trait;
use nix::sys::signal::Signal;

use crate::{domain::ExecutionResult, Result};

/// Status reported for a process we had to kill.
pub const TERMINATED_STATUS: i32 = Signal::SIGTERM as i32;

/// Lifecycle of one sandboxed process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxState {
    Created,
    Running,
    /// Exited on its own.
    Completed,
    /// A single read (or input wait) took longer than allowed.
    TimedOut,
    /// Produced more output than the byte cap.
    Overflowed,
    /// Killed on request (execution disabled, channel torn down).
    Terminated,
}

impl SandboxState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SandboxState::Created | SandboxState::Running)
    }
}

/// Final state of a finished sandbox run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxOutcome {
    pub state: SandboxState,
    /// Exit code, or `TERMINATED_STATUS` when the process was killed.
    pub status: i32,
    pub output: String,
    pub output_bytes: usize,
}

impl SandboxOutcome {
    pub fn was_killed(&self) -> bool {
        self.state != SandboxState::Completed
    }

    pub fn into_result(self, language: &str) -> ExecutionResult {
        ExecutionResult {
            exit_signal: None,
            exit_code: Some(self.status),
            stdout: self.output,
            language: language.to_string(),
        }
    }
}

/// Result of asking the transport to delete the hosting channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelDeletion {
    Deleted,
    AlreadyGone,
    Forbidden,
    Failed(String),
}

/// The chat a REPL session talks through.
///
/// The session owns the timeouts; implementations simply wait.
#[async_trait]
pub trait ReplChannel: Send + Sync {
    /// Show interpreter output to the user.
    async fn send_output(&self, text: &str) -> Result<()>;

    /// Wait for the next message from the invoking user in this channel.
    async fn next_input(&self) -> Result<String>;

    /// Tear down the hosting channel.
    async fn delete(&self) -> ChannelDeletion;
}
