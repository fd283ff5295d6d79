//! One-shot sandboxed interpreter runs.

use std::{os::unix::process::ExitStatusExt, process::Stdio, time::Duration};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, Command},
    sync::mpsc,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crb_core::{
    config::SandboxLimits,
    sandbox::{SandboxOutcome, SandboxState, TERMINATED_STATUS},
    SandboxError,
};

use crate::preamble;

pub const READ_CHUNK_SIZE: usize = 10_000;

/// How long a SIGTERM'd process gets before it is SIGKILL'd.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Spawns hardened interpreter processes.
#[derive(Clone, Debug)]
pub struct ProcessSandbox {
    limits: SandboxLimits,
}

impl ProcessSandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    /// Spawn the interpreter with user code passed through `-c`, so nothing
    /// the user controls is written to disk. Output is unbuffered: each print
    /// reaches the read loop as it happens.
    pub fn start(&self, source: &str) -> Result<SandboxSession, SandboxError> {
        let script = preamble::hardened(source);
        SandboxSession::spawn(&self.limits, &["-u", "-E", "-I", "-c", &script], false)
    }

    /// Run `source` to a terminal state.
    pub async fn run(
        &self,
        source: &str,
        cancel: &CancellationToken,
    ) -> Result<SandboxOutcome, SandboxError> {
        let mut session = self.start(source)?;
        session.drive(&self.limits, cancel).await
    }
}

/// What one step of the read loop produced.
pub(crate) enum ReadStep {
    Chunk(Vec<u8>),
    Eof,
    TimedOut,
    Cancelled,
}

/// A live interpreter process plus everything read from it so far.
///
/// stdout and stderr are merged into one stream by two reader tasks feeding
/// the same channel.
pub struct SandboxSession {
    child: Child,
    stdin: Option<ChildStdin>,
    output_rx: mpsc::Receiver<Vec<u8>>,
    pub(crate) output: Vec<u8>,
    output_bytes: usize,
    pub(crate) state: SandboxState,
}

impl SandboxSession {
    pub(crate) fn spawn(
        limits: &SandboxLimits,
        args: &[&str],
        interactive: bool,
    ) -> Result<Self, SandboxError> {
        let mut cmd = Command::new(&limits.python_path);
        cmd.args(args)
            .stdin(if interactive {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(SandboxError::Spawn)?;
        tracing::debug!(pid = child.id(), interactive, "sandbox process spawned");

        let (tx, output_rx) = mpsc::channel(16);
        if let Some(stdout) = child.stdout.take() {
            forward_chunks(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_chunks(stderr, tx);
        }
        let stdin = child.stdin.take();

        Ok(Self {
            child,
            stdin,
            output_rx,
            output: Vec::new(),
            output_bytes: 0,
            state: SandboxState::Created,
        })
    }

    /// Read loop: chunk by chunk until exit, timeout, overflow or cancel.
    pub async fn drive(
        &mut self,
        limits: &SandboxLimits,
        cancel: &CancellationToken,
    ) -> Result<SandboxOutcome, SandboxError> {
        self.state = SandboxState::Running;

        while !self.state.is_terminal() {
            match self.read_step(limits.read_timeout, cancel).await {
                ReadStep::Chunk(chunk) => {
                    self.output.extend_from_slice(&chunk);
                    if self.record_bytes(chunk.len(), limits.output_max) {
                        self.terminate(SandboxState::Overflowed).await?;
                    }
                }
                ReadStep::Eof => self.finish_on_eof(limits.read_timeout).await?,
                ReadStep::TimedOut => self.terminate(SandboxState::TimedOut).await?,
                ReadStep::Cancelled => self.terminate(SandboxState::Terminated).await?,
            }
        }

        let output = String::from_utf8_lossy(&self.output).into_owned();
        self.outcome(output).await
    }

    /// Wait for the next output chunk, bounded by `read_timeout`.
    pub(crate) async fn read_step(
        &mut self,
        read_timeout: Duration,
        cancel: &CancellationToken,
    ) -> ReadStep {
        tokio::select! {
            _ = cancel.cancelled() => ReadStep::Cancelled,
            next = timeout(read_timeout, self.output_rx.recv()) => match next {
                Ok(Some(chunk)) => ReadStep::Chunk(chunk),
                Ok(None) => ReadStep::Eof,
                Err(_) => ReadStep::TimedOut,
            },
        }
    }

    /// Add `n` bytes to the running count; true once the cap is exceeded.
    pub(crate) fn record_bytes(&mut self, n: usize, output_max: usize) -> bool {
        self.output_bytes = self.output_bytes.saturating_add(n);
        self.output_bytes > output_max
    }

    /// Both streams closed: the process is exiting (or closed its pipes and
    /// hangs, which counts as a timeout).
    pub(crate) async fn finish_on_eof(&mut self, grace: Duration) -> Result<(), SandboxError> {
        match timeout(grace, self.child.wait()).await {
            Ok(status) => {
                status?;
                self.state = SandboxState::Completed;
                Ok(())
            }
            Err(_) => self.terminate(SandboxState::TimedOut).await,
        }
    }

    /// Write one line of user input to the process.
    pub(crate) async fn write_line(&mut self, text: &str) -> Result<(), SandboxError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| SandboxError::Channel("sandbox stdin is not piped".to_string()))?;
        let mut line = text.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// SIGTERM the process (SIGKILL after a grace period) and enter `state`.
    pub(crate) async fn terminate(&mut self, state: SandboxState) -> Result<(), SandboxError> {
        tracing::info!(pid = self.child.id(), ?state, "terminating sandbox process");
        self.state = state;

        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        if let Some(pid) = self.child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        match timeout(TERM_GRACE, self.child.wait()).await {
            Ok(status) => {
                status?;
            }
            Err(_) => {
                self.child.kill().await?;
            }
        }
        Ok(())
    }

    /// Final status: the exit code, the killing signal for a crash, or
    /// `TERMINATED_STATUS` when we ended the process.
    pub(crate) async fn outcome(&mut self, output: String) -> Result<SandboxOutcome, SandboxError> {
        let status = if self.state == SandboxState::Completed {
            let exit = self.child.wait().await?;
            exit.code()
                .or_else(|| exit.signal())
                .unwrap_or(TERMINATED_STATUS)
        } else {
            TERMINATED_STATUS
        };

        tracing::debug!(state = ?self.state, status, bytes = self.output_bytes, "sandbox finished");
        Ok(SandboxOutcome {
            state: self.state,
            status,
            output,
            output_bytes: self.output_bytes,
        })
    }
}

fn forward_chunks<R>(mut stream: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}
