/// Core error type for configuration, I/O and adapter failures.
///
/// Adapter crates should map their transport errors into this type so the bot
/// can log them consistently. Execution failures have their own closed enum.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Every way a single code execution can fail.
///
/// Callers are expected to match exhaustively; `user_message` renders the
/// reply shown to the requester so nothing escapes the invocation boundary.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("unknown language: {language}")]
    UnknownLanguage { language: String },

    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("remote execution failed ({status:?}): {message}")]
    RemoteExecutionError {
        status: Option<u16>,
        message: String,
    },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Failures of the local interpreter backend before or during a run.
///
/// Timeouts and output overflow are not errors: they are terminal sandbox
/// states and end up in the formatted reply.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to spawn interpreter: {0}")]
    Spawn(std::io::Error),

    #[error("sandbox i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sandbox channel error: {0}")]
    Channel(String),
}

impl ExecutionError {
    pub fn user_message(&self, mention: &str) -> String {
        match self {
            ExecutionError::UnknownLanguage { .. } => format!("Unknown language, {mention}"),
            ExecutionError::RateLimited { .. } => format!(
                "Bot is currently handling too many requests, try again later, {mention}"
            ),
            ExecutionError::RemoteExecutionError { .. } => {
                format!("Something went wrong while running your code, {mention}")
            }
            ExecutionError::Sandbox(_) => format!("Your code has failed to start, {mention}"),
        }
    }

    /// Transient failures the user may simply retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutionError::RateLimited { .. })
    }
}
