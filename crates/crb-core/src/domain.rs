/// Chat user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UserId(pub i64);

/// Chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// Message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// A stable reference to a chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// One named source file sent to an execution backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    pub name: Option<String>,
    pub content: String,
}

impl SourceFile {
    pub fn anonymous(content: impl Into<String>) -> Self {
        Self {
            name: None,
            content: content.into(),
        }
    }

    pub fn named(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            content: content.into(),
        }
    }
}

/// Code extracted from a message or an uploaded file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeSubmission {
    language: String,
    files: Vec<SourceFile>,
}

impl CodeSubmission {
    pub fn new(language: impl Into<String>, files: Vec<SourceFile>) -> Self {
        Self {
            language: language.into(),
            files,
        }
    }

    pub fn single(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(language, vec![SourceFile::anonymous(source)])
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }

    /// Concatenated source of every file (local backends run a single script).
    pub fn joined_source(&self) -> String {
        self.files
            .iter()
            .map(|f| f.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Raw outcome of one execution, before formatting.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_signal: Option<i32>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub language: String,
}

impl ExecutionResult {
    /// Return status used for reporting.
    ///
    /// A non-zero signal wins over the exit code: the process was killed.
    pub fn effective_status(&self) -> i32 {
        match (self.exit_signal, self.exit_code) {
            (Some(sig), _) if sig != 0 => sig,
            (_, Some(code)) => code,
            (Some(sig), None) => sig,
            (None, None) => 0,
        }
    }
}
