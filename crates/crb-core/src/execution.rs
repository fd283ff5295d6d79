//! Execution backends and the per-message invocation driver.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    config::FormatLimits,
    domain::{ChatId, CodeSubmission, ExecutionResult, MessageId},
    errors::ExecutionError,
    formatting::{format_result, FormattedOutput},
    messaging::{port::MessagingPort, types::ChatAction},
};

/// Something that can run a submission to completion.
///
/// Implemented by the remote Piston client and the local interpreter sandbox.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Language identifiers (and aliases) accepted by `execute`, lower-cased.
    async fn languages(&self) -> Result<Arc<HashSet<String>>, ExecutionError>;

    async fn execute(&self, submission: &CodeSubmission)
        -> Result<ExecutionResult, ExecutionError>;

    /// Render a result for the requester.
    fn render(
        &self,
        result: &ExecutionResult,
        mention: &str,
        limits: &FormatLimits,
    ) -> FormattedOutput {
        format_result(result, mention, limits)
    }
}

/// Bot-wide "code execution enabled" toggle.
///
/// Disabling cancels the token every running sandbox watches and installs a
/// fresh one for later runs.
#[derive(Debug)]
pub struct ExecutionSwitch {
    enabled: AtomicBool,
    token: Mutex<CancellationToken>,
}

impl ExecutionSwitch {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            token: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Returns the previous state.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        let prev = self.enabled.swap(enabled, Ordering::SeqCst);
        if prev && !enabled {
            let mut guard = self.token.lock().unwrap_or_else(|e| e.into_inner());
            guard.cancel();
            *guard = CancellationToken::new();
            tracing::info!("code execution disabled, running sandboxes cancelled");
        }
        prev
    }

    /// Token for a run starting now; fires when execution gets disabled.
    pub fn run_token(&self) -> CancellationToken {
        self.token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .child_token()
    }
}

/// Where replies for one invocation go.
#[derive(Clone, Debug)]
pub struct ReplyTarget {
    pub chat_id: ChatId,
    pub reply_to: Option<MessageId>,
    pub mention: String,
}

/// Execute submissions one after another and reply to each in order.
///
/// Every failure is turned into a user-facing reply here; nothing escapes to
/// the message loop. Returns the number of replies delivered.
pub async fn run_and_reply<I>(
    backend: &dyn ExecutionBackend,
    messenger: &dyn MessagingPort,
    target: &ReplyTarget,
    limits: &FormatLimits,
    submissions: I,
) -> usize
where
    I: IntoIterator<Item = CodeSubmission>,
{
    let mut delivered = 0usize;

    for submission in submissions {
        if let Err(e) = messenger
            .send_chat_action(target.chat_id, ChatAction::Typing)
            .await
        {
            tracing::debug!("typing indicator failed: {e}");
        }

        let text = execute_one(backend, &submission, &target.mention, limits).await;

        match messenger
            .send_reply(target.chat_id, target.reply_to, &text)
            .await
        {
            Ok(_) => delivered += 1,
            Err(e) => tracing::warn!(chat_id = target.chat_id.0, "failed to send reply: {e}"),
        }
    }

    delivered
}

/// Run one submission and produce the reply text, success or not.
pub async fn execute_one(
    backend: &dyn ExecutionBackend,
    submission: &CodeSubmission,
    mention: &str,
    limits: &FormatLimits,
) -> String {
    tracing::info!(
        backend = backend.name(),
        language = submission.language(),
        files = submission.files().len(),
        "executing submission"
    );

    match backend.execute(submission).await {
        Ok(result) => backend.render(&result, mention, limits).into_string(),
        Err(e) => {
            match &e {
                ExecutionError::UnknownLanguage { .. } => tracing::debug!("{e}"),
                _ if e.is_transient() => tracing::warn!("{e}"),
                _ => tracing::error!(backend = backend.name(), "{e}"),
            }
            FormattedOutput::bounded(e.user_message(mention), limits.max_len).into_string()
        }
    }
}
