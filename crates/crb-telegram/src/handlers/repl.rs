//! `/repl`: a chat-driven interactive interpreter.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crb_core::{
    config::FormatLimits,
    domain::{ChatId, MessageRef},
    errors::Error,
    formatting::format_repl_output,
    messaging::port::MessagingPort,
    sandbox::{ChannelDeletion, ReplChannel, TERMINATED_STATUS},
    Result,
};
use crb_sandbox::InteractiveSession;

use crate::{router::AppState, TelegramMessenger};

const INPUT_QUEUE: usize = 16;

pub const TERMINATED_NOTICE: &str = "The repl timed out or was terminated";

type ReplKey = (i64, i64);

/// Running REPLs, keyed by (chat, user); holds the sender feeding each
/// session's stdin.
#[derive(Default)]
pub struct ReplRegistry {
    inner: Mutex<HashMap<ReplKey, mpsc::Sender<String>>>,
}

impl ReplRegistry {
    /// Claim (chat, user) for a new session; `None` if one is already running.
    pub fn register(
        self: &Arc<Self>,
        chat_id: i64,
        user_id: i64,
    ) -> Option<(ReplRegistration, mpsc::Receiver<String>)> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = (chat_id, user_id);
        if map.contains_key(&key) {
            return None;
        }
        let (tx, rx) = mpsc::channel(INPUT_QUEUE);
        map.insert(key, tx);
        Some((
            ReplRegistration {
                registry: self.clone(),
                key,
            },
            rx,
        ))
    }

    /// Hand `text` to the session of (chat, user), if any.
    ///
    /// Returns false when no session is running there, so the message should
    /// be handled normally.
    pub fn forward(&self, chat_id: i64, user_id: i64, text: &str) -> bool {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = map.get(&(chat_id, user_id)) else {
            return false;
        };
        if let Err(e) = tx.try_send(text.to_string()) {
            tracing::warn!(chat_id, user_id, "dropping repl input: {e}");
        }
        true
    }
}

/// Removes its registry entry on drop.
pub struct ReplRegistration {
    registry: Arc<ReplRegistry>,
    key: ReplKey,
}

impl Drop for ReplRegistration {
    fn drop(&mut self) {
        self.registry
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

/// A Telegram chat acting as the REPL's console.
///
/// Deleting the channel removes every message the session posted.
pub struct TelegramReplChannel {
    telegram: TelegramMessenger,
    messenger: Arc<dyn MessagingPort>,
    chat_id: ChatId,
    limits: FormatLimits,
    inputs: tokio::sync::Mutex<mpsc::Receiver<String>>,
    sent: Mutex<Vec<MessageRef>>,
}

impl TelegramReplChannel {
    pub fn new(
        telegram: TelegramMessenger,
        messenger: Arc<dyn MessagingPort>,
        chat_id: ChatId,
        limits: FormatLimits,
        inputs: mpsc::Receiver<String>,
    ) -> Self {
        Self {
            telegram,
            messenger,
            chat_id,
            limits,
            inputs: tokio::sync::Mutex::new(inputs),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn remember(&self, msg: MessageRef) {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(msg);
    }
}

#[async_trait]
impl ReplChannel for TelegramReplChannel {
    async fn send_output(&self, text: &str) -> Result<()> {
        let out = format_repl_output(text, &self.limits);
        let msg = self.messenger.send_text(self.chat_id, out.as_str()).await?;
        self.remember(msg);
        Ok(())
    }

    async fn next_input(&self) -> Result<String> {
        self.inputs
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::External("repl input closed".to_string()))
    }

    async fn delete(&self) -> ChannelDeletion {
        let sent = std::mem::take(&mut *self.sent.lock().unwrap_or_else(|e| e.into_inner()));
        merge_deletions(delete_in_order(&self.telegram, sent).await)
    }
}

async fn delete_in_order(
    telegram: &TelegramMessenger,
    sent: Vec<MessageRef>,
) -> Vec<ChannelDeletion> {
    let mut out = Vec::with_capacity(sent.len());
    for msg in sent {
        out.push(telegram.delete_message(msg).await);
    }
    out
}

/// One verdict for the whole transcript: the first hard failure wins;
/// otherwise it is gone.
fn merge_deletions(results: Vec<ChannelDeletion>) -> ChannelDeletion {
    let mut any_deleted = results.is_empty();
    for r in results {
        match r {
            ChannelDeletion::Deleted => any_deleted = true,
            ChannelDeletion::AlreadyGone => {}
            other => return other,
        }
    }
    if any_deleted {
        ChannelDeletion::Deleted
    } else {
        ChannelDeletion::AlreadyGone
    }
}

/// Start a REPL for `user_id` in `chat_id` and drive it to the end.
///
/// Runs as its own task: the dispatcher must keep delivering this user's
/// messages while the session waits for them.
pub fn spawn_repl(state: Arc<AppState>, chat_id: i64, user_id: i64) -> bool {
    let Some((registration, inputs)) = state.repls.register(chat_id, user_id) else {
        return false;
    };

    tokio::spawn(async move {
        let _registration = registration;
        let channel = TelegramReplChannel::new(
            state.telegram.clone(),
            state.messenger.clone(),
            ChatId(chat_id),
            state.cfg.format,
            inputs,
        );
        let _ = state
            .messenger
            .send_text(ChatId(chat_id), "Python REPL started. Send exit() to leave.")
            .await;

        let session = InteractiveSession::new(state.cfg.sandbox.clone(), state.cfg.repl_cleanup);
        let cancel = state.switch.run_token();
        let status = match session.run(&channel, &cancel).await {
            Ok(outcome) => {
                tracing::info!(
                    chat_id,
                    user_id,
                    state = ?outcome.state,
                    status = outcome.status,
                    killed = outcome.was_killed(),
                    "repl finished"
                );
                outcome.status
            }
            Err(e) => {
                tracing::warn!(chat_id, user_id, "repl failed: {e}");
                TERMINATED_STATUS
            }
        };

        if status == TERMINATED_STATUS {
            let _ = state
                .messenger
                .send_text(ChatId(chat_id), TERMINATED_NOTICE)
                .await;
        }
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_claims_once_and_releases_on_drop() {
        let registry = Arc::new(ReplRegistry::default());
        let (reg, mut rx) = registry.register(1, 2).unwrap();
        assert!(registry.register(1, 2).is_none());

        assert!(registry.forward(1, 2, "print(1)"));
        assert!(!registry.forward(1, 3, "print(1)"));
        assert_eq!(rx.try_recv().unwrap(), "print(1)");

        drop(reg);
        assert!(!registry.forward(1, 2, "print(2)"));
        assert!(registry.register(1, 2).is_some());
    }

    #[test]
    fn merges_transcript_deletions() {
        use ChannelDeletion::*;
        assert_eq!(merge_deletions(vec![Deleted, AlreadyGone]), Deleted);
        assert_eq!(merge_deletions(vec![AlreadyGone]), AlreadyGone);
        assert_eq!(merge_deletions(vec![Deleted, Forbidden, Deleted]), Forbidden);
        assert_eq!(merge_deletions(Vec::new()), Deleted);
    }
}
