//! Telegram adapter (teloxide).
//!
//! This crate implements the `crb-core` MessagingPort over Telegram Bot API
//! and routes updates to the code-running handlers.

use async_trait::async_trait;

use teloxide::{prelude::*, types::ParseMode, ApiError, RequestError};

use tokio::time::sleep;

pub mod handlers;
pub mod router;

use crb_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{ChatAction, MessagingCapabilities},
    },
    sandbox::ChannelDeletion,
    Result,
};

/// Telegram's hard cap on message text.
pub const TELEGRAM_MAX_LEN: usize = 4096;

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
        teloxide::types::MessageId(message_id.0)
    }

    fn map_err(e: RequestError) -> Error {
        Error::External(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, RequestError>>,
        Fut::IntoFuture: Send,
    {
        self.with_retry_raw(&mut op).await.map_err(Self::map_err)
    }

    async fn with_retry_raw<T, Fut>(
        &self,
        op: &mut impl FnMut() -> Fut,
    ) -> std::result::Result<T, RequestError>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(RequestError::RetryAfter(d)) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    tracing::debug!(wait = ?d, "telegram asked us to retry later");
                    sleep(d).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Delete one message, classifying the failures a REPL cleanup expects.
    pub async fn delete_message(&self, msg: MessageRef) -> ChannelDeletion {
        let res = self
            .with_retry_raw(&mut || {
                self.bot
                    .delete_message(Self::tg_chat(msg.chat_id), Self::tg_msg_id(msg.message_id))
            })
            .await;
        match res {
            Ok(_) => ChannelDeletion::Deleted,
            Err(e) => classify_deletion(e),
        }
    }
}

fn classify_deletion(e: RequestError) -> ChannelDeletion {
    match e {
        RequestError::Api(
            ApiError::MessageToDeleteNotFound | ApiError::ChatNotFound | ApiError::BotKicked,
        ) => ChannelDeletion::AlreadyGone,
        RequestError::Api(ApiError::MessageCantBeDeleted) => ChannelDeletion::Forbidden,
        other => ChannelDeletion::Failed(other.to_string()),
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            supports_html: true,
            supports_chat_actions: true,
            max_message_len: TELEGRAM_MAX_LEN,
        }
    }

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        self.send_reply(chat_id, None, text).await
    }

    async fn send_reply(
        &self,
        chat_id: ChatId,
        reply_to: Option<MessageId>,
        text: &str,
    ) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                let mut req = self.bot.send_message(Self::tg_chat(chat_id), text.to_string());
                if let Some(id) = reply_to {
                    req = req
                        .reply_to_message_id(Self::tg_msg_id(id))
                        .allow_sending_without_reply(true);
                }
                req
            })
            .await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_message(Self::tg_chat(chat_id), html.to_string())
                    .parse_mode(ParseMode::Html)
            })
            .await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()> {
        let tg_action = match action {
            ChatAction::Typing => teloxide::types::ChatAction::Typing,
        };
        self.with_retry(|| self.bot.send_chat_action(Self::tg_chat(chat_id), tg_action))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_deletion_failures() {
        assert_eq!(
            classify_deletion(RequestError::Api(ApiError::MessageToDeleteNotFound)),
            ChannelDeletion::AlreadyGone
        );
        assert_eq!(
            classify_deletion(RequestError::Api(ApiError::MessageCantBeDeleted)),
            ChannelDeletion::Forbidden
        );
        assert!(matches!(
            classify_deletion(RequestError::Api(ApiError::Unknown("boom".to_string()))),
            ChannelDeletion::Failed(_)
        ));
    }
}
