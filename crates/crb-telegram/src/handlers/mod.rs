//! Telegram update handlers.
//!
//! Every handler is a thin adapter: check access, turn the message into
//! submissions, and hand them to the `crb-core` invocation driver.

use std::sync::Arc;

use teloxide::{prelude::*, types::User};

use crb_core::{domain::MessageId, execution::ReplyTarget};

use crate::router::AppState;

mod code;
mod commands;
mod document;
pub mod repl;

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let chat_id = msg.chat.id.0;
    let user_id = user.id.0 as i64;
    let text = msg.text();
    let is_command = text.map(|t| t.starts_with('/')).unwrap_or(false);

    if !state.cfg.is_allowed(user_id) {
        if is_command {
            let _ = bot
                .send_message(msg.chat.id, "Unauthorized. Contact the bot owner for access.")
                .await;
        }
        return Ok(());
    }

    // A running REPL owns this user's plain messages in this chat.
    if let Some(text) = text {
        if !is_command && state.repls.forward(chat_id, user_id, text) {
            return Ok(());
        }
    }

    if is_command {
        return commands::handle_command(bot, msg, state).await;
    }

    if msg.document().is_some() {
        return document::handle_document(bot, msg, state).await;
    }

    if msg.text().is_some() {
        return code::handle_code(msg, state).await;
    }

    Ok(())
}

/// How the requester is addressed in replies.
pub(crate) fn mention(user: &User) -> String {
    match &user.username {
        Some(name) => format!("@{name}"),
        None => user.full_name(),
    }
}

pub(crate) fn reply_target(msg: &Message, user: &User) -> ReplyTarget {
    ReplyTarget {
        chat_id: crb_core::domain::ChatId(msg.chat.id.0),
        reply_to: Some(MessageId(msg.id.0)),
        mention: mention(user),
    }
}
