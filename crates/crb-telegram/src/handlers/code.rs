use std::sync::Arc;

use teloxide::prelude::*;

use crb_core::{
    domain::CodeSubmission,
    execution::run_and_reply,
    extract::runnable_blocks,
};

use crate::router::AppState;

use super::reply_target;

/// Run every fenced block in a plain message, replying in order.
pub async fn handle_code(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let (Some(user), Some(text)) = (msg.from(), msg.text()) else {
        return Ok(());
    };
    if !state.switch.is_enabled() {
        return Ok(());
    }

    let submissions: Vec<CodeSubmission> = runnable_blocks(text)
        .map(|block| block.into_submission())
        .collect();
    if submissions.is_empty() {
        return Ok(());
    }

    let target = reply_target(&msg, user);
    let delivered = run_and_reply(
        state.backend.as_ref(),
        state.messenger.as_ref(),
        &target,
        &state.cfg.format,
        submissions,
    )
    .await;
    tracing::debug!(chat_id = msg.chat.id.0, delivered, "code blocks answered");

    Ok(())
}
