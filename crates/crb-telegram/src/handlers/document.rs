use std::sync::Arc;

use teloxide::{net::Download, prelude::*};

use crb_core::{
    domain::{CodeSubmission, SourceFile},
    execution::run_and_reply,
};

use crate::router::AppState;

use super::reply_target;

const MAX_FILE_SIZE: u64 = 256 * 1024; // 256KB

/// File extensions whose runtime name differs from the extension.
const EXTENSION_LANGUAGES: &[(&str, &str)] = &[
    ("py", "python"),
    ("rs", "rust"),
    ("js", "javascript"),
    ("mjs", "javascript"),
    ("ts", "typescript"),
    ("cpp", "c++"),
    ("cc", "c++"),
    ("cxx", "c++"),
    ("rb", "ruby"),
    ("sh", "bash"),
    ("kt", "kotlin"),
    ("cs", "csharp"),
    ("pl", "perl"),
    ("hs", "haskell"),
];

/// Language for an uploaded file: first word of the caption, else derived
/// from the file extension.
fn language_for(caption: Option<&str>, file_name: Option<&str>) -> Option<String> {
    if let Some(word) = caption.and_then(|c| c.split_whitespace().next()) {
        return Some(word.to_lowercase());
    }

    let (_, ext) = file_name?.rsplit_once('.')?;
    let ext = ext.to_lowercase();
    if ext.is_empty() {
        return None;
    }
    let lang = EXTENSION_LANGUAGES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, l)| l.to_string())
        .unwrap_or(ext);
    Some(lang)
}

async fn download_source(bot: &Bot, doc: &teloxide::types::Document) -> anyhow::Result<String> {
    let file = bot.get_file(doc.file.id.clone()).await?;
    let mut buf: Vec<u8> = Vec::new();
    bot.download_file(&file.path, &mut buf).await?;
    Ok(String::from_utf8(buf)?)
}

/// Run an uploaded source file as a single named file.
pub async fn handle_document(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let (Some(user), Some(doc)) = (msg.from(), msg.document()) else {
        return Ok(());
    };
    if !state.switch.is_enabled() {
        return Ok(());
    }

    let file_name = doc.file_name.clone();
    let Some(language) = language_for(msg.caption(), file_name.as_deref()) else {
        let _ = bot
            .send_message(
                msg.chat.id,
                "Add the language as the caption, or use a file extension.",
            )
            .reply_to_message_id(msg.id)
            .await;
        return Ok(());
    };

    if u64::from(doc.file.size) > MAX_FILE_SIZE {
        let _ = bot
            .send_message(msg.chat.id, "File too large to run (max 256KB).")
            .reply_to_message_id(msg.id)
            .await;
        return Ok(());
    }

    let source = match download_source(&bot, doc).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(chat_id = msg.chat.id.0, "document download failed: {e}");
            let _ = bot
                .send_message(msg.chat.id, "Could not read that file as text.")
                .reply_to_message_id(msg.id)
                .await;
            return Ok(());
        }
    };

    let file = match file_name {
        Some(name) => SourceFile::named(name, source),
        None => SourceFile::anonymous(source),
    };
    let submission = CodeSubmission::new(language, vec![file]);

    let target = reply_target(&msg, user);
    run_and_reply(
        state.backend.as_ref(),
        state.messenger.as_ref(),
        &target,
        &state.cfg.format,
        [submission],
    )
    .await;

    Ok(())
}
