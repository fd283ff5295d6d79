use std::sync::Arc;

use teloxide::prelude::*;

use crb_core::{
    domain::{ChatId, CodeSubmission},
    execution::run_and_reply,
    extract::{parse_fenced, split_language_line, FENCE},
    formatting::{escape_html, split_message},
};

use crate::router::AppState;

use super::{repl::spawn_repl, reply_target};

const HELP: &str = "\
Send a message with fenced code blocks and I will run each one:

```python
print(\"hello\")
```

Blocks whose code starts with i# are skipped.
Upload a source file to run it; the caption (or the file extension) picks the language.

Commands:
/run <language>, code on the next lines - run code without fences
/languages - list supported languages
/repl - start an interactive Python session in this chat
/eval on|off - enable or disable code execution (owner only)
/help - show this message";

const RUN_USAGE: &str = "Usage: /run <language>, then the code on the following lines";

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

/// `/run` arguments: a fenced block, or a language line followed by code
/// (fenced or not).
fn parse_run_args(args: &str) -> Option<CodeSubmission> {
    let args = args.trim();
    if args.starts_with(FENCE) {
        let block = parse_fenced(args)?;
        return (!block.source.trim().is_empty()).then(|| block.into_submission());
    }

    let block = split_language_line(args);
    let language = block.language?;
    let code = block.source.trim();
    let code = match parse_fenced(code) {
        Some(fenced) => fenced.source,
        None => code.to_string(),
    };
    if code.trim().is_empty() {
        return None;
    }
    Some(CodeSubmission::single(language, code))
}

fn parse_toggle(arg: &str) -> Option<bool> {
    match arg.trim().to_lowercase().as_str() {
        "on" | "true" | "enable" | "1" => Some(true),
        "off" | "false" | "disable" | "0" => Some(false),
        _ => None,
    }
}

pub async fn handle_command(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let chat_id = msg.chat.id.0;
    let user_id = user.id.0 as i64;
    let (cmd, args) = parse_command(text);
    tracing::debug!(chat_id, user_id, %cmd, "command");

    match cmd.as_str() {
        "start" | "help" => {
            let _ = state.messenger.send_text(ChatId(chat_id), HELP).await;
        }

        "languages" => {
            let reply = match state.backend.languages().await {
                Ok(langs) => {
                    let mut names: Vec<&str> = langs.iter().map(String::as_str).collect();
                    names.sort_unstable();
                    format!(
                        "<b>Supported languages ({})</b>\n{}",
                        names.len(),
                        escape_html(&names.join(", "))
                    )
                }
                Err(e) => {
                    tracing::warn!("language list failed: {e}");
                    escape_html(&e.user_message(&super::mention(user)))
                }
            };
            let limit = state.messenger.capabilities().max_message_len;
            for chunk in split_message(&reply, limit) {
                let _ = state.messenger.send_html(ChatId(chat_id), &chunk).await;
            }
        }

        "run" => {
            if !state.switch.is_enabled() {
                let _ = bot.send_message(msg.chat.id, "Code execution is disabled.").await;
                return Ok(());
            }
            let Some(submission) = parse_run_args(&args) else {
                let _ = bot.send_message(msg.chat.id, RUN_USAGE).await;
                return Ok(());
            };
            let target = reply_target(&msg, user);
            run_and_reply(
                state.backend.as_ref(),
                state.messenger.as_ref(),
                &target,
                &state.cfg.format,
                [submission],
            )
            .await;
        }

        "repl" => {
            if !state.switch.is_enabled() {
                let _ = bot.send_message(msg.chat.id, "Code execution is disabled.").await;
                return Ok(());
            }
            if !spawn_repl(state.clone(), chat_id, user_id) {
                let _ = bot
                    .send_message(msg.chat.id, "You already have a REPL running in this chat.")
                    .await;
            }
        }

        "eval" => {
            if state.cfg.owner_id.is_none() {
                let _ = bot
                    .send_message(msg.chat.id, "No bot owner is configured.")
                    .await;
                return Ok(());
            }
            if !state.cfg.is_owner(user_id) {
                let _ = bot
                    .send_message(msg.chat.id, "Only the bot owner can do that.")
                    .await;
                return Ok(());
            }

            let reply = match parse_toggle(&args) {
                Some(enabled) => {
                    let prev = state.switch.set_enabled(enabled);
                    tracing::info!(user_id, enabled, prev, "code execution toggled");
                    if enabled {
                        "Code execution enabled."
                    } else {
                        "Code execution disabled; running code was stopped."
                    }
                }
                None if args.is_empty() => {
                    if state.switch.is_enabled() {
                        "Code execution is enabled."
                    } else {
                        "Code execution is disabled."
                    }
                }
                None => "Usage: /eval on|off",
            };
            let _ = bot.send_message(msg.chat.id, reply).await;
        }

        // Other bots' commands in group chats.
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_with_bot_suffix() {
        assert_eq!(
            parse_command("/Run@crb_bot python\nprint(1)"),
            ("run".to_string(), "python\nprint(1)".to_string())
        );
        assert_eq!(parse_command("/help"), ("help".to_string(), String::new()));
    }

    #[test]
    fn run_args_take_language_line_then_code() {
        let sub = parse_run_args("python\nprint(1)").unwrap();
        assert_eq!(sub.language(), "python");
        assert_eq!(sub.joined_source(), "print(1)");

        let sub = parse_run_args("rust\n```\nfn main() {}\n```").unwrap();
        assert_eq!(sub.language(), "rust");
        assert_eq!(sub.joined_source(), "fn main() {}");

        let sub = parse_run_args("```js\nconsole.log(1)\n```").unwrap();
        assert_eq!(sub.language(), "js");

        assert!(parse_run_args("python").is_none());
        assert!(parse_run_args("").is_none());
    }

    #[test]
    fn run_args_without_language_line_are_rejected() {
        assert!(parse_run_args("x = 1").is_none());
        assert!(parse_run_args("x = 1\nprint(x)").is_none());
        assert!(parse_run_args("python print(1)").is_none());
    }

    #[test]
    fn toggles() {
        assert_eq!(parse_toggle("ON"), Some(true));
        assert_eq!(parse_toggle("off"), Some(false));
        assert_eq!(parse_toggle("maybe"), None);
    }
}
