//! Rendering execution results into chat-sized replies.

use nix::sys::signal::Signal;

use crate::{config::FormatLimits, domain::ExecutionResult};

/// Characters added around the body by `assemble`: ", ", ".\n\n```", "\n", "\n```".
const FORMAT_OVERHEAD: usize = 13;

const NO_OUTPUT: &str = "No output detected";
const TOO_LARGE: &str = "Output too large to send";
const TRUNCATED: &str = "... truncated, too many lines";

/// A reply that is guaranteed to fit the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormattedOutput(String);

impl FormattedOutput {
    /// Wrap `text`, cutting it to `max_len` characters if needed.
    pub fn bounded(text: String, max_len: usize) -> Self {
        if text.chars().count() <= max_len {
            return Self(text);
        }
        Self(text.chars().take(max_len).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for FormattedOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of the OS signal matching `status`, if any (`15` -> `SIGTERM`).
pub fn signal_name(status: i32) -> Option<&'static str> {
    Signal::try_from(status).ok().map(Signal::as_str)
}

/// Format a remote execution result for the requester.
pub fn format_result(
    result: &ExecutionResult,
    mention: &str,
    limits: &FormatLimits,
) -> FormattedOutput {
    let status = result.effective_status();
    let mut msg = format!(
        "Your {} code has finished running with return code {status}",
        result.language
    );
    if let Some(name) = signal_name(status) {
        msg.push_str(&format!(" ({name})"));
    }

    let (lang, body) = if result.stdout.is_empty() {
        ("", NO_OUTPUT.to_string())
    } else {
        (
            result.language.as_str(),
            number_lines(&result.stdout, limits.max_lines),
        )
    };

    assemble(mention, &msg, lang, &body, limits.max_len)
}

/// Format the outcome of a local interpreter run.
///
/// Local runs report a forced termination as SIGTERM and a fatal interpreter
/// error as 255; both get their own wording instead of the raw status.
pub fn format_sandbox_result(
    result: &ExecutionResult,
    mention: &str,
    limits: &FormatLimits,
) -> FormattedOutput {
    let status = result.effective_status();
    let output = result.stdout.trim();

    let (msg, body) = match status {
        s if s == Signal::SIGTERM as i32 => (
            "Your code timed out or ran out of memory".to_string(),
            body_or_placeholder(output, limits.max_lines),
        ),
        255 => (
            "Your code has failed".to_string(),
            "A fatal error has occurred".to_string(),
        ),
        s => {
            let mut msg = format!("Your code has finished running with return code {s}");
            if let Some(name) = signal_name(s) {
                msg.push_str(&format!(" ({name})"));
            }
            (msg, body_or_placeholder(output, limits.max_lines))
        }
    };

    assemble(mention, &msg, "", &body, limits.max_len)
}

/// Wrap a chunk of interactive output in a fence, keeping the newest lines
/// when it does not fit.
pub fn format_repl_output(output: &str, limits: &FormatLimits) -> FormattedOutput {
    let fence_overhead = "```\n\n```".len();
    let budget = limits.max_len.saturating_sub(fence_overhead);
    let trimmed = output.trim_end_matches('\n');

    let count = trimmed.chars().count();
    let body = if count <= budget {
        trimmed.to_string()
    } else {
        let marker = "...\n";
        let keep = budget.saturating_sub(marker.len());
        let tail: String = trimmed.chars().skip(count - keep).collect();
        format!("{marker}{tail}")
    };

    FormattedOutput::bounded(format!("```\n{body}\n```"), limits.max_len)
}

/// Escape HTML special characters for HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Split text on line boundaries into chunks of at most `limit` characters.
///
/// Lines longer than `limit` are hard-split.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut out = Vec::new();
    let mut chunk = String::new();
    let mut chunk_len = 0usize;

    for line in text.split('\n') {
        let mut rest: Vec<char> = line.chars().collect();
        loop {
            let sep = usize::from(chunk_len > 0);
            if chunk_len + sep + rest.len() <= limit {
                if sep == 1 {
                    chunk.push('\n');
                }
                chunk.extend(rest.iter());
                chunk_len += sep + rest.len();
                break;
            }
            if chunk_len > 0 {
                out.push(std::mem::take(&mut chunk));
                chunk_len = 0;
                continue;
            }
            let tail = rest.split_off(limit);
            out.push(rest.into_iter().collect());
            rest = tail;
        }
    }

    if !chunk.is_empty() {
        out.push(chunk);
    }
    out
}

fn body_or_placeholder(output: &str, max_lines: usize) -> String {
    if output.is_empty() {
        NO_OUTPUT.to_string()
    } else {
        number_lines(output, max_lines)
    }
}

fn number_lines(output: &str, max_lines: usize) -> String {
    let mut lines: Vec<String> = output
        .split('\n')
        .enumerate()
        .map(|(i, line)| format!("{:03} | {line}", i + 1))
        .collect();
    // A final newline leaves an empty artifact line behind.
    if output.ends_with('\n') {
        lines.pop();
    }

    if lines.len() > max_lines {
        lines.truncate(max_lines.saturating_sub(1));
        lines.push(TRUNCATED.to_string());
    }
    lines.join("\n")
}

fn assemble(mention: &str, msg: &str, lang: &str, body: &str, max_len: usize) -> FormattedOutput {
    let size = |lang: &str, body: &str| {
        mention.chars().count()
            + msg.chars().count()
            + lang.chars().count()
            + body.chars().count()
            + FORMAT_OVERHEAD
    };

    let (lang, body) = if size(lang, body) > max_len {
        ("", TOO_LARGE)
    } else {
        (lang, body)
    };

    let suffix = format!(".\n\n```{lang}\n{body}\n```");
    let room = max_len.saturating_sub(suffix.chars().count());
    let head = status_line(mention, msg, room);
    FormattedOutput::bounded(format!("{head}{suffix}"), max_len)
}

/// `"{mention}, {msg}"` in at most `room` characters: the mention is cut
/// first, then the message.
fn status_line(mention: &str, msg: &str, room: usize) -> String {
    let msg_len = msg.chars().count();
    if mention.chars().count() + 2 + msg_len <= room {
        return format!("{mention}, {msg}");
    }
    if msg_len + 2 < room {
        let mention: String = mention.chars().take(room - msg_len - 2).collect();
        return format!("{mention}, {msg}");
    }
    msg.chars().take(room).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> FormatLimits {
        FormatLimits::default()
    }

    fn result(stdout: &str) -> ExecutionResult {
        ExecutionResult {
            exit_signal: None,
            exit_code: Some(0),
            stdout: stdout.to_string(),
            language: "python".to_string(),
        }
    }

    #[test]
    fn formats_hello_world() {
        let out = format_result(&result("hello\nworld\n"), "@alice", &limits());
        assert_eq!(
            out.as_str(),
            "@alice, Your python code has finished running with return code 0.\n\n```python\n001 | hello\n002 | world\n```"
        );
    }

    #[test]
    fn empty_stdout_clears_language() {
        let out = format_result(&result(""), "@alice", &limits());
        assert!(out.as_str().ends_with("```\nNo output detected\n```"));
        assert!(!out.as_str().contains("```python"));
    }

    #[test]
    fn truncates_after_nine_lines() {
        let stdout: String = (1..=15).map(|i| format!("line {i}\n")).collect();
        let out = format_result(&result(&stdout), "@a", &limits());
        let body: Vec<&str> = out
            .as_str()
            .split("```python\n")
            .nth(1)
            .unwrap()
            .trim_end_matches("\n```")
            .lines()
            .collect();
        assert_eq!(body.len(), 10);
        assert_eq!(body[8], "009 | line 9");
        assert_eq!(body[9], TRUNCATED);
    }

    #[test]
    fn exactly_ten_lines_are_kept() {
        let stdout: String = (1..=10).map(|i| format!("{i}\n")).collect();
        let out = format_result(&result(&stdout), "@a", &limits());
        assert!(out.as_str().contains("010 | 10"));
        assert!(!out.as_str().contains(TRUNCATED));
    }

    #[test]
    fn keeps_last_line_without_trailing_newline() {
        let out = format_result(&result("a\nb"), "@a", &limits());
        assert!(out.as_str().contains("002 | b"));
    }

    #[test]
    fn oversized_output_is_replaced() {
        let stdout = "x".repeat(3000);
        let out = format_result(&result(&stdout), "@a", &limits());
        assert!(out.len() <= 2000);
        assert!(out.as_str().ends_with("```\nOutput too large to send\n```"));
    }

    #[test]
    fn length_bound_holds_for_huge_mentions() {
        let mention = "@".repeat(5000);
        let out = format_result(&result("hi\n"), &mention, &limits());
        assert!(out.len() <= 2000);
        assert!(out.as_str().ends_with(".\n\n```\nOutput too large to send\n```"));
    }

    #[test]
    fn long_mention_is_cut_before_the_status() {
        let mention = "@".repeat(1990);
        let out = format_result(&result("hi\n"), &mention, &limits());
        assert_eq!(out.len(), 2000);
        assert!(out.as_str().contains(
            ", Your python code has finished running with return code 0.\n\n```\nOutput too large to send\n```"
        ));
    }

    #[test]
    fn signal_is_annotated_and_preferred() {
        let r = ExecutionResult {
            exit_signal: Some(9),
            exit_code: Some(1),
            stdout: String::new(),
            language: "c".to_string(),
        };
        let out = format_result(&r, "@a", &limits());
        assert!(out
            .as_str()
            .contains("finished running with return code 9 (SIGKILL)."));
    }

    #[test]
    fn unknown_status_is_left_plain() {
        let r = ExecutionResult {
            exit_code: Some(200),
            ..result("")
        };
        let out = format_result(&r, "@a", &limits());
        assert!(out.as_str().contains("return code 200."));
    }

    #[test]
    fn sandbox_timeout_wording() {
        let r = ExecutionResult {
            exit_code: Some(15),
            ..result("partial\n")
        };
        let out = format_sandbox_result(&r, "@a", &limits());
        assert_eq!(
            out.as_str(),
            "@a, Your code timed out or ran out of memory.\n\n```\n001 | partial\n```"
        );
    }

    #[test]
    fn sandbox_fatal_error_wording() {
        let r = ExecutionResult {
            exit_code: Some(255),
            ..result("Traceback...")
        };
        let out = format_sandbox_result(&r, "@a", &limits());
        assert!(out.as_str().contains("Your code has failed."));
        assert!(out.as_str().contains("A fatal error has occurred"));
    }

    #[test]
    fn repl_output_keeps_tail() {
        let text: String = (0..1000).map(|i| format!("{i}\n")).collect();
        let out = format_repl_output(&text, &limits());
        assert!(out.len() <= 2000);
        assert!(out.as_str().contains("999"));
        assert!(out.as_str().starts_with("```\n...\n"));
    }

    #[test]
    fn splits_on_lines() {
        let chunks = split_message("aaa\nbbb\nccc", 7);
        assert_eq!(chunks, vec!["aaa\nbbb", "ccc"]);
        let chunks = split_message("abcdefghij", 4);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn escapes_html() {
        let s = r#"<a href="x&y">"#;
        assert_eq!(escape_html(s), "&lt;a href=&quot;x&amp;y&quot;&gt;");
    }
}
