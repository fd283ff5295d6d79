//! Locating runnable code inside chat messages.

use crate::domain::CodeSubmission;

pub const FENCE: &str = "```";

/// Fence prefix + suffix; anything this short cannot hold code.
const MIN_FENCED_LEN: usize = 2 * FENCE.len();

/// Code starting with this marker is never executed.
pub const IGNORE_MARKER: &str = "i#";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeBlock {
    pub language: Option<String>,
    pub source: String,
}

impl CodeBlock {
    pub fn new(language: Option<&str>, source: impl Into<String>) -> Self {
        Self {
            language: language.filter(|l| !l.is_empty()).map(str::to_string),
            source: source.into(),
        }
    }

    pub fn is_ignored(&self) -> bool {
        self.source.trim_start().starts_with(IGNORE_MARKER)
    }

    /// A block without a tag becomes an empty language, which backends reject
    /// as unknown.
    pub fn into_submission(self) -> CodeSubmission {
        CodeSubmission::single(self.language.unwrap_or_default(), self.source)
    }
}

/// Lazy iterator over every fenced block in a message, in source order.
pub struct CodeBlocks<'a> {
    rest: &'a str,
}

impl<'a> Iterator for CodeBlocks<'a> {
    type Item = CodeBlock;

    fn next(&mut self) -> Option<CodeBlock> {
        loop {
            let start = self.rest.find(FENCE)?;
            let after_open = &self.rest[start + FENCE.len()..];
            let end_rel = after_open.find(FENCE)?;
            let region_len = end_rel + 2 * FENCE.len();
            let inner = &after_open[..end_rel];
            self.rest = &after_open[end_rel + FENCE.len()..];

            if region_len <= MIN_FENCED_LEN {
                continue;
            }
            let block = split_tagged(inner);
            if block.source.trim().is_empty() {
                continue;
            }
            return Some(block);
        }
    }
}

pub fn extract_code_blocks(text: &str) -> CodeBlocks<'_> {
    CodeBlocks { rest: text }
}

/// Parse a message that is, in its entirety, one fenced block.
///
/// Returns `None` when the text is too short or not closed by a fence.
pub fn parse_fenced(text: &str) -> Option<CodeBlock> {
    if text.len() <= MIN_FENCED_LEN || !text.starts_with(FENCE) || !text.ends_with(FENCE) {
        return None;
    }
    let inner = &text[FENCE.len()..text.len() - FENCE.len()];
    match inner.split_once('\n') {
        Some((tag, body)) => Some(CodeBlock::new(Some(tag.trim()), body.trim_end())),
        None => Some(CodeBlock::new(None, inner)),
    }
}

/// Unfenced text: a first line made only of a language tag selects the
/// language for the remainder.
pub fn split_language_line(text: &str) -> CodeBlock {
    if let Some((first, rest)) = text.split_once('\n') {
        let tag = first.trim();
        if is_language_tag(tag) && !rest.trim().is_empty() {
            return CodeBlock::new(Some(tag), rest);
        }
    }
    CodeBlock::new(None, text)
}

/// Fenced blocks minus those carrying the ignore marker.
pub fn runnable_blocks(text: &str) -> impl Iterator<Item = CodeBlock> + '_ {
    extract_code_blocks(text).filter(|b| !b.is_ignored())
}

fn split_tagged(inner: &str) -> CodeBlock {
    let tag_len = inner
        .char_indices()
        .find(|(_, c)| !is_tag_char(*c))
        .map(|(i, _)| i)
        .unwrap_or(inner.len());
    let (tag, body) = inner.split_at(tag_len);

    match body.chars().next() {
        Some(c) if c.is_whitespace() => {
            CodeBlock::new(Some(tag), body[c.len_utf8()..].trim_end())
        }
        // No separator after the tag: there was no tag, it is code.
        _ => CodeBlock::new(None, inner.trim()),
    }
}

fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '#' | '_' | '-')
}

fn is_language_tag(s: &str) -> bool {
    !s.is_empty() && s.len() <= 32 && s.chars().all(is_tag_char)
}
