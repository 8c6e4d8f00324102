//! Positioned diagnostics for expression source text.

/// Longest source excerpt quoted in a diagnostic.
const EXCERPT_CHARS: usize = 16;

/// A syntax or name error at a byte offset of the expression source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (byte {offset})")]
pub struct ExprError {
    pub offset: usize,
    pub message: String,
}

impl ExprError {
    pub(crate) fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }

    /// One-line diagnostic that quotes the source at the error position, or the end of the
    /// source when the error is past its last token.
    pub(crate) fn describe(&self, source: &str) -> String {
        if let Some(rest) = source.get(self.offset..)
            && !rest.trim().is_empty()
        {
            let excerpt: String = rest.chars().take(EXCERPT_CHARS).collect();
            let ellipsis = if rest.chars().nth(EXCERPT_CHARS).is_some() { "..." } else { "" };
            return format!("{} near '{excerpt}{ellipsis}'", self.message);
        }
        let source = source.trim_end();
        if source.is_empty() {
            return format!("{} in an empty expression", self.message);
        }
        let skip = source.chars().count().saturating_sub(EXCERPT_CHARS);
        let tail: String = source.chars().skip(skip).collect();
        let ellipsis = if skip > 0 { "..." } else { "" };
        format!("{} after '{ellipsis}{tail}'", self.message)
    }
}
