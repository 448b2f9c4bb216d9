//! Completion service interface.
//!
//! A completion service turns a prompt into generated text. Implementations
//! classify their failures with [`CompletionError`] so a Worker can tell a
//! chunk worth redelivering from one that will never succeed.

use crate::CompletionError;
use async_trait::async_trait;

/// A single prompt submitted to a [`CompletionService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Upper bound on the length of the generated text, in tokens.
    pub max_output_tokens: u32,
}

/// Request/response text completion API.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError>;
}

/// Fills the `{chunk}` placeholder of a prompt template.
///
/// A template without the placeholder gets the chunk appended after a blank
/// line, so an instruction-only template still sees the text.
pub fn render_prompt(template: &str, chunk: &str) -> String {
    if template.contains(PROMPT_PLACEHOLDER) {
        template.replace(PROMPT_PLACEHOLDER, chunk)
    } else if template.is_empty() {
        chunk.to_string()
    } else {
        format!("{template}\n\n{chunk}")
    }
}

pub const PROMPT_PLACEHOLDER: &str = "{chunk}";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_placeholder() {
        assert_eq!(
            render_prompt("Summarize: {chunk}", "some text"),
            "Summarize: some text"
        );
    }

    #[test]
    fn appends_when_placeholder_missing() {
        assert_eq!(render_prompt("Summarize.", "abc"), "Summarize.\n\nabc");
        assert_eq!(render_prompt("", "abc"), "abc");
    }

    #[test]
    fn classifies_retryable_errors() {
        assert!(CompletionError::RateLimited.is_retryable());
        assert!(CompletionError::Timeout.is_retryable());
        assert!(CompletionError::Unavailable("503".into()).is_retryable());
        assert!(!CompletionError::InvalidInput("bad".into()).is_retryable());
        assert!(!CompletionError::Permanent("401".into()).is_retryable());
    }
}
