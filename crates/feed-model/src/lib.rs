use thiserror::Error;

mod ids;
pub use ids::*;
mod counter;
pub use counter::*;
mod post;
pub use post::*;
mod social;
pub use social::*;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeedModelError {
    #[error("content must not be empty")]
    EmptyContent,
    #[error("content exceeds {max} characters ({len})")]
    ContentTooLong { len: usize, max: usize },
    #[error("identifier must not be empty: {0}")]
    EmptyId(&'static str),
}

/// Upper bound the backend accepts for post and comment bodies.
pub const MAX_CONTENT_CHARS: usize = 5_000;

/// Validate a post or comment body before it is sent anywhere.
pub fn validate_content(content: &str) -> Result<&str, FeedModelError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(FeedModelError::EmptyContent);
    }
    let len = trimmed.chars().count();
    if len > MAX_CONTENT_CHARS {
        return Err(FeedModelError::ContentTooLong {
            len,
            max: MAX_CONTENT_CHARS,
        });
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_is_trimmed() {
        assert_eq!(validate_content("  hello \n"), Ok("hello"));
    }

    #[test]
    fn blank_content_is_rejected() {
        assert_eq!(validate_content("   "), Err(FeedModelError::EmptyContent));
        assert_eq!(validate_content(""), Err(FeedModelError::EmptyContent));
    }

    #[test]
    fn oversized_content_is_rejected() {
        let body = "x".repeat(MAX_CONTENT_CHARS + 1);
        assert!(matches!(
            validate_content(&body),
            Err(FeedModelError::ContentTooLong { .. })
        ));
    }
}
