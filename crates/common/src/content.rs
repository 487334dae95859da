// Chat message content rules shared by every send path.

use thiserror::Error;

/// Maximum number of characters accepted in a single chat line.
pub const MAX_MESSAGE_CHARS: usize = 4_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentError {
    #[error("message content is empty")]
    Empty,
    #[error("message content exceeds {max} characters (got {actual})")]
    TooLong { max: usize, actual: usize },
}

/// Validates raw message content and returns it unchanged when accepted.
///
/// Whitespace-only content counts as empty. Length is measured in chars, not bytes.
pub fn validate_content(raw: &str) -> Result<&str, ContentError> {
    if raw.trim().is_empty() {
        return Err(ContentError::Empty);
    }

    let actual = raw.chars().count();
    if actual > MAX_MESSAGE_CHARS {
        return Err(ContentError::TooLong { max: MAX_MESSAGE_CHARS, actual });
    }

    Ok(raw)
}
