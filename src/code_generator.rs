use std::sync::Arc;

use rearch::CapsuleHandle;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Number of characters in every [`ShortCode`].
pub const SHORT_CODE_LEN: usize = 6;

/// A fixed-length, ASCII alphanumeric identifier that stands in for a long URL.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShortCode(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShortCodeValidationError {
    #[error("short code must be exactly {SHORT_CODE_LEN} characters, got {actual}")]
    InvalidLength { actual: usize },
    #[error("short code contains invalid characters: {invalid_chars}")]
    InvalidCharacters { invalid_chars: String },
}

impl ShortCode {
    /// # Errors
    /// Will return [`Err`] if `code` is not exactly [`SHORT_CODE_LEN`]
    /// ASCII alphanumeric characters.
    pub fn new(code: String) -> Result<Self, ShortCodeValidationError> {
        let invalid_chars = code
            .chars()
            .filter(|c| !c.is_ascii_alphanumeric())
            .collect::<String>();
        if !invalid_chars.is_empty() {
            return Err(ShortCodeValidationError::InvalidCharacters { invalid_chars });
        }

        // NOTE: all chars are ASCII at this point, so bytes == chars
        if code.len() != SHORT_CODE_LEN {
            return Err(ShortCodeValidationError::InvalidLength { actual: code.len() });
        }

        Ok(Self(code))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for ShortCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn code_generator_capsule(_: CapsuleHandle) -> Arc<dyn CodeGenerator> {
    Arc::new(Sha256CodeGenerator)
}

/// Derives candidate short codes from input strings.
///
/// Implementations must be deterministic: the same `(input, attempt)` pair
/// always yields the same [`ShortCode`].
#[cfg_attr(test, mockall::automock)]
pub trait CodeGenerator: Send + Sync {
    fn generate(&self, input: &str, attempt: u32) -> ShortCode;
}

/// Takes the leading hex digits of `SHA-256(input || attempt)`,
/// where the attempt salt is omitted entirely for attempt `0`.
pub struct Sha256CodeGenerator;

impl CodeGenerator for Sha256CodeGenerator {
    fn generate(&self, input: &str, attempt: u32) -> ShortCode {
        let mut hasher = Sha256::new();
        hasher.update(input.as_bytes());
        if attempt > 0 {
            hasher.update(attempt.to_string().as_bytes());
        }

        let mut code = hex::encode(hasher.finalize());
        code.truncate(SHORT_CODE_LEN);
        ShortCode(code)
    }
}
