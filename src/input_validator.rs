use crate::config::PredictionConfig;
use crate::errors::{LoopError, LoopResult};

/// Input validator for text submitted to the prediction surface
pub struct InputValidator {
    min_length: usize,
    max_length: usize,
    min_words: usize,
}

impl InputValidator {
    pub fn new(config: &PredictionConfig) -> Self {
        Self {
            min_length: config.min_input_length,
            max_length: config.max_input_length,
            min_words: config.min_words,
        }
    }

    /// Validate and return the trimmed text
    pub fn validate_text<'a>(&self, text: &'a str) -> LoopResult<&'a str> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(LoopError::validation("text", "input text is empty"));
        }

        let chars = trimmed.chars().count();
        if chars < self.min_length {
            return Err(LoopError::validation(
                "text",
                format!("input must be at least {} characters (got {chars})", self.min_length),
            ));
        }
        if chars > self.max_length {
            return Err(LoopError::validation(
                "text",
                format!("input must be at most {} characters (got {chars})", self.max_length),
            ));
        }

        let words = trimmed.split_whitespace().count();
        if words < self.min_words {
            return Err(LoopError::validation(
                "text",
                format!("input must contain at least {} words (got {words})", self.min_words),
            ));
        }

        Ok(trimmed)
    }

    /// Reject control characters other than ordinary whitespace
    pub fn contains_control_chars(&self, text: &str) -> bool {
        text.chars()
            .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
    }
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::new(&PredictionConfig::default())
    }
}
