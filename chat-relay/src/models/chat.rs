use serde::{Deserialize, Serialize};
use validator::Validate;

/// Separator written after every streamed fragment.
pub const FRAGMENT_DELIMITER: &str = "\n\n";

/// Body accepted by every chat route.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct ChatRequest {
    #[validate(
        required(message = "Message is required"),
        length(min = 1, message = "Message is required")
    )]
    pub message: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }

    /// Validate and hand back the message.
    pub fn into_message(self) -> Result<String, validator::ValidationErrors> {
        self.validate()?;
        Ok(self.message.unwrap_or_default())
    }
}

/// Buffered answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
}

/// Frame one fragment for the wire.
pub fn frame_fragment(text: &str) -> String {
    let mut framed = String::with_capacity(text.len() + FRAGMENT_DELIMITER.len());
    framed.push_str(text);
    framed.push_str(FRAGMENT_DELIMITER);
    framed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_non_empty_message() {
        let request: ChatRequest =
            serde_json::from_str(r#"{"message":"What is the capital of France?"}"#).unwrap();
        assert_eq!(
            request.into_message().unwrap(),
            "What is the capital of France?"
        );
    }

    #[test]
    fn rejects_missing_message() {
        let request: ChatRequest = serde_json::from_str("{}").unwrap();
        let errors = request.into_message().unwrap_err();
        assert!(errors.field_errors().contains_key("message"));
    }

    #[test]
    fn rejects_empty_message() {
        assert!(ChatRequest::new("").into_message().is_err());
    }

    #[test]
    fn whitespace_is_a_message() {
        assert_eq!(ChatRequest::new("  ").into_message().unwrap(), "  ");
    }

    #[test]
    fn fragments_are_blank_line_terminated() {
        assert_eq!(frame_fragment("Pa"), "Pa\n\n");
        assert_eq!(frame_fragment(""), "\n\n");
    }
}
