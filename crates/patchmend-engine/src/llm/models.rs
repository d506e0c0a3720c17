use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub(crate) struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stream: bool,
}

/// Token usage as reported by the provider.
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: Option<u32>,
    #[serde(default)]
    pub completion_tokens: Option<u32>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct Choice {
    pub message: MessageContent,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct MessageContent {
    /// Null when the provider refused or failed upstream.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub refusal: Option<String>,
}

/// Error body, sometimes delivered with a 200 status.
#[derive(Deserialize, Debug)]
pub(crate) struct ApiErrorBody {
    pub error: ApiError,
}

#[derive(Deserialize, Debug)]
pub(crate) struct ApiError {
    pub message: String,
    #[serde(default)]
    pub code: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_flat() {
        let request = ChatRequest {
            model: "m".to_string(),
            messages: vec![Message::system("s"), Message::user("u")],
            max_tokens: 4096,
            temperature: 0.0,
            stream: false,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["max_tokens"], 4096);
        assert_eq!(value["messages"][1]["role"], "user");
        assert_eq!(value["stream"], false);
    }

    #[test]
    fn test_response_with_null_content_and_usage() {
        let json = r#"{"choices":[{"message":{"content":null},"finish_reason":"length"}],
                       "usage":{"prompt_tokens":100,"completion_tokens":50}}"#;
        let response: ChatResponse = serde_json::from_str(json).unwrap();
        assert!(response.choices[0].message.content.is_none());
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("length"));
        assert_eq!(response.usage.unwrap().completion_tokens, Some(50));
    }

    #[test]
    fn test_error_body_code_is_optional() {
        let body: ApiErrorBody =
            serde_json::from_str(r#"{"error":{"message":"overloaded"}}"#).unwrap();
        assert_eq!(body.error.message, "overloaded");
        assert!(body.error.code.is_none());
    }
}
