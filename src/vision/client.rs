//! OpenRouter-backed implementation of the vision endpoint

use super::{VisionApi, VisionRequest, VisionResponse};
use crate::error::{classify_status, UpstreamError};
use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// OpenRouter chat completions URL
const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

const MAX_RESPONSE_TOKENS: u32 = 4096;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Vision client calling a multimodal model through OpenRouter
pub struct OpenRouterVision {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenRouterVision {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: MessageContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// Encode image bytes as a base64 data URL content part
fn image_part(bytes: &[u8]) -> ContentPart {
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    ContentPart::ImageUrl {
        image_url: ImageUrl {
            url: format!("data:image/jpeg;base64,{}", encoded),
        },
    }
}

#[async_trait]
impl VisionApi for OpenRouterVision {
    async fn complete(&self, request: &VisionRequest) -> Result<VisionResponse, UpstreamError> {
        let mut parts = vec![ContentPart::Text {
            text: request.user.clone(),
        }];
        parts.extend(request.images.iter().map(|bytes| image_part(bytes)));

        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: MessageContent::Text(request.system.clone()),
                },
                Message {
                    role: "user".to_string(),
                    content: MessageContent::Parts(parts),
                },
            ],
            max_tokens: MAX_RESPONSE_TOKENS,
            stream: false,
            response_format: request.json_mode.then(|| ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };

        let response = self
            .client
            .post(OPENROUTER_URL)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &truncate(&text, 200)));
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            UpstreamError::invalid_payload(format!("unexpected completion payload: {}", e))
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| UpstreamError::invalid_payload("completion had no choices"))?;

        Ok(VisionResponse { content })
    }
}

/// Truncate a string for error messages (Unicode-safe)
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_part_is_data_url() {
        let part = image_part(&[0xFF, 0xD8]);
        match part {
            ContentPart::ImageUrl { image_url } => {
                assert!(image_url.url.starts_with("data:image/jpeg;base64,"));
            }
            _ => panic!("expected image part"),
        }
    }

    #[test]
    fn test_request_serializes_mixed_content() {
        let body = ChatRequest {
            model: "test/model".to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: MessageContent::Parts(vec![
                    ContentPart::Text {
                        text: "what dish is this?".to_string(),
                    },
                    image_part(b"img"),
                ]),
            }],
            max_tokens: 16,
            stream: false,
            response_format: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"type\":\"text\""));
        assert!(json.contains("\"type\":\"image_url\""));
        assert!(!json.contains("response_format"));
    }
}
