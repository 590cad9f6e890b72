//! Vision endpoint seam and the two-stage analysis contract
//!
//! Every vision call goes out through the `VisionApi` trait so the engine
//! can be exercised against scripted fakes; the real client lives in
//! `client`. Prompts and response parsing are split out the same way the
//! calls themselves are.

pub mod client;
pub mod parse;
pub mod prompts;

use crate::error::UpstreamError;
use async_trait::async_trait;

/// A single multimodal request: structured prompt plus image attachments
#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub system: String,
    pub user: String,
    /// Raw image bytes, attached in order after the user text
    pub images: Vec<Vec<u8>>,
    /// Ask the endpoint for a JSON object response
    pub json_mode: bool,
}

impl VisionRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>, image: &[u8]) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            images: vec![image.to_vec()],
            json_mode: true,
        }
    }

    /// Rebuild this request with a corrective instruction appended to the
    /// user prompt, for the single schema-correction retry.
    pub fn with_corrective_suffix(&self, suffix: &str) -> Self {
        let mut corrected = self.clone();
        corrected.user = format!("{}\n\n{}", self.user, suffix);
        corrected
    }
}

/// Raw text payload returned by the vision endpoint
#[derive(Debug, Clone)]
pub struct VisionResponse {
    pub content: String,
}

/// Outbound multimodal endpoint. No availability or latency guarantee -
/// callers wrap every call in `RetryPolicy`.
#[async_trait]
pub trait VisionApi: Send + Sync {
    async fn complete(&self, request: &VisionRequest) -> Result<VisionResponse, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrective_suffix_appends_to_user_prompt() {
        let request = VisionRequest::new("system", "user", b"img");
        let corrected = request.with_corrective_suffix("Return ONLY JSON.");
        assert!(corrected.user.starts_with("user"));
        assert!(corrected.user.ends_with("Return ONLY JSON."));
        assert_eq!(corrected.system, request.system);
        assert_eq!(corrected.images.len(), 1);
    }
}
