//! Vision model client
//!
//! Turns an image URL into a narrative description by calling a
//! vision-capable LLM via the OpenAI-compatible chat completions API.
//! The image is passed by URL (never inlined), together with the
//! configured instructional prompt and a detail level controlling the
//! fidelity the model is asked for.

use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("API response contained no choices")]
    Malformed,
}

/// Answer from the vision model.
///
/// `content` may be empty - an empty narrative is a valid API response
/// and is the caller's failure to classify, not the client's.
#[derive(Debug, Clone)]
pub struct VisionAnswer {
    pub content: String,
    pub model: String,
    pub total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Clone)]
pub struct VisionClient {
    client: reqwest::Client,
    api_url: String,
}

impl VisionClient {
    pub fn new(api_url: impl Into<String>) -> Result<Self, VisionError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("Prism/0.1.0")
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.into(),
        })
    }

    /// Describe the image at `image_url` with the given prompt and detail level.
    ///
    /// The API key is request-scoped: callers pass whichever credential
    /// the current submission resolved to.
    pub async fn describe_image(
        &self,
        api_key: &str,
        model: &str,
        image_url: &str,
        prompt: &str,
        detail: &str,
        max_tokens: u32,
    ) -> Result<VisionAnswer, VisionError> {
        let request_body = serde_json::json!({
            "model": model,
            "messages": [
                {
                    "role": "user",
                    "content": [
                        {
                            "type": "image_url",
                            "image_url": { "url": image_url, "detail": detail }
                        },
                        { "type": "text", "text": prompt }
                    ]
                }
            ],
            "max_tokens": max_tokens,
        });

        debug!("Vision API request to {}/chat/completions", self.api_url);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Vision API error {}: {}", status, body);
            return Err(VisionError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let body: ChatResponse = response.json().await?;
        let answer = extract_answer(body, model)?;

        info!(
            "Image described by {} ({} chars, {} tokens)",
            answer.model,
            answer.content.len(),
            answer.total_tokens
        );

        Ok(answer)
    }
}

/// Reduce the chat completion body to the narrative and its provenance.
fn extract_answer(body: ChatResponse, requested_model: &str) -> Result<VisionAnswer, VisionError> {
    let choice = body.choices.into_iter().next().ok_or(VisionError::Malformed)?;

    Ok(VisionAnswer {
        content: choice.message.content.unwrap_or_default(),
        model: body.model.unwrap_or_else(|| requested_model.to_string()),
        total_tokens: body.usage.map(|u| u.total_tokens).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_answer() {
        let body: ChatResponse = serde_json::from_str(
            r#"{
                "model": "gpt-4o",
                "choices": [{ "message": { "content": "A sunny field." } }],
                "usage": { "prompt_tokens": 20, "completion_tokens": 5, "total_tokens": 25 }
            }"#,
        )
        .unwrap();

        let answer = extract_answer(body, "fallback").unwrap();
        assert_eq!(answer.content, "A sunny field.");
        assert_eq!(answer.model, "gpt-4o");
        assert_eq!(answer.total_tokens, 25);
    }

    #[test]
    fn test_extract_answer_missing_fields() {
        let body: ChatResponse =
            serde_json::from_str(r#"{ "choices": [{ "message": {} }] }"#).unwrap();

        let answer = extract_answer(body, "gpt-4o-mini").unwrap();
        assert_eq!(answer.content, "");
        assert_eq!(answer.model, "gpt-4o-mini");
        assert_eq!(answer.total_tokens, 0);
    }

    #[test]
    fn test_extract_answer_no_choices() {
        let body: ChatResponse = serde_json::from_str(r#"{ "choices": [] }"#).unwrap();
        assert!(matches!(
            extract_answer(body, "gpt-4o"),
            Err(VisionError::Malformed)
        ));
    }
}
