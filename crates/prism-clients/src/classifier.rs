//! Binary sentiment classifier client
//!
//! Calls a hosted text-classification model (HF inference style) and
//! returns the raw per-label probabilities. Reducing the labels to a
//! good/bad verdict is the caller's job.

use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
}

/// One labeled probability from the classifier, e.g. `POSITIVE: 0.93`.
#[derive(Debug, Clone, Deserialize)]
pub struct LabelScore {
    pub label: String,
    pub score: f64,
}

/// Classification endpoints wrap the score list in an outer array per
/// input; accept both the nested and the flat shape.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClassifyResponse {
    Nested(Vec<Vec<LabelScore>>),
    Flat(Vec<LabelScore>),
}

#[derive(Clone)]
pub struct ClassifierClient {
    client: reqwest::Client,
    api_url: String,
}

impl ClassifierClient {
    pub fn new(api_url: impl Into<String>) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("Prism/0.1.0")
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.into(),
        })
    }

    /// Classify one text, returning every label score the model emits.
    pub async fn classify(
        &self,
        api_key: &str,
        model: &str,
        text: &str,
    ) -> Result<Vec<LabelScore>, ClassifierError> {
        debug!("Classifier request to {}/models/{}", self.api_url, model);

        let response = self
            .client
            .post(format!("{}/models/{}", self.api_url, model))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&serde_json::json!({ "inputs": text }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Classifier API error {}: {}", status, body);
            return Err(ClassifierError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let body: ClassifyResponse = response.json().await?;
        Ok(flatten_scores(body))
    }
}

fn flatten_scores(body: ClassifyResponse) -> Vec<LabelScore> {
    match body {
        ClassifyResponse::Nested(groups) => groups.into_iter().flatten().collect(),
        ClassifyResponse::Flat(scores) => scores,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_nested_response() {
        let body: ClassifyResponse = serde_json::from_str(
            r#"[[{"label": "POSITIVE", "score": 0.93}, {"label": "NEGATIVE", "score": 0.07}]]"#,
        )
        .unwrap();

        let scores = flatten_scores(body);
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].label, "POSITIVE");
        assert!((scores[0].score - 0.93).abs() < f64::EPSILON);
    }

    #[test]
    fn test_flatten_flat_response() {
        let body: ClassifyResponse = serde_json::from_str(
            r#"[{"label": "NEGATIVE", "score": 0.5}, {"label": "POSITIVE", "score": 0.5}]"#,
        )
        .unwrap();

        let scores = flatten_scores(body);
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].label, "NEGATIVE");
    }
}
