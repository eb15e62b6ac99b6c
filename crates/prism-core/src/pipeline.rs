//! Vision-sentiment analysis pipeline
//!
//! Orchestrates one submission end to end: vision call with bounded
//! retry, narrative segmentation, concurrent sentence scoring, good/bad
//! aggregation, ledger finalization, and dispatch queue handoff. A
//! submission is finalized exactly once, as `complete` or `error` -
//! partial results are never published.

use futures::future::try_join_all;
use std::future::Future;
use tracing::{error, info, warn};

use prism_clients::VisionClient;

use crate::config::Settings;
use crate::error::AnalysisError;
use crate::ledger::{
    PromptBucket, PromptBuckets, RecordInput, RecordMeta, RequestLedger, RequestRecord,
    RequestStatus, ScoredSentence,
};
use crate::queue::DispatchQueue;
use crate::sentiment::SentimentScorer;

/// Total vision attempts before the request fails as unavailable.
pub const MAX_VISION_ATTEMPTS: u32 = 3;

const MAX_NARRATIVE_TOKENS: u32 = 1024;

/// One accepted submission, as handed to the pipeline after the
/// pending ledger record was written.
#[derive(Debug, Clone)]
pub struct Submission {
    pub request_id: String,
    pub resolved_url: String,
    pub original_url: Option<String>,
    pub threshold_modifier: Option<i64>,
    pub requestor_ip: String,
    /// Carried from the pending record so the terminal record keeps
    /// the submission time.
    pub created_at: i64,
}

impl Submission {
    fn record_input(&self, settings: &Settings) -> RecordInput {
        RecordInput {
            resolved_url: self.resolved_url.clone(),
            original_url: self.original_url.clone(),
            threshold: settings.threshold,
            threshold_modifier: self.threshold_modifier,
        }
    }
}

pub struct Pipeline {
    vision: VisionClient,
    scorer: SentimentScorer,
    ledger: RequestLedger,
    queue: DispatchQueue,
}

impl Pipeline {
    pub fn new(
        vision: VisionClient,
        scorer: SentimentScorer,
        ledger: RequestLedger,
        queue: DispatchQueue,
    ) -> Self {
        Self {
            vision,
            scorer,
            ledger,
            queue,
        }
    }

    /// Run the full analysis and finalize the ledger record, success or
    /// failure. On success the completed request is handed to the
    /// dispatch queue; a handoff failure never reverts the ledger.
    pub async fn analyze(
        &self,
        submission: Submission,
        api_key: &str,
        settings: &Settings,
    ) -> Result<RequestRecord, AnalysisError> {
        match self.run(&submission, api_key, settings).await {
            Ok(record) => {
                self.finalize(&submission.request_id, &record).await;
                info!(
                    "Request {} complete: {} sentences ({} good)",
                    submission.request_id,
                    record.sentences.len(),
                    record.sentences.iter().filter(|s| s.sentiment.good).count()
                );
                self.queue.enqueue(&submission.request_id).await;
                Ok(record)
            }
            Err(err) => {
                warn!(
                    "Request {} from {} failed: {}",
                    submission.request_id, submission.requestor_ip, err
                );
                let record = error_record(&submission, settings, &err);
                self.finalize(&submission.request_id, &record).await;
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        submission: &Submission,
        api_key: &str,
        settings: &Settings,
    ) -> Result<RequestRecord, AnalysisError> {
        let answer = retry(MAX_VISION_ATTEMPTS, || {
            self.vision.describe_image(
                api_key,
                &settings.vision_model,
                &submission.resolved_url,
                &settings.prompt,
                &settings.detail,
                MAX_NARRATIVE_TOKENS,
            )
        })
        .await
        .map_err(|e| AnalysisError::ModelUnavailable(e.to_string()))?;

        // A call that succeeded but said nothing carries no usable
        // signal for the sentiment stage.
        if answer.content.trim().is_empty() {
            return Err(AnalysisError::EmptyModelOutput);
        }

        let effective = effective_threshold(settings.threshold, submission.threshold_modifier);
        let fragments = segment_narrative(&answer.content);
        info!(
            "Request {}: narrative of {} chars split into {} sentences",
            submission.request_id,
            answer.content.len(),
            fragments.len()
        );

        // Fan out every sentence to the scorer; first error wins and
        // nothing partial is published.
        let sentences: Vec<ScoredSentence> = try_join_all(fragments.iter().map(|sentence| {
            let scorer = &self.scorer;
            let model = settings.classifier_model.as_str();
            async move {
                let sentiment = scorer.score(model, sentence, effective).await?;
                Ok::<_, AnalysisError>(ScoredSentence {
                    sentence: sentence.clone(),
                    sentiment,
                })
            }
        }))
        .await?;

        let results = bucket_prompts(&sentences);

        Ok(RequestRecord {
            status: RequestStatus::Complete,
            input: submission.record_input(settings),
            created_at: submission.created_at,
            requestor_ip: submission.requestor_ip.clone(),
            response: Some(answer.content),
            sentences,
            results: Some(results),
            meta: Some(RecordMeta {
                tokens_used: answer.total_tokens,
                model_used: answer.model,
                prompt_used: settings.prompt.clone(),
                classifier_model_used: settings.classifier_model.clone(),
            }),
            error: None,
            error_kind: None,
        })
    }

    async fn finalize(&self, request_id: &str, record: &RequestRecord) {
        if let Err(e) = self.ledger.finalize(request_id, record).await {
            error!("Failed to finalize ledger record {}: {}", request_id, e);
        }
    }
}

fn error_record(
    submission: &Submission,
    settings: &Settings,
    err: &AnalysisError,
) -> RequestRecord {
    RequestRecord {
        status: RequestStatus::Error,
        input: submission.record_input(settings),
        created_at: submission.created_at,
        requestor_ip: submission.requestor_ip.clone(),
        response: None,
        sentences: Vec::new(),
        results: None,
        meta: None,
        error: Some(err.to_string()),
        error_kind: Some(err.kind().to_string()),
    }
}

/// Run an operation up to `max_attempts` times, returning the first
/// success or the last error once attempts are exhausted. Attempts are
/// strictly sequential with no backoff.
pub async fn retry<T, E, F, Fut>(max_attempts: u32, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_attempts {
                    return Err(err);
                }
                warn!("Attempt {}/{} failed: {}", attempt, max_attempts, err);
                attempt += 1;
            }
        }
    }
}

/// Effective decision boundary: the optional per-request modifier is
/// divided by 10 and added to the base threshold.
pub fn effective_threshold(base: f64, modifier: Option<i64>) -> f64 {
    base + modifier.unwrap_or(0) as f64 / 10.0
}

/// Normalize a narrative and split it into sentence fragments.
///
/// Whitespace runs collapse to single spaces, characters outside
/// letters/digits/`.`/`,`/`-`/space are stripped, the text splits on
/// the literal ". ", and fragments are trimmed of trailing periods.
/// Lossy but deterministic - downstream prompt composition depends on
/// this exact rule, so no smarter sentence tokenizer belongs here.
pub fn segment_narrative(text: &str) -> Vec<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let cleaned: String = collapsed
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | ',' | '-' | ' '))
        .collect();

    cleaned
        .split(". ")
        .map(|fragment| fragment.trim().trim_end_matches('.').trim().to_string())
        .filter(|fragment| !fragment.is_empty())
        .collect()
}

/// Partition scored sentences into the good and bad prompt strings,
/// preserving original narrative order within each bucket.
pub fn bucket_prompts(sentences: &[ScoredSentence]) -> PromptBuckets {
    let mut good = Vec::new();
    let mut bad = Vec::new();

    for scored in sentences {
        if scored.sentiment.good {
            good.push(scored.sentence.as_str());
        } else {
            bad.push(scored.sentence.as_str());
        }
    }

    PromptBuckets {
        good: PromptBucket {
            prompt: good.join(". "),
        },
        bad: PromptBucket {
            prompt: bad.join(". "),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SentimentScores;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scored(sentence: &str, positive: f64, negative: f64, good: bool) -> ScoredSentence {
        ScoredSentence {
            sentence: sentence.to_string(),
            sentiment: SentimentScores {
                negative,
                positive,
                good,
            },
        }
    }

    #[test]
    fn test_segment_simple_narrative() {
        let fragments = segment_narrative("The cat is happy. The room is messy.");
        assert_eq!(fragments, vec!["The cat is happy", "The room is messy"]);
    }

    #[test]
    fn test_segment_collapses_whitespace() {
        let fragments = segment_narrative("A  bright\n\tmorning. Rain   later.");
        assert_eq!(fragments, vec!["A bright morning", "Rain later"]);
    }

    #[test]
    fn test_segment_strips_disallowed_characters() {
        let fragments = segment_narrative("Wow! A red ball. It's round? Yes.");
        // '!', '\'' and '?' are stripped before splitting
        assert_eq!(fragments, vec!["Wow A red ball", "Its round Yes"]);
    }

    #[test]
    fn test_segment_keeps_commas_and_dashes() {
        let fragments = segment_narrative("A calm, well-lit room. Nothing else.");
        assert_eq!(fragments, vec!["A calm, well-lit room", "Nothing else"]);
    }

    #[test]
    fn test_segment_drops_empty_fragments() {
        assert!(segment_narrative("").is_empty());
        assert!(segment_narrative("   ").is_empty());
        let fragments = segment_narrative("One. . Two.");
        assert_eq!(fragments, vec!["One", "Two"]);
    }

    #[test]
    fn test_effective_threshold() {
        assert!((effective_threshold(0.1, None) - 0.1).abs() < 1e-9);
        assert!((effective_threshold(0.1, Some(2)) - 0.3).abs() < 1e-9);
        assert!((effective_threshold(0.1, Some(-1)) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_bucket_prompts_partition() {
        let sentences = vec![
            scored("The cat is happy", 0.9, 0.05, true),
            scored("The room is messy", 0.3, 0.6, false),
            scored("Sunlight fills the window", 0.8, 0.1, true),
        ];

        let buckets = bucket_prompts(&sentences);
        assert_eq!(
            buckets.good.prompt,
            "The cat is happy. Sunlight fills the window"
        );
        assert_eq!(buckets.bad.prompt, "The room is messy");
    }

    #[test]
    fn test_bucket_prompts_accounts_for_every_sentence() {
        let sentences = vec![
            scored("a", 0.9, 0.0, true),
            scored("b", 0.0, 0.9, false),
            scored("c", 0.9, 0.0, true),
            scored("d", 0.0, 0.9, false),
        ];

        let buckets = bucket_prompts(&sentences);
        let good: Vec<&str> = buckets.good.prompt.split(". ").collect();
        let bad: Vec<&str> = buckets.bad.prompt.split(". ").collect();
        assert_eq!(good.len() + bad.len(), sentences.len());
        assert_eq!(good, vec!["a", "c"]);
        assert_eq!(bad, vec!["b", "d"]);
    }

    #[test]
    fn test_bucket_prompts_empty_bucket_is_empty_string() {
        let sentences = vec![scored("all good here", 0.9, 0.0, true)];
        let buckets = bucket_prompts(&sentences);
        assert_eq!(buckets.good.prompt, "all good here");
        assert_eq!(buckets.bad.prompt, "");
    }

    #[tokio::test]
    async fn test_retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry(3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_stops_after_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry(3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(n) }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry(3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(format!("failure {}", n)) }
        })
        .await;

        assert_eq!(result.unwrap_err(), "failure 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
