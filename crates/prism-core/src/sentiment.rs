//! Sentiment scorer
//!
//! Wraps the remote binary classifier and reduces its label scores to a
//! boolean good signal against a decision threshold. The reduction is a
//! pure function so the decision rule is testable without the network.

use prism_clients::{ClassifierClient, LabelScore};

use crate::error::AnalysisError;
use crate::ledger::SentimentScores;

const NEGATIVE_LABEL: &str = "NEGATIVE";
const POSITIVE_LABEL: &str = "POSITIVE";

#[derive(Clone)]
pub struct SentimentScorer {
    client: ClassifierClient,
    api_key: String,
}

impl SentimentScorer {
    pub fn new(client: ClassifierClient, api_key: String) -> Self {
        Self { client, api_key }
    }

    /// Score one sentence. `good` is `positive - negative > threshold`.
    pub async fn score(
        &self,
        model: &str,
        text: &str,
        threshold: f64,
    ) -> Result<SentimentScores, AnalysisError> {
        let scores = self
            .client
            .classify(&self.api_key, model, text)
            .await
            .map_err(|e| AnalysisError::ScoringFailed(e.to_string()))?;

        reduce_scores(&scores, threshold)
    }
}

/// Reduce a label list to the two expected probabilities and the
/// thresholded verdict. Either expected label missing is a failure.
pub fn reduce_scores(
    scores: &[LabelScore],
    threshold: f64,
) -> Result<SentimentScores, AnalysisError> {
    let mut negative = None;
    let mut positive = None;

    for score in scores {
        match score.label.as_str() {
            NEGATIVE_LABEL => negative = Some(score.score),
            POSITIVE_LABEL => positive = Some(score.score),
            _ => {}
        }
    }

    let negative = negative.ok_or_else(|| {
        AnalysisError::ScoringFailed(format!("classifier returned no {} label", NEGATIVE_LABEL))
    })?;
    let positive = positive.ok_or_else(|| {
        AnalysisError::ScoringFailed(format!("classifier returned no {} label", POSITIVE_LABEL))
    })?;

    Ok(SentimentScores {
        negative,
        positive,
        good: positive - negative > threshold,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(label: &str, score: f64) -> LabelScore {
        LabelScore {
            label: label.to_string(),
            score,
        }
    }

    #[test]
    fn test_good_sentence() {
        let scores = [label("POSITIVE", 0.9), label("NEGATIVE", 0.05)];
        let verdict = reduce_scores(&scores, 0.1).unwrap();
        assert!(verdict.good);
        assert!((verdict.positive - 0.9).abs() < f64::EPSILON);
        assert!((verdict.negative - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bad_sentence() {
        let scores = [label("POSITIVE", 0.3), label("NEGATIVE", 0.6)];
        assert!(!reduce_scores(&scores, 0.1).unwrap().good);
    }

    #[test]
    fn test_difference_equal_to_threshold_is_not_good() {
        // Strictly greater than, not greater-or-equal
        let scores = [label("POSITIVE", 0.6), label("NEGATIVE", 0.5)];
        assert!(!reduce_scores(&scores, 0.1).unwrap().good);
    }

    #[test]
    fn test_label_order_does_not_matter() {
        let scores = [label("NEGATIVE", 0.05), label("POSITIVE", 0.9)];
        assert!(reduce_scores(&scores, 0.1).unwrap().good);
    }

    #[test]
    fn test_extra_labels_are_ignored() {
        let scores = [
            label("NEUTRAL", 0.99),
            label("POSITIVE", 0.9),
            label("NEGATIVE", 0.05),
        ];
        assert!(reduce_scores(&scores, 0.1).unwrap().good);
    }

    #[test]
    fn test_missing_label_fails() {
        let scores = [label("POSITIVE", 0.9)];
        assert!(matches!(
            reduce_scores(&scores, 0.1),
            Err(AnalysisError::ScoringFailed(_))
        ));

        let scores = [label("NEGATIVE", 0.9)];
        assert!(reduce_scores(&scores, 0.1).is_err());

        assert!(reduce_scores(&[], 0.1).is_err());
    }
}
