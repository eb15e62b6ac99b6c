//! Request ledger
//!
//! Durable mapping from request identifier to lifecycle record, backed
//! by the Redis key-value store. A record is visible in `pending` state
//! immediately after creation, transitions to exactly one terminal
//! state, and is never mutated afterwards. Records are never deleted
//! here; retention is an external concern.

use anyhow::{Context, Result};
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

const KEY_PREFIX: &str = "request:";

// ============================================================================
// Types
// ============================================================================

/// Lifecycle state of a request. `Complete` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Complete,
    Error,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Complete => "complete",
            RequestStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Complete | RequestStatus::Error)
    }
}

impl FromStr for RequestStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "complete" => Ok(RequestStatus::Complete),
            "error" => Ok(RequestStatus::Error),
            _ => Err(anyhow::anyhow!("Invalid request status: {}", s)),
        }
    }
}

/// What the request was asked to analyze.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordInput {
    pub resolved_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    pub threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_modifier: Option<i64>,
}

/// Raw classifier probabilities plus the thresholded verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentScores {
    pub negative: f64,
    pub positive: f64,
    pub good: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredSentence {
    pub sentence: String,
    pub sentiment: SentimentScores,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptBucket {
    pub prompt: String,
}

/// The good/bad partition of the narrative, each bucket a single
/// ". "-joined prompt string in original sentence order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptBuckets {
    pub good: PromptBucket,
    pub bad: PromptBucket,
}

/// Provenance for auditing which models and prompt produced a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    pub tokens_used: u32,
    pub model_used: String,
    pub prompt_used: String,
    pub classifier_model_used: String,
}

/// One request's full lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub status: RequestStatus,
    pub input: RecordInput,
    /// Milliseconds since epoch at submission.
    pub created_at: i64,
    /// Informational only.
    pub requestor_ip: String,
    /// Raw narrative returned by the vision model. Absent while pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sentences: Vec<ScoredSentence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<PromptBuckets>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RecordMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl RequestRecord {
    /// Fresh pending record, visible to pollers immediately.
    pub fn pending(input: RecordInput, requestor_ip: String) -> Self {
        Self {
            status: RequestStatus::Pending,
            input,
            created_at: Utc::now().timestamp_millis(),
            requestor_ip,
            response: None,
            sentences: Vec::new(),
            results: None,
            meta: None,
            error: None,
            error_kind: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Short random identifier naming one submission.
pub fn generate_request_id(length: usize) -> String {
    let mut id = String::new();
    while id.len() < length {
        id.push_str(&Uuid::new_v4().simple().to_string());
    }
    id.truncate(length);
    id
}

#[derive(Clone)]
pub struct RequestLedger {
    conn: MultiplexedConnection,
}

impl RequestLedger {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    fn key(request_id: &str) -> String {
        format!("{}{}", KEY_PREFIX, request_id)
    }

    /// Write the initial pending record. Returns immediately; callers
    /// may poll before the pipeline completes.
    pub async fn create(&self, request_id: &str, record: &RequestRecord) -> Result<()> {
        self.put(request_id, record).await
    }

    /// Single terminal write. No update-in-place happens after this.
    pub async fn finalize(&self, request_id: &str, record: &RequestRecord) -> Result<()> {
        self.put(request_id, record).await
    }

    /// Read a record by identifier. `None` means the identifier is
    /// unknown - or not yet visible, since the underlying store may
    /// serve eventually-consistent reads. Pollers retry rather than
    /// treat a miss as permanent absence.
    pub async fn read(&self, request_id: &str) -> Result<Option<RequestRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(Self::key(request_id))
            .await
            .context("Failed to read request record")?;

        match raw {
            Some(json) => {
                let record = serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt ledger record for {}", request_id))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, request_id: &str, record: &RequestRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("Failed to serialize request record")?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(Self::key(request_id), json)
            .await
            .context("Failed to write request record")?;
        Ok(())
    }
}
