use std::collections::BTreeMap;

use schema::{AttemptStatus, DiagnosticResult, TelemetryEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryBatchRequest {
    pub attempt_id: String,
    pub events: Vec<TelemetryEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryBatchResponse {
    pub success: bool,
    pub appended: usize,
    pub answers_folded: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateAttemptRequest {
    pub exam_id: String,
    /// Defaults to the caller's active learner identity, then the account.
    #[serde(default)]
    pub owner_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateAttemptResponse {
    pub success: bool,
    pub attempt_id: String,
    pub exam_id: String,
    pub owner_id: String,
    pub status: AttemptStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExamStateResponse {
    pub success: bool,
    pub attempt_id: String,
    pub current_state: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalizeResponse {
    pub success: bool,
    pub already_completed: bool,
    pub result: DiagnosticResult,
}

/// Structured failure result; rate limits carry the server-dictated retry
/// delay instead of being hard errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            retry_after_ms: None,
        }
    }

    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self {
            success: false,
            error: "rate limit exceeded".to_string(),
            retry_after_ms: Some(retry_after_ms),
        }
    }
}
