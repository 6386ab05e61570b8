use serde::Serialize;

use pulse_infra::{BatchItemResult, IngestOutcome};

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct EventAccepted {
    pub status: &'static str,
    pub event_id: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub replayed: bool,
}

impl From<&IngestOutcome> for EventAccepted {
    fn from(outcome: &IngestOutcome) -> Self {
        Self {
            status: "accepted",
            event_id: outcome.event.id.to_string(),
            replayed: outcome.replayed,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchItemResponse {
    pub index: usize,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub replayed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&BatchItemResult> for BatchItemResponse {
    fn from(item: &BatchItemResult) -> Self {
        match &item.outcome {
            Ok(outcome) => Self {
                index: item.index,
                status: "accepted",
                event_id: Some(outcome.event.id.to_string()),
                replayed: outcome.replayed,
                error: None,
                message: None,
            },
            Err(err) => Self {
                index: item.index,
                status: "rejected",
                event_id: None,
                replayed: false,
                error: Some(err.code()),
                message: Some(err.to_string()),
            },
        }
    }
}

/// Batch report; every submitted item appears in `results`.
#[derive(Debug, Serialize)]
pub struct BatchAccepted {
    /// `accepted` (all items), `partial` or `rejected` (none).
    pub status: &'static str,
    pub accepted: usize,
    pub rejected: usize,
    pub results: Vec<BatchItemResponse>,
}

impl From<&[BatchItemResult]> for BatchAccepted {
    fn from(items: &[BatchItemResult]) -> Self {
        let results: Vec<BatchItemResponse> = items.iter().map(BatchItemResponse::from).collect();
        let accepted = items.iter().filter(|i| i.is_accepted()).count();
        let rejected = items.len() - accepted;
        let status = match (accepted, rejected) {
            (_, 0) => "accepted",
            (0, _) => "rejected",
            _ => "partial",
        };
        Self {
            status,
            accepted,
            rejected,
            results,
        }
    }
}
