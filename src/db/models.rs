use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The purchased service level. Selects which rewrite variant is generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "tier", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    PendingPayment,
    Basic,
    Pro,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Submission {
    pub id: i32,
    pub submission_id: String,
    pub file_name: Option<String>,
    pub visitor_id: String,
    /// Extracted resume text. Destroyed by the delivery workflow.
    pub raw_text: Option<String>,
    pub paid: bool,
    pub tier: Tier,
    pub score: Option<i16>,
    /// Serialized critique artifact (JSON).
    pub critique: Option<String>,
    pub rewrite: Option<String>,
    /// Sticky: set when generation failed irrecoverably, never cleared.
    pub processing_error: Option<String>,
    pub payment_reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Submission {
    pub fn is_delivered(&self) -> bool {
        self.paid && self.critique.is_some() && self.rewrite.is_some()
    }
}

/// Public projection returned to the polling client.
#[derive(Debug, Serialize)]
pub struct SubmissionView {
    pub id: String,
    pub score: Option<i16>,
    pub critique: Option<serde_json::Value>,
    pub rewrite: Option<String>,
    pub paid: bool,
    pub tier: Tier,
    pub processing_error: Option<String>,
}

impl From<Submission> for SubmissionView {
    fn from(s: Submission) -> Self {
        // The critique column holds the JSON the model produced; hand it to
        // the client parsed rather than double-encoded.
        let critique = s
            .critique
            .as_deref()
            .and_then(|c| serde_json::from_str(c).ok());

        SubmissionView {
            id: s.submission_id,
            score: s.score,
            critique,
            rewrite: s.rewrite,
            paid: s.paid,
            tier: s.tier,
            processing_error: s.processing_error,
        }
    }
}
