//! Payment-confirmation / delivery workflow.
//!
//! One idempotent state machine with three callers: the payment webhook, the
//! client confirm call, and free-tier uploads. A run marks the submission
//! paid, generates whichever artifacts are still missing, and destroys the
//! raw resume text no matter how the run ended.

use thiserror::Error;
use tracing::{error, info, warn};

use crate::db::{Submission, SubmissionStore, Tier};
use crate::llm::Generator;

/// Shown to the poller when a generation pass failed for good. Payment is
/// non-refundable per policy but support-resolvable.
const PROCESSING_ERROR_MESSAGE: &str =
    "AI generation failed. Your payment was received - contact support to resolve.";

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("submission not found")]
    NotFound,

    #[error("submission has no source text to generate from")]
    NoInput,

    #[error("generation failed")]
    GenerationFailed,

    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

#[derive(Debug, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub already_processed: bool,
}

/// Transitions a submission from paid-pending to fully delivered.
///
/// Tolerates partial failure of either generation pass: a failed pass sets a
/// sticky `processing_error` instead of aborting the other pass, and a later
/// trigger (webhook retry, manual confirm) picks up whatever is still
/// missing. Raw text is cleared unconditionally before returning.
pub async fn confirm_and_deliver<S, G>(
    store: &S,
    llm: &G,
    submission_id: &str,
    requested_tier: Option<Tier>,
    payment_reference: Option<&str>,
) -> Result<DeliveryOutcome, WorkflowError>
where
    S: SubmissionStore + ?Sized,
    G: Generator + ?Sized,
{
    let submission = store
        .fetch(submission_id)
        .await?
        .ok_or(WorkflowError::NotFound)?;

    // A webhook retry racing a client-confirmed call lands here.
    if submission.is_delivered() {
        info!("submission {submission_id} already delivered");
        return Ok(DeliveryOutcome {
            already_processed: true,
        });
    }

    let raw_text = submission.raw_text.clone().ok_or(WorkflowError::NoInput)?;
    let tier = effective_tier(requested_tier, submission.tier);

    let result = deliver(store, llm, &submission, &raw_text, tier, payment_reference).await;

    // Raw text must not outlive the run, however the body ended.
    if let Err(e) = store.clear_raw_text(submission_id).await {
        error!("failed to clear raw text for {submission_id}: {e}");
    }

    match result {
        Ok(passes) if !passes.critique_failed && !passes.rewrite_failed => Ok(DeliveryOutcome {
            already_processed: false,
        }),
        Ok(_) => {
            if let Err(e) = store
                .record_processing_error(submission_id, PROCESSING_ERROR_MESSAGE)
                .await
            {
                error!("failed to record processing error for {submission_id}: {e}");
            }
            Err(WorkflowError::GenerationFailed)
        }
        Err(e) => {
            // Store failure mid-run: best-effort sticky error, then surface.
            if let Err(write_err) = store
                .record_processing_error(submission_id, PROCESSING_ERROR_MESSAGE)
                .await
            {
                error!("failed to record processing error for {submission_id}: {write_err}");
            }
            Err(WorkflowError::Store(e))
        }
    }
}

struct PassOutcomes {
    critique_failed: bool,
    rewrite_failed: bool,
}

async fn deliver<S, G>(
    store: &S,
    llm: &G,
    submission: &Submission,
    raw_text: &str,
    tier: Tier,
    payment_reference: Option<&str>,
) -> Result<PassOutcomes, sqlx::Error>
where
    S: SubmissionStore + ?Sized,
    G: Generator + ?Sized,
{
    let id = submission.submission_id.as_str();

    store.mark_paid(id, tier, payment_reference).await?;

    let mut critique_failed = false;
    if submission.critique.is_none() {
        match llm.critique(raw_text).await {
            Ok(report) => match serde_json::to_string(&report) {
                Ok(json) => {
                    if !store.store_critique_if_absent(id, report.score, &json).await? {
                        info!("critique for {id} already stored, keeping existing");
                    }
                }
                Err(e) => {
                    warn!("failed to serialize critique for {id}: {e}");
                    critique_failed = true;
                }
            },
            Err(e) => {
                warn!("critique generation failed for {id}: {e}");
                critique_failed = true;
            }
        }
    }

    let mut rewrite_failed = false;
    if submission.rewrite.is_none() {
        match llm.rewrite(raw_text, tier).await {
            Ok(text) => {
                if !store.store_rewrite_if_absent(id, &text).await? {
                    info!("rewrite for {id} already stored, keeping existing");
                }
            }
            Err(e) => {
                warn!("rewrite generation failed for {id}: {e}");
                rewrite_failed = true;
            }
        }
    }

    Ok(PassOutcomes {
        critique_failed,
        rewrite_failed,
    })
}

/// The caller's tier wins; otherwise the tier already on the record, with
/// pending-payment records defaulting to basic.
fn effective_tier(requested: Option<Tier>, stored: Tier) -> Tier {
    requested.unwrap_or(match stored {
        Tier::PendingPayment => Tier::Basic,
        t => t,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CritiqueReport, GenerationError};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemStore {
        rows: Mutex<HashMap<String, Submission>>,
    }

    impl MemStore {
        fn with(submission: Submission) -> Self {
            let store = Self::default();
            store
                .rows
                .lock()
                .unwrap()
                .insert(submission.submission_id.clone(), submission);
            store
        }

        fn get(&self, id: &str) -> Submission {
            self.rows.lock().unwrap().get(id).unwrap().clone()
        }
    }

    #[async_trait]
    impl SubmissionStore for MemStore {
        async fn fetch(&self, submission_id: &str) -> Result<Option<Submission>, sqlx::Error> {
            Ok(self.rows.lock().unwrap().get(submission_id).cloned())
        }

        async fn mark_paid(
            &self,
            submission_id: &str,
            tier: Tier,
            payment_reference: Option<&str>,
        ) -> Result<(), sqlx::Error> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.get_mut(submission_id).unwrap();
            row.paid = true;
            row.tier = tier;
            if row.payment_reference.is_none() {
                row.payment_reference = payment_reference.map(str::to_string);
            }
            Ok(())
        }

        async fn store_critique_if_absent(
            &self,
            submission_id: &str,
            score: i16,
            critique: &str,
        ) -> Result<bool, sqlx::Error> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.get_mut(submission_id).unwrap();
            if row.critique.is_some() {
                return Ok(false);
            }
            row.score = Some(score);
            row.critique = Some(critique.to_string());
            Ok(true)
        }

        async fn store_rewrite_if_absent(
            &self,
            submission_id: &str,
            rewrite: &str,
        ) -> Result<bool, sqlx::Error> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.get_mut(submission_id).unwrap();
            if row.rewrite.is_some() {
                return Ok(false);
            }
            row.rewrite = Some(rewrite.to_string());
            Ok(true)
        }

        async fn clear_raw_text(&self, submission_id: &str) -> Result<(), sqlx::Error> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.get_mut(submission_id) {
                row.raw_text = None;
            }
            Ok(())
        }

        async fn record_processing_error(
            &self,
            submission_id: &str,
            message: &str,
        ) -> Result<(), sqlx::Error> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.get_mut(submission_id) {
                row.processing_error = Some(message.to_string());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubLlm {
        critique_calls: AtomicUsize,
        rewrite_calls: AtomicUsize,
        fail_critique: bool,
        fail_rewrite: bool,
        last_rewrite_tier: Mutex<Option<Tier>>,
    }

    #[async_trait]
    impl Generator for StubLlm {
        async fn critique(&self, _resume_text: &str) -> Result<CritiqueReport, GenerationError> {
            self.critique_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_critique {
                return Err(GenerationError::Upstream {
                    status: 500,
                    message: "boom".to_string(),
                });
            }
            Ok(CritiqueReport {
                score: 4,
                lines: vec!["weak verbs everywhere".to_string()],
                issues: vec!["no metrics".to_string()],
                summary: "needs work".to_string(),
            })
        }

        async fn rewrite(&self, _resume_text: &str, tier: Tier) -> Result<String, GenerationError> {
            self.rewrite_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_rewrite_tier.lock().unwrap() = Some(tier);
            if self.fail_rewrite {
                return Err(GenerationError::Upstream {
                    status: 500,
                    message: "boom".to_string(),
                });
            }
            Ok("REWRITTEN RESUME".to_string())
        }
    }

    fn submission(id: &str, tier: Tier) -> Submission {
        Submission {
            id: 1,
            submission_id: id.to_string(),
            file_name: Some("resume.pdf".to_string()),
            visitor_id: "anonymous".to_string(),
            raw_text: Some("Experienced engineer who did various tasks at several companies.".to_string()),
            paid: false,
            tier,
            score: None,
            critique: None,
            rewrite: None,
            processing_error: None,
            payment_reference: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivers_critique_and_rewrite() {
        let store = MemStore::with(submission("s1", Tier::PendingPayment));
        let llm = StubLlm::default();

        let outcome =
            confirm_and_deliver(&store, &llm, "s1", Some(Tier::Basic), Some("txn_1"))
                .await
                .unwrap();

        assert!(!outcome.already_processed);
        let row = store.get("s1");
        assert!(row.paid);
        assert_eq!(row.tier, Tier::Basic);
        assert_eq!(row.score, Some(4));
        assert!(row.critique.is_some());
        assert_eq!(row.rewrite.as_deref(), Some("REWRITTEN RESUME"));
        assert_eq!(row.payment_reference.as_deref(), Some("txn_1"));
        assert_eq!(row.raw_text, None);
        assert_eq!(row.processing_error, None);
        assert_eq!(llm.critique_calls.load(Ordering::SeqCst), 1);
        assert_eq!(llm.rewrite_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_trigger_is_a_noop() {
        let store = MemStore::with(submission("s2", Tier::PendingPayment));
        let llm = StubLlm::default();

        confirm_and_deliver(&store, &llm, "s2", Some(Tier::Basic), None)
            .await
            .unwrap();
        let after_first = store.get("s2");

        let outcome = confirm_and_deliver(&store, &llm, "s2", Some(Tier::Basic), None)
            .await
            .unwrap();

        assert!(outcome.already_processed);
        assert_eq!(llm.critique_calls.load(Ordering::SeqCst), 1);
        assert_eq!(llm.rewrite_calls.load(Ordering::SeqCst), 1);
        let after_second = store.get("s2");
        assert_eq!(after_second.critique, after_first.critique);
        assert_eq!(after_second.rewrite, after_first.rewrite);
        assert_eq!(after_second.tier, after_first.tier);
    }

    #[tokio::test]
    async fn existing_critique_is_not_regenerated() {
        let mut sub = submission("s3", Tier::Basic);
        sub.paid = true;
        sub.score = Some(7);
        sub.critique = Some(r#"{"score":7,"lines":[],"issues":[],"summary":"ok"}"#.to_string());
        let store = MemStore::with(sub);
        let llm = StubLlm::default();

        confirm_and_deliver(&store, &llm, "s3", None, None)
            .await
            .unwrap();

        assert_eq!(llm.critique_calls.load(Ordering::SeqCst), 0);
        assert_eq!(llm.rewrite_calls.load(Ordering::SeqCst), 1);
        let row = store.get("s3");
        assert_eq!(row.score, Some(7));
        assert!(row.critique.as_deref().unwrap().contains("\"score\":7"));
    }

    #[tokio::test]
    async fn generation_failure_sets_sticky_error_and_clears_text() {
        let store = MemStore::with(submission("s4", Tier::PendingPayment));
        let llm = StubLlm {
            fail_critique: true,
            fail_rewrite: true,
            ..StubLlm::default()
        };

        let err = confirm_and_deliver(&store, &llm, "s4", Some(Tier::Basic), None)
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::GenerationFailed));
        let row = store.get("s4");
        assert!(row.paid);
        assert_eq!(row.raw_text, None);
        assert!(row.processing_error.is_some());
        assert_eq!(row.critique, None);
        assert_eq!(row.rewrite, None);
    }

    #[tokio::test]
    async fn partial_failure_keeps_the_successful_artifact() {
        let store = MemStore::with(submission("s5", Tier::PendingPayment));
        let llm = StubLlm {
            fail_critique: true,
            ..StubLlm::default()
        };

        let err = confirm_and_deliver(&store, &llm, "s5", Some(Tier::Basic), None)
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::GenerationFailed));
        let row = store.get("s5");
        assert_eq!(row.critique, None);
        assert_eq!(row.rewrite.as_deref(), Some("REWRITTEN RESUME"));
        assert!(row.processing_error.is_some());
        assert_eq!(row.raw_text, None);
        // The rewrite survived, so a later trigger only re-attempts the critique.
        assert_eq!(llm.rewrite_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_submission_is_not_found() {
        let store = MemStore::default();
        let llm = StubLlm::default();

        let err = confirm_and_deliver(&store, &llm, "nope", None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::NotFound));
        assert_eq!(llm.critique_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cleaned_up_submission_reports_no_input() {
        let mut sub = submission("s6", Tier::PendingPayment);
        sub.raw_text = None;
        let store = MemStore::with(sub);
        let llm = StubLlm::default();

        let err = confirm_and_deliver(&store, &llm, "s6", None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::NoInput));
        assert_eq!(llm.critique_calls.load(Ordering::SeqCst), 0);
        assert_eq!(llm.rewrite_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pro_tier_selects_the_pro_rewrite() {
        let store = MemStore::with(submission("s7", Tier::PendingPayment));
        let llm = StubLlm::default();

        confirm_and_deliver(&store, &llm, "s7", Some(Tier::Pro), Some("txn_7"))
            .await
            .unwrap();

        assert_eq!(store.get("s7").tier, Tier::Pro);
        assert_eq!(*llm.last_rewrite_tier.lock().unwrap(), Some(Tier::Pro));
    }

    #[tokio::test]
    async fn payment_reference_is_kept_once_set() {
        let mut sub = submission("s8", Tier::Basic);
        sub.payment_reference = Some("txn_first".to_string());
        let store = MemStore::with(sub);
        let llm = StubLlm::default();

        confirm_and_deliver(&store, &llm, "s8", None, Some("txn_second"))
            .await
            .unwrap();

        assert_eq!(
            store.get("s8").payment_reference.as_deref(),
            Some("txn_first")
        );
    }

    #[test]
    fn effective_tier_defaults_pending_payment_to_basic() {
        assert_eq!(effective_tier(None, Tier::PendingPayment), Tier::Basic);
        assert_eq!(effective_tier(None, Tier::Free), Tier::Free);
        assert_eq!(effective_tier(None, Tier::Pro), Tier::Pro);
        assert_eq!(effective_tier(Some(Tier::Pro), Tier::Basic), Tier::Pro);
    }
}
