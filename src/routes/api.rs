use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::db::{self, SubmissionStore, SubmissionView, Tier};
use crate::errors::AppError;
use crate::payments;
use crate::state::AppState;
use crate::workflow;

pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: axum::extract::Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut file_data: Option<Vec<u8>> = None;
    let mut file_name = String::new();
    let mut content_type = String::new();

    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or("").to_string();
        if name == "file" {
            file_name = field.file_name().unwrap_or("resume.pdf").to_string();
            content_type = field.content_type().unwrap_or("").to_string();
            if let Ok(data) = field.bytes().await {
                file_data = Some(data.to_vec());
            }
        }
    }

    let data = match file_data {
        Some(d) if !d.is_empty() => d,
        _ => return Err(AppError::Validation("no file provided".to_string())),
    };

    if content_type != "application/pdf" && !file_name.to_lowercase().ends_with(".pdf") {
        return Err(AppError::Validation(
            "only PDF files are accepted".to_string(),
        ));
    }

    if data.len() > MAX_UPLOAD_BYTES {
        return Err(AppError::Validation("file must be under 5MB".to_string()));
    }

    let resume_text =
        crate::pdf::extract_resume_text(&data).map_err(|e| AppError::Validation(e.to_string()))?;

    let visitor_id = headers
        .get("x-visitor-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();

    let prior = db::count_visitor_submissions(state.pool.as_ref(), &visitor_id).await?;
    let is_first_use = prior == 0;
    let tier = if is_first_use {
        Tier::Free
    } else {
        Tier::PendingPayment
    };

    let submission_id = db::generate_submission_id();
    db::create_submission(
        state.pool.as_ref(),
        &submission_id,
        &file_name,
        &visitor_id,
        &resume_text,
        tier,
    )
    .await?;

    info!(
        "created submission {submission_id} (tier {:?}, {} chars extracted)",
        tier,
        resume_text.len()
    );

    // First use is free: deliver right away, in the background.
    if is_first_use {
        let state = state.clone();
        let id = submission_id.clone();
        tokio::spawn(async move {
            if let Err(e) = workflow::confirm_and_deliver(
                state.pool.as_ref(),
                &state.llm,
                &id,
                Some(Tier::Free),
                None,
            )
            .await
            {
                error!("background delivery failed for {id}: {e}");
            }
        });
    }

    Ok(Json(json!({
        "id": submission_id,
        "is_first_use": is_first_use
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPaymentRequest {
    pub submission_id: String,
    pub tier: Option<Tier>,
}

pub async fn confirm_payment(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConfirmPaymentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = workflow::confirm_and_deliver(
        state.pool.as_ref(),
        &state.llm,
        &req.submission_id,
        req.tier,
        None,
    )
    .await?;

    if outcome.already_processed {
        Ok(Json(json!({ "success": true, "already_processed": true })))
    } else {
        Ok(Json(json!({ "success": true })))
    }
}

pub async fn get_submission(
    State(state): State<Arc<AppState>>,
    Path(submission_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let submission = state
        .pool
        .as_ref()
        .fetch(&submission_id)
        .await?
        .ok_or_else(|| AppError::NotFound("submission not found".to_string()))?;

    Ok(Json(SubmissionView::from(submission)))
}

pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, AppError> {
    let signature = headers
        .get(payments::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    payments::verify_signature(&body, signature, &state.config.paddle_webhook_secret).map_err(
        |e| {
            warn!("webhook signature rejected: {e}");
            AppError::Signature
        },
    )?;

    let event: payments::WebhookEvent = serde_json::from_str(&body)
        .map_err(|e| AppError::Validation(format!("malformed webhook payload: {e}")))?;

    if event.event_type != payments::PURCHASE_COMPLETED_EVENT {
        return Ok(Json(json!({ "received": true })));
    }

    let data = event
        .data
        .ok_or_else(|| AppError::Validation("event has no data".to_string()))?;
    let submission_id = data
        .custom_data
        .as_ref()
        .and_then(|c| c.submission_id.clone())
        .ok_or_else(|| {
            AppError::Validation("no submission_id in webhook custom_data".to_string())
        })?;
    let tier = data.custom_data.and_then(|c| c.tier);

    info!("payment confirmed for {submission_id} via webhook");

    // A non-2xx here makes the provider redeliver, which re-enters the same
    // idempotent workflow and repairs any partial state.
    workflow::confirm_and_deliver(
        state.pool.as_ref(),
        &state.llm,
        &submission_id,
        tier,
        data.id.as_deref(),
    )
    .await?;

    Ok(Json(json!({ "received": true })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    pub submission_id: String,
}

/// Manual operator cleanup: drops the bulk text, keeps payment records for
/// accounting.
pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CleanupRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .pool
        .as_ref()
        .clear_raw_text(&req.submission_id)
        .await?;

    info!("cleared raw text for {}", req.submission_id);
    Ok(Json(json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::llm::GenerationClient;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    const SECRET: &str = "whsec_test";

    // A lazy pool never connects; any handler that touches the database in
    // these tests would fail loudly instead of mutating anything.
    fn test_state() -> Arc<AppState> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost:1/unreachable")
            .unwrap();
        Arc::new(AppState {
            pool: Arc::new(pool),
            config: Arc::new(Config {
                database_url: String::new(),
                claude_api_key: "test-key".to_string(),
                paddle_webhook_secret: SECRET.to_string(),
                host: String::new(),
                port: 0,
            }),
            llm: GenerationClient::new("test-key".to_string()),
        })
    }

    fn signed_header(body: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("1671552777:{body}").as_bytes());
        format!("ts=1671552777;h1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[tokio::test]
    async fn webhook_rejects_an_invalid_signature() {
        let mut headers = HeaderMap::new();
        headers.insert("paddle-signature", "ts=1;h1=deadbeef".parse().unwrap());

        let result = payment_webhook(State(test_state()), headers, "{}".to_string()).await;

        assert!(matches!(result, Err(AppError::Signature)));
    }

    #[tokio::test]
    async fn webhook_rejects_a_missing_signature_header() {
        let result =
            payment_webhook(State(test_state()), HeaderMap::new(), "{}".to_string()).await;

        assert!(matches!(result, Err(AppError::Signature)));
    }

    #[tokio::test]
    async fn webhook_acknowledges_unrelated_events() {
        let body = r#"{"event_type":"transaction.updated"}"#;
        let mut headers = HeaderMap::new();
        headers.insert("paddle-signature", signed_header(body).parse().unwrap());

        let result = payment_webhook(State(test_state()), headers, body.to_string()).await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn webhook_requires_a_submission_id() {
        let body = r#"{"event_type":"transaction.completed","data":{"id":"txn_1"}}"#;
        let mut headers = HeaderMap::new();
        headers.insert("paddle-signature", signed_header(body).parse().unwrap());

        let result = payment_webhook(State(test_state()), headers, body.to_string()).await;

        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
