//! Paddle webhook verification and event payloads.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::db::Tier;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "paddle-signature";
/// The only event type that unlocks delivery.
pub const PURCHASE_COMPLETED_EVENT: &str = "transaction.completed";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed signature header")]
    Malformed,

    #[error("signature mismatch")]
    Mismatch,
}

/// Verifies a `Paddle-Signature: ts=<unix>;h1=<hex>` header against the raw
/// request body. The signed payload is `"{ts}:{body}"`.
pub fn verify_signature(raw_body: &str, header: &str, secret: &str) -> Result<(), SignatureError> {
    let mut ts = None;
    let mut h1 = None;
    for part in header.split(';') {
        if let Some(v) = part.strip_prefix("ts=") {
            ts = Some(v);
        } else if let Some(v) = part.strip_prefix("h1=") {
            h1 = Some(v);
        }
    }
    let (ts, h1) = ts.zip(h1).ok_or(SignatureError::Malformed)?;
    let provided = hex::decode(h1).map_err(|_| SignatureError::Malformed)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Malformed)?;
    mac.update(ts.as_bytes());
    mac.update(b":");
    mac.update(raw_body.as_bytes());
    let expected = mac.finalize().into_bytes();

    if provided.len() != expected.len() {
        return Err(SignatureError::Mismatch);
    }
    if expected.as_slice().ct_eq(&provided).unwrap_u8() == 0 {
        return Err(SignatureError::Mismatch);
    }
    Ok(())
}

/// The subset of a Paddle event this service consumes.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub event_type: String,
    #[serde(default)]
    pub data: Option<EventData>,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    /// Paddle transaction id, recorded as the payment reference.
    pub id: Option<String>,
    pub custom_data: Option<CustomData>,
}

/// Checkout metadata we attach client-side when opening the Paddle overlay.
#[derive(Debug, Deserialize)]
pub struct CustomData {
    pub submission_id: Option<String>,
    pub tier: Option<Tier>,
}
