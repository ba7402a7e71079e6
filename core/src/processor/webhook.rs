//! # Webhook Signature Verification & Event Extraction
//!
//! The processor notifies us of completed payments by POSTing signed
//! events. The signature scheme is Stripe's `v1`: HMAC-SHA256 over
//! `"{timestamp}.{raw_body}"` with the shared endpoint secret, delivered
//! in a `Stripe-Signature` header of the form
//!
//! ```text
//! t=1712000000,v1=5257a869e7...,v1=9aa389...
//! ```
//!
//! Verification accepts the event if *any* `v1` candidate matches
//! (Stripe sends several during secret rotation) and the signed
//! timestamp is within the replay tolerance. The MAC comparison is
//! constant-time via `Mac::verify_slice`.

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::config::WEBHOOK_TIMESTAMP_TOLERANCE;
use crate::error::{CoreError, CoreResult};

type HmacSha256 = Hmac<Sha256>;

/// The event type that credits a wallet. Everything else is acknowledged
/// and ignored.
pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";

/// The payment status required on a completed session.
pub const PAYMENT_STATUS_PAID: &str = "paid";

// ---------------------------------------------------------------------------
// Event Types
// ---------------------------------------------------------------------------

/// A verified, parsed webhook event.
///
/// Fields mirror the slice of the processor's event envelope the core
/// consumes; anything else in the payload is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    /// The event type string (e.g. `checkout.session.completed`).
    pub event_type: String,
    /// The payment intent backing the session — our idempotency key and
    /// refund reference.
    pub payment_intent: Option<String>,
    /// The purchasing user, round-tripped through the session.
    pub client_reference_id: Option<String>,
    /// Total charged, in processor minor units (cents).
    pub amount_total: Option<u64>,
    /// The session's payment status (`paid` / `unpaid`).
    pub payment_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: RawSessionObject,
}

#[derive(Debug, Deserialize)]
struct RawSessionObject {
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    client_reference_id: Option<String>,
    #[serde(default)]
    amount_total: Option<u64>,
    #[serde(default)]
    payment_status: Option<String>,
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Verifies the signature header against the raw body and parses the
/// event.
///
/// `now` is injected so the skew check is testable; production callers
/// pass `Utc::now()`.
///
/// # Errors
///
/// [`CoreError::InvalidSignature`] on a malformed header, a stale or
/// future-dated timestamp, or a MAC mismatch. The detail string never
/// contains key material.
pub fn verify_and_parse(
    body: &[u8],
    signature_header: &str,
    secret: &str,
    now: DateTime<Utc>,
) -> CoreResult<WebhookEvent> {
    if secret.is_empty() {
        return Err(CoreError::InvalidSignature {
            detail: "no webhook secret configured".into(),
        });
    }

    let (timestamp, candidates) = parse_signature_header(signature_header)?;

    let skew = (now - timestamp).abs();
    if skew
        > chrono::Duration::from_std(WEBHOOK_TIMESTAMP_TOLERANCE)
            .unwrap_or_else(|_| chrono::Duration::seconds(300))
    {
        return Err(CoreError::InvalidSignature {
            detail: "timestamp outside tolerance".into(),
        });
    }

    let signed_payload = [timestamp.timestamp().to_string().as_bytes(), b".", body].concat();
    let verified = candidates.iter().any(|candidate| {
        let Ok(sig_bytes) = hex::decode(candidate) else {
            return false;
        };
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(&signed_payload);
        mac.verify_slice(&sig_bytes).is_ok()
    });

    if !verified {
        return Err(CoreError::InvalidSignature {
            detail: "signature mismatch".into(),
        });
    }

    let raw: RawEvent = serde_json::from_slice(body).map_err(|e| CoreError::InvalidSignature {
        detail: format!("unparseable event payload: {e}"),
    })?;

    Ok(WebhookEvent {
        event_type: raw.event_type,
        payment_intent: raw.data.object.payment_intent,
        client_reference_id: raw.data.object.client_reference_id,
        amount_total: raw.data.object.amount_total,
        payment_status: raw.data.object.payment_status,
    })
}

/// Splits `t=...,v1=...,v1=...` into the timestamp and the signature
/// candidates. Unknown schemes (`v0`) are skipped, as Stripe documents.
fn parse_signature_header(header: &str) -> CoreResult<(DateTime<Utc>, Vec<String>)> {
    let mut timestamp = None;
    let mut candidates = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                let secs = value.parse::<i64>().map_err(|_| CoreError::InvalidSignature {
                    detail: "non-numeric timestamp".into(),
                })?;
                timestamp = Utc.timestamp_opt(secs, 0).single();
            }
            Some(("v1", value)) => candidates.push(value.to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| CoreError::InvalidSignature {
        detail: "missing timestamp".into(),
    })?;
    if candidates.is_empty() {
        return Err(CoreError::InvalidSignature {
            detail: "missing v1 signature".into(),
        });
    }
    Ok((timestamp, candidates))
}

/// Computes the `v1` signature for a payload. Test and dev-tooling
/// helper — the verifying side never needs it.
pub fn sign(body: &[u8], secret: &str, timestamp: DateTime<Utc>) -> String {
    let signed_payload = [timestamp.timestamp().to_string().as_bytes(), b".", body].concat();
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(&signed_payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Formats a full `Stripe-Signature` header for a payload. Test helper.
pub fn signature_header(body: &[u8], secret: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "t={},v1={}",
        timestamp.timestamp(),
        sign(body, secret, timestamp)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn completed_body() -> Vec<u8> {
        serde_json::json!({
            "type": "checkout.session.completed",
            "data": { "object": {
                "payment_intent": "pi_abc123",
                "client_reference_id": "3c9e7f04-9a0b-4a57-9335-9f24de595bc2",
                "amount_total": 1000,
                "payment_status": "paid",
            }}
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn valid_signature_parses_event() {
        let body = completed_body();
        let now = Utc::now();
        let header = signature_header(&body, SECRET, now);

        let event = verify_and_parse(&body, &header, SECRET, now).unwrap();
        assert_eq!(event.event_type, CHECKOUT_COMPLETED);
        assert_eq!(event.payment_intent.as_deref(), Some("pi_abc123"));
        assert_eq!(event.amount_total, Some(1000));
        assert_eq!(event.payment_status.as_deref(), Some(PAYMENT_STATUS_PAID));
    }

    #[test]
    fn wrong_secret_rejected() {
        let body = completed_body();
        let now = Utc::now();
        let header = signature_header(&body, "whsec_other", now);

        let err = verify_and_parse(&body, &header, SECRET, now).unwrap_err();
        assert!(matches!(err, CoreError::InvalidSignature { .. }));
    }

    #[test]
    fn tampered_body_rejected() {
        let body = completed_body();
        let now = Utc::now();
        let header = signature_header(&body, SECRET, now);

        let mut tampered = body.clone();
        tampered[0] ^= 0x01;
        let err = verify_and_parse(&tampered, &header, SECRET, now).unwrap_err();
        assert!(matches!(err, CoreError::InvalidSignature { .. }));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let body = completed_body();
        let signed_at = Utc::now() - chrono::Duration::minutes(10);
        let header = signature_header(&body, SECRET, signed_at);

        let err = verify_and_parse(&body, &header, SECRET, Utc::now()).unwrap_err();
        match err {
            CoreError::InvalidSignature { detail } => {
                assert!(detail.contains("timestamp"));
            }
            other => panic!("expected InvalidSignature, got {other:?}"),
        }
    }

    #[test]
    fn future_timestamp_rejected() {
        let body = completed_body();
        let signed_at = Utc::now() + chrono::Duration::minutes(10);
        let header = signature_header(&body, SECRET, signed_at);

        assert!(verify_and_parse(&body, &header, SECRET, Utc::now()).is_err());
    }

    #[test]
    fn skew_within_tolerance_accepted() {
        let body = completed_body();
        let signed_at = Utc::now() - chrono::Duration::minutes(4);
        let header = signature_header(&body, SECRET, signed_at);

        assert!(verify_and_parse(&body, &header, SECRET, Utc::now()).is_ok());
    }

    #[test]
    fn rotation_candidate_accepted() {
        // Header with a stale v1 first and a valid one second.
        let body = completed_body();
        let now = Utc::now();
        let good = sign(&body, SECRET, now);
        let header = format!("t={},v1={},v1={}", now.timestamp(), "0".repeat(64), good);

        assert!(verify_and_parse(&body, &header, SECRET, now).is_ok());
    }

    #[test]
    fn malformed_header_rejected() {
        let body = completed_body();
        let now = Utc::now();

        for header in ["", "t=abc,v1=00", "v1=00", "t=123"] {
            let err = verify_and_parse(&body, header, SECRET, now).unwrap_err();
            assert!(matches!(err, CoreError::InvalidSignature { .. }), "{header}");
        }
    }

    #[test]
    fn missing_secret_rejected() {
        let body = completed_body();
        let now = Utc::now();
        let header = signature_header(&body, SECRET, now);

        assert!(verify_and_parse(&body, &header, "", now).is_err());
    }

    #[test]
    fn other_event_types_still_parse() {
        let body = serde_json::json!({
            "type": "charge.refunded",
            "data": { "object": {} }
        })
        .to_string()
        .into_bytes();
        let now = Utc::now();
        let header = signature_header(&body, SECRET, now);

        let event = verify_and_parse(&body, &header, SECRET, now).unwrap();
        assert_eq!(event.event_type, "charge.refunded");
        assert!(event.payment_intent.is_none());
    }
}
