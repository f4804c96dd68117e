// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-provider webhook signature verification.
//!
//! All supported schemes are HMAC-SHA256 over the **raw** request body;
//! they differ in header name, hex prefix, and (for Slack) a timestamped
//! base string. Comparison uses [`subtle::ConstantTimeEq`] to prevent
//! timing oracles.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use drover_config::WebhookProviderKind;

type HmacSha256 = Hmac<Sha256>;

/// How long a Slack timestamp may lag before the request is rejected as a
/// replay.
const SLACK_MAX_SKEW_SECS: i64 = 60 * 5;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("missing signature header '{0}'")]
    MissingHeader(&'static str),
    #[error("signature is not valid hex")]
    MalformedSignature,
    #[error("signature mismatch")]
    Mismatch,
    #[error("stale timestamp")]
    StaleTimestamp,
}

/// The signature header consulted for a provider kind.
pub fn signature_header(kind: WebhookProviderKind) -> Option<&'static str> {
    match kind {
        WebhookProviderKind::Linear => Some("linear-signature"),
        WebhookProviderKind::Github => Some("x-hub-signature-256"),
        WebhookProviderKind::Slack => Some("x-slack-signature"),
        WebhookProviderKind::Unverified => None,
    }
}

/// The delivery-id header consulted for idempotency.
pub fn delivery_header(kind: WebhookProviderKind) -> Option<&'static str> {
    match kind {
        WebhookProviderKind::Linear => Some("linear-delivery"),
        WebhookProviderKind::Github => Some("x-github-delivery"),
        WebhookProviderKind::Slack | WebhookProviderKind::Unverified => Some("x-delivery-id"),
    }
}

fn hmac_hex(secret: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq_hex(expected_hex: &str, computed: &[u8]) -> Result<(), VerifyError> {
    let expected = hex::decode(expected_hex.trim()).map_err(|_| VerifyError::MalformedSignature)?;
    if expected.ct_eq(computed).into() {
        Ok(())
    } else {
        Err(VerifyError::Mismatch)
    }
}

/// Verify a raw webhook body against the provider's scheme.
///
/// `get_header` resolves a (lowercase) header name to its value; the
/// caller passes a closure over its header map so this stays framework-
/// free and directly testable.
pub fn verify_signature(
    kind: WebhookProviderKind,
    secret: &[u8],
    body: &[u8],
    get_header: impl Fn(&str) -> Option<String>,
    now_unix: i64,
) -> Result<(), VerifyError> {
    match kind {
        WebhookProviderKind::Unverified => Ok(()),
        WebhookProviderKind::Linear => {
            let header = signature_header(kind).unwrap();
            let sig = get_header(header).ok_or(VerifyError::MissingHeader("linear-signature"))?;
            constant_time_eq_hex(&sig, &hmac_hex(secret, body))
        }
        WebhookProviderKind::Github => {
            let header = signature_header(kind).unwrap();
            let sig =
                get_header(header).ok_or(VerifyError::MissingHeader("x-hub-signature-256"))?;
            let sig = sig
                .strip_prefix("sha256=")
                .ok_or(VerifyError::MalformedSignature)?;
            constant_time_eq_hex(sig, &hmac_hex(secret, body))
        }
        WebhookProviderKind::Slack => {
            let header = signature_header(kind).unwrap();
            let sig = get_header(header).ok_or(VerifyError::MissingHeader("x-slack-signature"))?;
            let ts = get_header("x-slack-request-timestamp")
                .ok_or(VerifyError::MissingHeader("x-slack-request-timestamp"))?;
            let ts_num: i64 = ts.parse().map_err(|_| VerifyError::StaleTimestamp)?;
            if (now_unix - ts_num).abs() > SLACK_MAX_SKEW_SECS {
                return Err(VerifyError::StaleTimestamp);
            }
            let sig = sig
                .strip_prefix("v0=")
                .ok_or(VerifyError::MalformedSignature)?;
            let mut base = Vec::with_capacity(body.len() + ts.len() + 4);
            base.extend_from_slice(b"v0:");
            base.extend_from_slice(ts.as_bytes());
            base.extend_from_slice(b":");
            base.extend_from_slice(body);
            constant_time_eq_hex(sig, &hmac_hex(secret, &base))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
