//! HMAC-MD5 request signing and webhook verification.
//!
//! The gateway signs the compact JSON serialisation (comma/colon separators,
//! non-ASCII preserved) of the envelope minus the `hash` field. Inbound
//! webhooks are verified by recomputing that digest over the payload in its
//! original key order; `serde_json` runs with `preserve_order` for exactly
//! this reason.

use hmac::{Hmac, Mac};
use md5::Md5;
use serde_json::Value;

type HmacMd5 = Hmac<Md5>;

/// Compact serialisation the gateway signs: no whitespace, non-ASCII kept
/// verbatim (serde_json's default output already matches).
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

/// Hex HMAC-MD5 of the canonical serialisation.
pub fn sign(value: &Value, secret: &str) -> String {
    let mut mac = HmacMd5::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(canonical_json(value).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Attach a `hash` field computed over the payload without it.
pub fn sign_envelope(mut envelope: Value, secret: &str) -> Value {
    let signature = sign(&envelope, secret);
    if let Some(map) = envelope.as_object_mut() {
        map.insert("hash".to_string(), Value::String(signature));
    }
    envelope
}

/// Outcome of webhook signature verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookVerdict {
    /// `hash` present and correct.
    Valid,
    /// `hash` absent. Legacy senders omit it; policy decides acceptance.
    MissingHash,
    /// `hash` present but wrong. The event must be rejected.
    Invalid,
}

/// Verify an inbound payload. The comparison is timing-safe.
pub fn verify_webhook(payload: &Value, secret: &str) -> WebhookVerdict {
    let received = match payload.get("hash").and_then(Value::as_str) {
        Some(h) if !h.is_empty() => h.to_string(),
        _ => return WebhookVerdict::MissingHash,
    };

    let mut without_hash = payload.clone();
    if let Some(map) = without_hash.as_object_mut() {
        map.remove("hash");
    }

    let Ok(received_bytes) = hex::decode(&received) else {
        return WebhookVerdict::Invalid;
    };

    let mut mac = HmacMd5::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(canonical_json(&without_hash).as_bytes());

    match mac.verify_slice(&received_bytes) {
        Ok(()) => WebhookVerdict::Valid,
        Err(_) => WebhookVerdict::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_form_is_compact_and_keeps_non_ascii() {
        let value = json!({"cmd": "createInvoice", "desc": "Доставка", "amount": 5000});
        let s = canonical_json(&value);
        assert!(!s.contains(' '));
        assert!(s.contains("Доставка"));
        assert!(s.contains("\"cmd\":\"createInvoice\""));
    }

    #[test]
    fn key_order_is_preserved_in_canonical_form() {
        let value: Value =
            serde_json::from_str(r#"{"z":1,"a":2,"m":3}"#).unwrap();
        assert_eq!(canonical_json(&value), r#"{"z":1,"a":2,"m":3}"#);
    }

    #[test]
    fn sign_verify_round_trips() {
        let payload = json!({"invoice_id": "A", "status_pay": 1});
        let signed = sign_envelope(payload, "k");
        assert_eq!(verify_webhook(&signed, "k"), WebhookVerdict::Valid);
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let signed = sign_envelope(json!({"invoice_id": "A", "status_pay": 1}), "k");
        assert_eq!(verify_webhook(&signed, "k2"), WebhookVerdict::Invalid);
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let mut signed = sign_envelope(json!({"invoice_id": "A", "status_pay": 1}), "k");
        signed["status_pay"] = json!(0);
        assert_eq!(verify_webhook(&signed, "k"), WebhookVerdict::Invalid);
    }

    #[test]
    fn missing_hash_is_reported_distinctly() {
        let payload = json!({"invoice_id": "A", "status_pay": 1});
        assert_eq!(verify_webhook(&payload, "k"), WebhookVerdict::MissingHash);
    }

    #[test]
    fn malformed_hex_hash_is_invalid() {
        let mut payload = json!({"invoice_id": "A"});
        payload["hash"] = json!("not-hex");
        assert_eq!(verify_webhook(&payload, "k"), WebhookVerdict::Invalid);
    }
}
