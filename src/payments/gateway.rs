//! Signed JSON client for the payment gateway.
//!
//! Every command POSTs one envelope to a single endpoint:
//! `{cmd, version, lang, sid, mktime, data, hash}` with an HMAC-MD5 `hash`
//! over the rest. Responses wrap their payload in `data`, report errors both
//! at the top level and inside `data`, and express status in two dialects.

use crate::errors::ApiError;
use crate::http::send_with_retry;
use crate::payments::signature::{sign_envelope, verify_webhook, WebhookVerdict};
use crate::payments::InvoiceStatus;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

const CMD_CREATE_INVOICE: &str = "createInvoice";
const CMD_STATUS_PAYMENT: &str = "statusPayment";
const CMD_INVOICE_CANCEL: &str = "invoiceCancel";
const CMD_VOID_PAYMENT: &str = "voidPayment";
const CMD_REFUND_TO_EWALLET: &str = "refundPaymentToEwallet";

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Successful invoice creation.
#[derive(Debug, Clone)]
pub struct CreatedInvoice {
    pub invoice_id: String,
    /// Raw QR payload (EMV string) when provided.
    pub qr_payload: Option<String>,
    /// Hosted QR image / payment page link when provided.
    pub qr_link: Option<String>,
}

/// Decoded status check.
#[derive(Debug, Clone)]
pub struct StatusResult {
    pub status: Option<InvoiceStatus>,
    pub invoice_id: Option<String>,
    pub order_id: Option<String>,
    /// Minor units.
    pub amount: Option<i64>,
    pub trans_id: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
}

pub struct PaymentGateway {
    client: reqwest::Client,
    api_url: String,
    sid: String,
    password: String,
    api_version: u32,
    test_mode: bool,
    strict_webhook: bool,
}

impl PaymentGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: reqwest::Client,
        api_url: String,
        sid: String,
        password: String,
        api_version: u32,
        test_mode: bool,
        strict_webhook: bool,
    ) -> Self {
        Self {
            client,
            api_url,
            sid,
            password,
            api_version,
            test_mode,
            strict_webhook,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_url.is_empty() && !self.sid.is_empty() && !self.password.is_empty()
    }

    /// Envelope with fields in wire order, signed last.
    fn build_envelope(&self, cmd: &str, data: Value) -> Value {
        let mut envelope = Map::new();
        envelope.insert("cmd".into(), json!(cmd));
        envelope.insert("version".into(), json!(self.api_version));
        envelope.insert("lang".into(), json!("ru"));
        envelope.insert("sid".into(), json!(self.sid));
        envelope.insert("mktime".into(), json!(Utc::now().timestamp().to_string()));
        envelope.insert("data".into(), data);
        sign_envelope(Value::Object(envelope), &self.password)
    }

    async fn request(&self, cmd: &str, data: Value) -> Result<Value, ApiError> {
        if !self.is_configured() {
            return Err(ApiError::BusinessRule("payment gateway not configured".into()));
        }

        let envelope = self.build_envelope(cmd, data);
        debug!("payment gateway request: {}", cmd);

        let response = send_with_retry(
            || {
                self.client
                    .post(&self.api_url)
                    .timeout(READ_TIMEOUT)
                    .header("Content-Type", "application/json; charset=utf-8")
                    .json(&envelope)
            },
            "payment gateway",
        )
        .await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| ApiError::Schema(format!("payment gateway response: {e}")))?;

        // Top-level error form: {"status": "error", "message": ...}
        if body.get("status").and_then(Value::as_str) == Some("error") {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown gateway error");
            return Err(ApiError::Permanent {
                status: 200,
                body: format!("{cmd}: {message}"),
            });
        }

        Ok(body)
    }

    /// Payload lives under `data`; errors may hide there too.
    fn unwrap_data(cmd: &str, body: Value) -> Result<Value, ApiError> {
        let data = body.get("data").cloned().unwrap_or(body);
        if let Some(code) = data.get("error") {
            let desc = data
                .get("desc")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("error code {code}"));
            return Err(ApiError::Permanent {
                status: 200,
                body: format!("{cmd}: {desc}"),
            });
        }
        Ok(data)
    }

    /// Create an invoice. `amount_som` is converted to minor units on the
    /// wire (1 som = 100 tiyin).
    pub async fn create_invoice(
        &self,
        order_id: &str,
        amount_som: f64,
        description: &str,
    ) -> Result<CreatedInvoice, ApiError> {
        let amount_minor = (amount_som * 100.0).round() as i64;

        let mut data = Map::new();
        data.insert("order_id".into(), json!(order_id));
        data.insert("desc".into(), json!(description));
        data.insert("amount".into(), json!(amount_minor));
        data.insert("currency".into(), json!("KGS"));
        data.insert("test".into(), json!(if self.test_mode { 1 } else { 0 }));

        let body = self.request(CMD_CREATE_INVOICE, Value::Object(data)).await?;
        let data = Self::unwrap_data(CMD_CREATE_INVOICE, body)?;

        let invoice_id = data
            .get("invoice_id")
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| ApiError::Schema("createInvoice: missing invoice_id".into()))?;

        let qr_payload = ["qr", "emv_qr", "paylink_url"]
            .iter()
            .find_map(|k| data.get(*k).and_then(Value::as_str))
            .map(str::to_string);
        let qr_link = ["qr_url", "site_pay", "link_app"]
            .iter()
            .find_map(|k| data.get(*k).and_then(Value::as_str))
            .map(str::to_string);

        Ok(CreatedInvoice {
            invoice_id,
            qr_payload,
            qr_link,
        })
    }

    /// Check payment status by invoice id or order id.
    pub async fn check_status(
        &self,
        invoice_id: Option<&str>,
        order_id: Option<&str>,
    ) -> Result<StatusResult, ApiError> {
        if invoice_id.is_none() && order_id.is_none() {
            return Err(ApiError::BusinessRule(
                "statusPayment needs invoice_id or order_id".into(),
            ));
        }

        let mut data = Map::new();
        if let Some(id) = invoice_id {
            data.insert("invoice_id".into(), json!(id));
        }
        if let Some(id) = order_id {
            data.insert("order_id".into(), json!(id));
        }

        let body = self.request(CMD_STATUS_PAYMENT, Value::Object(data)).await?;
        let data = Self::unwrap_data(CMD_STATUS_PAYMENT, body)?;

        // statusPayment may return a payments array; take the first entry.
        let payment = data
            .get("payments")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .cloned()
            .unwrap_or(data);

        Ok(decode_status_payload(&payment))
    }

    pub async fn cancel_invoice(&self, invoice_id: &str) -> bool {
        match self
            .request(CMD_INVOICE_CANCEL, json!({"invoice_id": invoice_id}))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("invoiceCancel {} failed: {}", invoice_id, e);
                false
            }
        }
    }

    pub async fn void_payment(&self, trans_id: &str) -> bool {
        match self
            .request(CMD_VOID_PAYMENT, json!({"trans_id": trans_id}))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("voidPayment {} failed: {}", trans_id, e);
                false
            }
        }
    }

    pub async fn refund_to_ewallet(&self, trans_id: &str, amount_minor: i64) -> bool {
        match self
            .request(
                CMD_REFUND_TO_EWALLET,
                json!({"trans_id": trans_id, "amount": amount_minor}),
            )
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("refundPaymentToEwallet {} failed: {}", trans_id, e);
                false
            }
        }
    }

    /// Verify an inbound webhook payload against the shared secret.
    /// A missing hash is tolerated for legacy senders unless strict mode is
    /// on; it is always logged.
    pub fn verify_webhook_payload(&self, payload: &Value) -> Result<(), ApiError> {
        match verify_webhook(payload, &self.password) {
            WebhookVerdict::Valid => Ok(()),
            WebhookVerdict::MissingHash => {
                if self.strict_webhook {
                    warn!("webhook without hash rejected (strict mode)");
                    Err(ApiError::SignatureInvalid)
                } else {
                    warn!("webhook accepted without hash signature (legacy sender)");
                    Ok(())
                }
            }
            WebhookVerdict::Invalid => {
                warn!("webhook signature mismatch, rejecting payload");
                Err(ApiError::SignatureInvalid)
            }
        }
    }
}

/// Decode one status payload entry. Numeric `status_pay` wins over the
/// string `status` label.
pub fn decode_status_payload(payment: &Value) -> StatusResult {
    let status = payment
        .get("status_pay")
        .and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .and_then(InvoiceStatus::from_code)
        .or_else(|| {
            payment
                .get("status")
                .and_then(Value::as_str)
                .and_then(InvoiceStatus::from_label)
        });

    let get_string = |key: &str| {
        payment.get(key).and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };

    let paid_at = payment
        .get("dt")
        .or_else(|| payment.get("date_pay"))
        .and_then(Value::as_str)
        .and_then(parse_gateway_datetime);

    StatusResult {
        status,
        invoice_id: get_string("invoice_id"),
        order_id: get_string("order_id"),
        amount: payment.get("amount").and_then(Value::as_i64),
        trans_id: get_string("trans_id").or_else(|| get_string("trans")),
        paid_at,
    }
}

fn parse_gateway_datetime(s: &str) -> Option<DateTime<Utc>> {
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::signature::verify_webhook;

    fn gateway() -> PaymentGateway {
        PaymentGateway::new(
            reqwest::Client::new(),
            "https://pay.example.test/api/json".into(),
            "5796540861".into(),
            "secret".into(),
            1005,
            true,
            false,
        )
    }

    #[test]
    fn envelope_carries_wire_order_and_valid_hash() {
        let gw = gateway();
        let envelope = gw.build_envelope(CMD_CREATE_INVOICE, json!({"order_id": "A-1"}));

        let keys: Vec<&String> = envelope.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["cmd", "version", "lang", "sid", "mktime", "data", "hash"]);
        assert_eq!(verify_webhook(&envelope, "secret"), WebhookVerdict::Valid);
    }

    #[test]
    fn status_decodes_numeric_form_first() {
        let result = decode_status_payload(&json!({
            "status_pay": 1,
            "status": "pending",
            "invoice_id": 42,
            "amount": 5000,
            "trans": "T-9",
            "dt": "2026-08-01 12:30:00"
        }));

        assert_eq!(result.status, Some(InvoiceStatus::Paid));
        assert_eq!(result.invoice_id.as_deref(), Some("42"));
        assert_eq!(result.amount, Some(5000));
        assert_eq!(result.trans_id.as_deref(), Some("T-9"));
        assert!(result.paid_at.is_some());
    }

    #[test]
    fn status_falls_back_to_string_form() {
        let result = decode_status_payload(&json!({"status": "approved"}));
        assert_eq!(result.status, Some(InvoiceStatus::Paid));

        let result = decode_status_payload(&json!({"status": "expired"}));
        assert_eq!(result.status, Some(InvoiceStatus::Expired));

        let result = decode_status_payload(&json!({"status": "???"}));
        assert_eq!(result.status, None);
    }

    #[test]
    fn unwrap_data_surfaces_nested_errors() {
        let err = PaymentGateway::unwrap_data(
            "createInvoice",
            json!({"data": {"error": 14, "desc": "invalid merchant"}}),
        )
        .unwrap_err();
        match err {
            ApiError::Permanent { body, .. } => assert!(body.contains("invalid merchant")),
            other => panic!("expected Permanent, got {other:?}"),
        }
    }

    #[test]
    fn webhook_policy_depends_on_strict_mode() {
        let legacy = gateway();
        assert!(legacy.verify_webhook_payload(&json!({"invoice_id": "A"})).is_ok());

        let strict = PaymentGateway::new(
            reqwest::Client::new(),
            "u".into(),
            "s".into(),
            "secret".into(),
            1005,
            false,
            true,
        );
        assert!(matches!(
            strict.verify_webhook_payload(&json!({"invoice_id": "A"})),
            Err(ApiError::SignatureInvalid)
        ));
    }
}
