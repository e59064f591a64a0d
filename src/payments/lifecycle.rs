//! Invoice lifecycle: creation with QR delivery, status polling, webhook
//! events and idempotent finalisation.
//!
//! Finalisation is serialised per payment id by the storage layer's guarded
//! UPDATE: whichever caller wins the PENDING → PAID transition performs the
//! user-visible side effects; every later caller sees success and does
//! nothing.

use crate::db::InvoiceStore;
use crate::errors::ApiError;
use crate::payments::gateway::{decode_status_payload, CreatedInvoice, PaymentGateway};
use crate::payments::InvoiceStatus;
use crate::services::telegram::ChannelPublisher;
use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

pub struct InvoiceLifecycle {
    gateway: Arc<PaymentGateway>,
    invoices: InvoiceStore,
    publisher: Arc<dyn ChannelPublisher>,
}

impl InvoiceLifecycle {
    pub fn new(
        gateway: Arc<PaymentGateway>,
        invoices: InvoiceStore,
        publisher: Arc<dyn ChannelPublisher>,
    ) -> Self {
        Self {
            gateway,
            invoices,
            publisher,
        }
    }

    /// Create an invoice upstream, persist it PENDING and deliver the QR
    /// message to the user. The QR message id is recorded for later cleanup.
    pub async fn create(
        &self,
        order_id: &str,
        client_ref: &str,
        user_chat_id: i64,
        amount_som: f64,
        description: &str,
    ) -> Result<CreatedInvoice, ApiError> {
        let created = self
            .gateway
            .create_invoice(order_id, amount_som, description)
            .await?;

        let amount_minor = (amount_som * 100.0).round() as i64;
        self.invoices
            .create(
                &created.invoice_id,
                client_ref,
                user_chat_id,
                amount_minor,
                description,
                created.qr_payload.as_deref(),
            )
            .map_err(|e| ApiError::BusinessRule(format!("persisting invoice: {e}")))?;

        let caption = format!(
            "💳 <b>Счёт на оплату</b>\n\n{} — <b>{:.0} сом</b>\n\nОтсканируйте QR-код для оплаты.",
            description, amount_som
        );

        let message_id = match &created.qr_link {
            Some(link) => {
                self.publisher
                    .send_photo_url(user_chat_id, link, &caption)
                    .await
            }
            None => {
                let text = match &created.qr_payload {
                    Some(payload) => format!("{caption}\n\n<code>{payload}</code>"),
                    None => caption,
                };
                self.publisher.send_to_chat(user_chat_id, &text).await
            }
        };

        match message_id {
            Ok(id) => {
                if let Err(e) = self.invoices.set_message_id(&created.invoice_id, id) {
                    warn!("recording QR message id failed: {}", e);
                }
            }
            Err(e) => warn!("QR delivery for {} failed: {}", created.invoice_id, e),
        }

        info!("invoice {} created for chat {}", created.invoice_id, user_chat_id);
        Ok(created)
    }

    /// Poll upstream status; a PAID answer triggers finalisation.
    pub async fn check(&self, payment_id: &str) -> Result<InvoiceStatus, ApiError> {
        let result = self.gateway.check_status(Some(payment_id), None).await?;

        let status = result
            .status
            .ok_or_else(|| ApiError::Schema("statusPayment: undecodable status".into()))?;

        if status == InvoiceStatus::Paid {
            if let Err(e) = self.finalise(payment_id).await {
                warn!("finalise after status poll failed: {}", e);
            }
        } else if let Err(e) = self.invoices.set_status(payment_id, status) {
            warn!("recording polled status failed: {}", e);
        }

        Ok(status)
    }

    pub async fn cancel(&self, payment_id: &str) -> bool {
        let ok = self.gateway.cancel_invoice(payment_id).await;
        if ok {
            if let Err(e) = self.invoices.set_status(payment_id, InvoiceStatus::Cancelled) {
                warn!("recording cancellation failed: {}", e);
            }
        }
        ok
    }

    pub async fn void(&self, trans_id: &str) -> bool {
        self.gateway.void_payment(trans_id).await
    }

    pub async fn refund(&self, trans_id: &str, amount_minor: i64) -> bool {
        self.gateway.refund_to_ewallet(trans_id, amount_minor).await
    }

    /// Inbound webhook. Signature failures reject the payload outright; a
    /// verified PAID triggers finalisation, any other status is acknowledged
    /// and recorded.
    pub async fn handle_webhook(&self, payload: &Value) -> Result<bool, ApiError> {
        self.gateway.verify_webhook_payload(payload)?;

        let event = payload.get("data").unwrap_or(payload);
        let decoded = decode_status_payload(event);

        let Some(payment_id) = decoded.invoice_id else {
            return Err(ApiError::Schema("webhook without invoice_id".into()));
        };

        match decoded.status {
            Some(InvoiceStatus::Paid) => {
                let finalised = self
                    .finalise(&payment_id)
                    .await
                    .map_err(|e| ApiError::BusinessRule(format!("finalise: {e}")))?;
                Ok(finalised)
            }
            Some(status) => {
                info!("webhook for {} with status {}, ignored", payment_id, status.as_str());
                if let Err(e) = self.invoices.set_status(&payment_id, status) {
                    warn!("recording webhook status failed: {}", e);
                }
                Ok(false)
            }
            None => {
                warn!("webhook for {} carries no decodable status", payment_id);
                Ok(false)
            }
        }
    }

    /// Idempotent terminal transition. Returns Ok(true) when the invoice is
    /// PAID afterwards (whether this call did the work or an earlier one).
    pub async fn finalise(&self, payment_id: &str) -> Result<bool> {
        let invoice = self
            .invoices
            .get(payment_id)
            .context("loading invoice")?;

        let Some(invoice) = invoice else {
            warn!("finalise: unknown payment_id {}", payment_id);
            return Ok(false);
        };

        if invoice.status == InvoiceStatus::Paid {
            info!("invoice {} already paid, nothing to do", payment_id);
            return Ok(true);
        }

        let won = self
            .invoices
            .mark_paid(payment_id)
            .context("marking invoice paid")?;
        if !won {
            // Another caller finished the transition in between.
            return Ok(true);
        }

        // QR cleanup is best effort; the payment is final either way.
        if let Some(message_id) = invoice.message_id {
            let _ = self
                .publisher
                .delete_message(invoice.user_channel_id, message_id)
                .await;
        }

        let user_text = format!(
            "✅ <b>Оплата получена!</b>\n\n{} — <b>{:.0} сом</b>\nСпасибо за оплату.",
            invoice.description,
            invoice.amount as f64 / 100.0
        );
        if let Err(e) = self
            .publisher
            .send_to_chat(invoice.user_channel_id, &user_text)
            .await
        {
            warn!("payment confirmation to user failed: {}", e);
        }

        let operator_text = format!(
            "💰 <b>Оплата получена</b>\n\nКлиент: {}\nСумма: {:.0} сом\nСчёт: <code>{}</code>",
            invoice.client_ref,
            invoice.amount as f64 / 100.0,
            payment_id
        );
        if let Err(e) = self.publisher.notify_operators(&operator_text).await {
            warn!("operator payment notification failed: {}", e);
        }

        info!("invoice {} finalised", payment_id);
        Ok(true)
    }
}
