//! Payment invoice lifecycle: signed gateway client, webhook verification
//! and idempotent finalisation.

pub mod gateway;
pub mod lifecycle;
pub mod signature;

pub use gateway::{CreatedInvoice, PaymentGateway, StatusResult};
pub use lifecycle::InvoiceLifecycle;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Domain payment status. Upstream speaks two dialects (a numeric
/// `status_pay` code and a string `status` label), decoded here and nowhere
/// else; upstream codes never leave the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Cancelled,
    Expired,
    Processing,
    PartialRefund,
    FullRefund,
}

impl InvoiceStatus {
    /// Numeric `status_pay` form.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(InvoiceStatus::Pending),
            1 => Some(InvoiceStatus::Paid),
            -1 => Some(InvoiceStatus::Cancelled),
            -2 => Some(InvoiceStatus::Expired),
            2 => Some(InvoiceStatus::Processing),
            3 => Some(InvoiceStatus::PartialRefund),
            4 => Some(InvoiceStatus::FullRefund),
            _ => None,
        }
    }

    /// String `status` form.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_lowercase().as_str() {
            "approved" | "paid" => Some(InvoiceStatus::Paid),
            "pending" => Some(InvoiceStatus::Pending),
            "cancelled" | "canceled" => Some(InvoiceStatus::Cancelled),
            "expired" => Some(InvoiceStatus::Expired),
            "processing" => Some(InvoiceStatus::Processing),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Cancelled => "cancelled",
            InvoiceStatus::Expired => "expired",
            InvoiceStatus::Processing => "processing",
            InvoiceStatus::PartialRefund => "partial_refund",
            InvoiceStatus::FullRefund => "full_refund",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InvoiceStatus::Pending),
            "paid" => Some(InvoiceStatus::Paid),
            "cancelled" => Some(InvoiceStatus::Cancelled),
            "expired" => Some(InvoiceStatus::Expired),
            "processing" => Some(InvoiceStatus::Processing),
            "partial_refund" => Some(InvoiceStatus::PartialRefund),
            "full_refund" => Some(InvoiceStatus::FullRefund),
            _ => None,
        }
    }
}

/// Invoice row as persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Invoice {
    pub payment_id: String,
    pub client_ref: String,
    pub user_channel_id: i64,
    /// Minor units (tiyin).
    pub amount: i64,
    pub description: String,
    pub status: InvoiceStatus,
    pub qr_payload: Option<String>,
    pub message_id: Option<i64>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
