use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Topup,
    Plan,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Topup => "topup",
            OrderKind::Plan => "plan",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        if raw == "plan" { OrderKind::Plan } else { OrderKind::Topup }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw {
            "paid" => OrderStatus::Paid,
            "failed" => OrderStatus::Failed,
            _ => OrderStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub plan_id: Option<i64>,
    pub amount_minor: i64,
    pub currency: String,
    pub kind: OrderKind,
    pub status: OrderStatus,
    pub protocol: Option<String>,
    pub server_id: Option<i64>,
    pub payment_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: i64,
    pub plan_id: Option<i64>,
    pub amount_minor: i64,
    pub currency: String,
    pub kind: OrderKind,
    pub protocol: Option<String>,
    pub server_id: Option<i64>,
    pub payment_code: Option<String>,
}

impl NewOrder {
    pub fn meta(&self) -> Value {
        serde_json::json!({
            "type": self.kind.as_str(),
            "protocol": self.protocol,
            "server_id": self.server_id,
            "code": self.payment_code,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewProof {
    pub file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<i64>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proof {
    pub order_id: i64,
    pub file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

impl Proof {
    /// Unknown mime types are sent as photos, the most common upload.
    pub fn is_image(&self) -> bool {
        match &self.mime_type {
            Some(mime) => mime.to_ascii_lowercase().starts_with("image/") || mime.is_empty(),
            None => true,
        }
    }
}

/// One row of the customer-facing payment history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: i64,
    pub amount_minor: i64,
    pub currency: String,
    pub kind: OrderKind,
    pub status: OrderStatus,
    pub updated_at: DateTime<Utc>,
    pub proof_file_id: Option<String>,
    pub proof_mime: Option<String>,
}
