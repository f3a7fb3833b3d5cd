use crate::pricing::Quote;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthOut {
    pub status: &'static str,
    pub env: String,
    pub service: &'static str,
    pub version: &'static str,
}

/// Calendar dates as `YYYY-MM-DD`; `end_date` is exclusive.
#[derive(Debug, Deserialize)]
pub struct DateRangeIn {
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateBookingIn {
    pub vehicle_id: String,
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Serialize)]
pub struct QuoteOut {
    pub vehicle_id: String,
    pub start_date: String,
    pub end_date: String,
    #[serde(flatten)]
    pub quote: Quote,
}

#[derive(Debug, Deserialize)]
pub struct VerifyPaymentIn {
    pub gateway_payment_id: String,
    pub gateway_signature: String,
}

/// Gateway callback envelope: `{"event": "...", "payload": {...}}`.
#[derive(Debug, Deserialize)]
pub struct WebhookIn {
    pub event: String,
    #[serde(default)]
    pub payload: WebhookPayload,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    pub order_id: Option<String>,
    pub payment_id: Option<String>,
    pub refund_id: Option<String>,
    /// Our local refund id, echoed back by the gateway.
    pub receipt: Option<String>,
    pub status: Option<String>,
    /// Unix seconds.
    pub processed_at: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct WebhookOut {
    pub status: &'static str,
}
