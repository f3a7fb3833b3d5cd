use crate::engine::BookingEngine;
use crate::payments::PaymentOrchestrator;
use crate::refunds::RefundTracker;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<BookingEngine>,
    pub payments: Arc<PaymentOrchestrator>,
    pub refunds: RefundTracker,
    pub env_name: String,
    pub webhook_secret: String,
}

impl AppState {
    pub fn webhooks_enabled(&self) -> bool {
        !self.webhook_secret.trim().is_empty()
    }
}
