//! Checkout: gateway order creation, signed capture and booking confirmation.

use crate::clock::Clock;
use crate::domain::{Booking, Payment, PaymentStatus, RefundStatus};
use crate::engine::{ensure_renter_or_admin, BookingEngine};
use crate::error::EngineError;
use crate::gateway::{OrderRequest, PaymentGateway};
use crate::refunds::RefundTracker;
use crate::retry::RetryPolicy;
use crate::signature;
use crate::store::{BookingStore, StoreError};
use rental_common::caller_auth::Actor;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// What the client needs to open the gateway's checkout widget.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutOrder {
    pub payment_id: String,
    pub gateway_order_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub key_id: String,
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureOutcome {
    pub booking: Booking,
    pub payment: Payment,
    pub already_confirmed: bool,
}

pub struct PaymentOrchestrator {
    store: Arc<dyn BookingStore>,
    engine: Arc<BookingEngine>,
    refunds: RefundTracker,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    key_id: String,
    key_secret: String,
}

impl PaymentOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn BookingStore>,
        engine: Arc<BookingEngine>,
        refunds: RefundTracker,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        key_id: String,
        key_secret: String,
    ) -> Self {
        Self {
            store,
            engine,
            refunds,
            gateway,
            clock,
            retry,
            key_id,
            key_secret,
        }
    }

    fn checkout(&self, payment: &Payment, reused: bool) -> CheckoutOrder {
        CheckoutOrder {
            payment_id: payment.id.clone(),
            gateway_order_id: payment.gateway_order_id.clone(),
            amount_cents: payment.amount_cents,
            currency: payment.currency.clone(),
            key_id: self.key_id.clone(),
            reused,
        }
    }

    pub async fn create_order(
        &self,
        booking_id: &str,
        actor: &Actor,
    ) -> Result<CheckoutOrder, EngineError> {
        let booking = self.engine.get(booking_id).await?;
        ensure_renter_or_admin(&booking, actor)?;
        self.engine.ensure_fresh_pending(&booking, "pay for").await?;

        let payments = self.store.payments_for_booking(booking_id).await?;
        if payments.iter().any(|p| p.status == PaymentStatus::Captured) {
            return Err(EngineError::PaymentState(
                "booking is already paid".to_string(),
            ));
        }
        if let Some(open) = payments
            .iter()
            .find(|p| p.status == PaymentStatus::Created && p.amount_cents == booking.total_price_cents)
        {
            return Ok(self.checkout(open, true));
        }

        let req = OrderRequest {
            amount_cents: booking.total_price_cents,
            currency: booking.currency.clone(),
            receipt: booking.id.clone(),
        };
        let order = self
            .retry
            .run("create_order", || self.gateway.create_order(&req))
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, booking_id, "gateway order creation failed");
                EngineError::from(e)
            })?;
        if order.amount_cents != req.amount_cents
            || !order.currency.eq_ignore_ascii_case(&req.currency)
        {
            return Err(EngineError::GatewayRejected(format!(
                "order {} is for {} {}, expected {} {}",
                order.id, order.amount_cents, order.currency, req.amount_cents, req.currency
            )));
        }

        let now = self.clock.now();
        let payment = Payment {
            id: Uuid::new_v4().to_string(),
            booking_id: booking.id.clone(),
            gateway_order_id: order.id,
            gateway_payment_id: None,
            amount_cents: booking.total_price_cents,
            currency: booking.currency.clone(),
            status: PaymentStatus::Created,
            refund_id: None,
            gateway_refund_id: None,
            refund_status: RefundStatus::NotRequested,
            refund_amount_cents: None,
            created_at: now,
            updated_at: now,
            refunded_at: None,
        };
        self.store.insert_payment(&payment).await?;
        tracing::info!(
            booking_id,
            payment_id = %payment.id,
            gateway_order_id = %payment.gateway_order_id,
            amount_cents = payment.amount_cents,
            "payment order created"
        );
        Ok(self.checkout(&payment, false))
    }

    /// Verifies the checkout signature for `gateway_payment_id`, captures the
    /// payment and confirms the booking. Safe to call again with the same
    /// payment.
    pub async fn verify_and_capture(
        &self,
        booking_id: &str,
        actor: &Actor,
        gateway_payment_id: &str,
        gateway_signature: &str,
    ) -> Result<CaptureOutcome, EngineError> {
        let booking = self.engine.get(booking_id).await?;
        ensure_renter_or_admin(&booking, actor)?;
        let payments = self.store.payments_for_booking(booking_id).await?;

        let signed = |p: &Payment| {
            signature::verify_checkout(
                &self.key_secret,
                &p.gateway_order_id,
                gateway_payment_id,
                gateway_signature,
            )
        };

        if let Some(done) = payments.iter().find(|p| {
            p.status == PaymentStatus::Captured
                && p.gateway_payment_id.as_deref() == Some(gateway_payment_id)
        }) {
            if !signed(done) {
                return Err(EngineError::SignatureMismatch);
            }
            return self.finish_capture(done.clone()).await;
        }

        let open: Vec<&Payment> = payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Created)
            .collect();
        if let Some(matched) = open.iter().find(|&&p| signed(p)) {
            return self.capture((*matched).clone(), gateway_payment_id).await;
        }
        let Some(newest) = open.first() else {
            return Err(EngineError::PaymentState(
                "no open payment order for this booking".to_string(),
            ));
        };

        tracing::warn!(
            booking_id,
            payment_id = %newest.id,
            gateway_payment_id,
            "checkout signature mismatch"
        );
        match self
            .store
            .transition_payment(
                &newest.id,
                PaymentStatus::Created,
                PaymentStatus::Failed,
                None,
                self.clock.now(),
            )
            .await
        {
            Ok(_) | Err(StoreError::PaymentStatusMismatch(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Err(EngineError::SignatureMismatch)
    }

    async fn capture(
        &self,
        payment: Payment,
        gateway_payment_id: &str,
    ) -> Result<CaptureOutcome, EngineError> {
        match self
            .store
            .transition_payment(
                &payment.id,
                PaymentStatus::Created,
                PaymentStatus::Captured,
                Some(gateway_payment_id),
                self.clock.now(),
            )
            .await
        {
            Ok(captured) => {
                tracing::info!(
                    booking_id = %captured.booking_id,
                    payment_id = %captured.id,
                    gateway_payment_id,
                    "payment captured"
                );
                self.finish_capture(captured).await
            }
            Err(StoreError::PaymentStatusMismatch(_)) => {
                let current = self
                    .store
                    .get_payment(&payment.id)
                    .await?
                    .ok_or(EngineError::NotFound("payment"))?;
                if current.status == PaymentStatus::Captured
                    && current.gateway_payment_id.as_deref() == Some(gateway_payment_id)
                {
                    return self.finish_capture(current).await;
                }
                Err(EngineError::PaymentState(format!(
                    "payment is {}",
                    current.status
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Confirms the booking for a captured payment. Money captured for a
    /// booking that can no longer be confirmed is refunded.
    async fn finish_capture(&self, payment: Payment) -> Result<CaptureOutcome, EngineError> {
        match self.engine.confirm(&payment.booking_id, &payment).await {
            Ok((booking, already_confirmed)) => Ok(CaptureOutcome {
                booking,
                payment,
                already_confirmed,
            }),
            Err(e @ (EngineError::StaleBooking | EngineError::InvalidState { .. })) => {
                tracing::warn!(
                    error = %e,
                    booking_id = %payment.booking_id,
                    payment_id = %payment.id,
                    "captured payment cannot confirm its booking; refunding"
                );
                if let Err(re) = self.refunds.initiate_refund(&payment).await {
                    tracing::error!(error = %re, payment_id = %payment.id, "refund of unconfirmable capture failed");
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// `payment.captured` webhook. `None` when there is nothing to do.
    pub async fn capture_from_webhook(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
    ) -> Result<Option<CaptureOutcome>, EngineError> {
        let Some(payment) = self.store.find_payment_by_order(gateway_order_id).await? else {
            tracing::warn!(gateway_order_id, "capture webhook for unknown order");
            return Ok(None);
        };
        match payment.status {
            PaymentStatus::Created => self.capture(payment, gateway_payment_id).await.map(Some),
            PaymentStatus::Captured
                if payment.gateway_payment_id.as_deref() == Some(gateway_payment_id) =>
            {
                self.finish_capture(payment).await.map(Some)
            }
            PaymentStatus::Captured => {
                tracing::warn!(
                    gateway_order_id,
                    gateway_payment_id,
                    payment_id = %payment.id,
                    "order already captured under another gateway payment"
                );
                Ok(None)
            }
            PaymentStatus::Failed => {
                tracing::error!(
                    gateway_order_id,
                    gateway_payment_id,
                    payment_id = %payment.id,
                    "gateway captured a payment marked failed; needs manual review"
                );
                Ok(None)
            }
        }
    }

    /// `payment.failed` webhook: closes the open payment for the order.
    pub async fn fail_from_webhook(&self, gateway_order_id: &str) -> Result<bool, EngineError> {
        let Some(payment) = self.store.find_payment_by_order(gateway_order_id).await? else {
            return Ok(false);
        };
        match self
            .store
            .transition_payment(
                &payment.id,
                PaymentStatus::Created,
                PaymentStatus::Failed,
                None,
                self.clock.now(),
            )
            .await
        {
            Ok(_) => {
                tracing::info!(payment_id = %payment.id, gateway_order_id, "payment failed at gateway");
                Ok(true)
            }
            Err(StoreError::PaymentStatusMismatch(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
