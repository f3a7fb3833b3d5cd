use crate::clock::Clock;
use crate::domain::{Payment, PaymentStatus, ReconciliationAnomaly, RefundStatus};
use crate::error::EngineError;
use crate::gateway::{GatewayError, GatewayRefund, PaymentGateway, RefundRequest};
use crate::retry::RetryPolicy;
use crate::store::{BookingStore, RefundUpdate, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

const POLL_BATCH: i64 = 100;
const ORPHAN_BATCH: i64 = 50;
/// An initiated refund the gateway never acknowledged is resubmitted after this long.
const RESUBMIT_AFTER_SECS: i64 = 300;
const MAX_CAS_ATTEMPTS: usize = 3;

/// Where an asynchronous refund status came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    Webhook,
    Poll,
    GatewayResponse,
}

impl UpdateSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Poll => "poll",
            Self::GatewayResponse => "gateway_response",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    /// The gateway may already hold this refund; look before sending.
    Resubmit,
}

/// Payment ids with a gateway submission running in this process.
#[derive(Debug, Clone, Default)]
struct Submitting(Arc<Mutex<HashSet<String>>>);

impl Submitting {
    fn begin(&self, payment_id: &str) -> Option<SubmitGuard> {
        let mut ids = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        ids.insert(payment_id.to_string()).then(|| SubmitGuard {
            ids: self.clone(),
            payment_id: payment_id.to_string(),
        })
    }

    fn contains(&self, payment_id: &str) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(payment_id)
    }
}

struct SubmitGuard {
    ids: Submitting,
    payment_id: String,
}

impl Drop for SubmitGuard {
    fn drop(&mut self) {
        self.ids
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.payment_id);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied(Payment),
    Duplicate,
    Rejected,
}

impl UpdateOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::Duplicate => "duplicate",
            Self::Rejected => "rejected",
        }
    }
}

/// Refund state as shown to polling clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefundView {
    pub refund_id: Option<String>,
    pub status: RefundStatus,
    pub amount_cents: Option<i64>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub terminal: bool,
    pub poll_after_secs: Option<u64>,
}

/// Owns the refund fields of payments: initiation, gateway submission and
/// forward-only reconciliation of asynchronous status updates.
#[derive(Clone)]
pub struct RefundTracker {
    store: Arc<dyn BookingStore>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    poll_after_secs: u64,
    submitting: Submitting,
}

impl RefundTracker {
    pub fn new(
        store: Arc<dyn BookingStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        poll_after_secs: u64,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            retry,
            poll_after_secs,
            submitting: Submitting::default(),
        }
    }

    pub fn view(&self, payment: Option<&Payment>) -> RefundView {
        let Some(p) = payment else {
            return RefundView {
                refund_id: None,
                status: RefundStatus::NotRequested,
                amount_cents: None,
                refunded_at: None,
                terminal: false,
                poll_after_secs: None,
            };
        };
        let status = p.refund_status;
        RefundView {
            refund_id: p.refund_id.clone(),
            status,
            amount_cents: p.refund_amount_cents,
            refunded_at: p.refunded_at,
            terminal: status.is_terminal(),
            poll_after_secs: status.is_in_flight().then_some(self.poll_after_secs),
        }
    }

    /// Moves a captured payment's refund to `initiated` and submits it to the
    /// gateway in the background. Returns without waiting on the gateway.
    pub async fn initiate_refund(&self, payment: &Payment) -> Result<RefundView, EngineError> {
        if payment.status != PaymentStatus::Captured {
            return Err(EngineError::PaymentState(
                "only captured payments can be refunded".to_string(),
            ));
        }
        if payment.refund_status != RefundStatus::NotRequested {
            return Ok(self.view(Some(payment)));
        }

        let mut update = RefundUpdate::advance(
            RefundStatus::NotRequested,
            RefundStatus::Initiated,
            self.clock.now(),
        );
        update.refund_id = Some(Uuid::new_v4().to_string());
        update.amount_cents = Some(payment.amount_cents);

        match self.store.update_refund(&payment.id, &update).await {
            Ok(p) => {
                tracing::info!(
                    payment_id = %p.id,
                    booking_id = %p.booking_id,
                    refund_id = p.refund_id.as_deref().unwrap_or(""),
                    amount_cents = p.amount_cents,
                    "refund initiated"
                );
                let view = self.view(Some(&p));
                self.spawn_submit(p, Attempt::First);
                Ok(view)
            }
            // Lost a race with another initiator; theirs stands.
            Err(StoreError::RefundStatusMismatch(_)) => {
                let current = self
                    .store
                    .get_payment(&payment.id)
                    .await?
                    .ok_or(EngineError::NotFound("payment"))?;
                Ok(self.view(Some(&current)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn spawn_submit(&self, payment: Payment, attempt: Attempt) {
        let Some(guard) = self.submitting.begin(&payment.id) else {
            return;
        };
        let tracker = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            tracker.submit(payment, attempt).await;
        });
    }

    async fn submit(&self, payment: Payment, attempt: Attempt) {
        let Some(gateway_payment_id) = payment.gateway_payment_id.clone() else {
            tracing::error!(payment_id = %payment.id, "captured payment has no gateway payment id");
            self.mark_failed(&payment.id, "missing gateway payment id").await;
            return;
        };
        // The local refund id doubles as the gateway idempotency key.
        let req = RefundRequest {
            gateway_payment_id,
            amount_cents: payment.refund_amount_cents.unwrap_or(payment.amount_cents),
            receipt: payment.refund_id.clone().unwrap_or_default(),
        };

        if attempt == Attempt::Resubmit {
            match self.gateway.find_refund(&req.gateway_payment_id, &req.receipt).await {
                Ok(Some(refund)) => {
                    tracing::info!(payment_id = %payment.id, refund_id = %refund.id, "gateway already holds refund");
                    self.acknowledge(&payment, refund).await;
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, payment_id = %payment.id, "refund lookup failed; resubmission deferred");
                    return;
                }
            }
        }

        let refund = match self.retry.run("refund", || self.gateway.refund(&req)).await {
            Ok(r) => r,
            Err(e) if attempt == Attempt::Resubmit => {
                self.resubmission_failed(&payment, &req, e).await;
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, payment_id = %payment.id, "gateway refund failed");
                self.mark_failed(&payment.id, "gateway refund failed").await;
                return;
            }
        };
        self.acknowledge(&payment, refund).await;
    }

    /// A failed resubmission may still have landed earlier, so the refund is
    /// only marked failed once the gateway confirms it holds nothing.
    async fn resubmission_failed(&self, payment: &Payment, req: &RefundRequest, err: GatewayError) {
        if err.is_retryable() {
            tracing::warn!(error = %err, payment_id = %payment.id, "refund resubmission failed; stays initiated");
            return;
        }
        match self.gateway.find_refund(&req.gateway_payment_id, &req.receipt).await {
            Ok(Some(refund)) => {
                tracing::info!(payment_id = %payment.id, refund_id = %refund.id, "rejected resubmission matched an existing refund");
                self.acknowledge(payment, refund).await;
            }
            Ok(None) => {
                tracing::error!(error = %err, payment_id = %payment.id, "gateway refund rejected");
                self.mark_failed(&payment.id, "gateway refund rejected").await;
            }
            Err(e) => {
                tracing::warn!(error = %e, payment_id = %payment.id, "refund lookup failed; stays initiated");
            }
        }
    }

    /// Records the gateway's refund id and applies the status it reported.
    async fn acknowledge(&self, payment: &Payment, refund: GatewayRefund) {
        if let Err(e) = self
            .store
            .set_gateway_refund_id(&payment.id, &refund.id, self.clock.now())
            .await
        {
            tracing::error!(error = %e, payment_id = %payment.id, "storing gateway refund id failed");
            return;
        }
        match RefundStatus::from_gateway(&refund.status) {
            Some(status) => {
                if let Err(e) = self
                    .record_gateway_update(
                        &refund.id,
                        status,
                        refund.processed_at,
                        UpdateSource::GatewayResponse,
                    )
                    .await
                {
                    tracing::error!(error = %e, payment_id = %payment.id, "applying gateway refund status failed");
                }
            }
            None => {
                tracing::warn!(status = %refund.status, refund_id = %refund.id, "unknown gateway refund status");
            }
        }
    }

    async fn mark_failed(&self, payment_id: &str, reason: &str) {
        let update = RefundUpdate {
            expected: vec![RefundStatus::Initiated, RefundStatus::Processed],
            ..RefundUpdate::advance(
                RefundStatus::Initiated,
                RefundStatus::Failed,
                self.clock.now(),
            )
        };
        match self.store.update_refund(payment_id, &update).await {
            Ok(_) => tracing::warn!(payment_id, reason, "refund marked failed"),
            Err(StoreError::RefundStatusMismatch(current)) => {
                tracing::info!(payment_id, current = %current, "refund already settled; not marking failed");
            }
            Err(e) => tracing::error!(error = %e, payment_id, "marking refund failed did not persist"),
        }
    }

    /// Applies an asynchronous refund status. Updates only move forward;
    /// anything else is recorded as an anomaly and absorbed.
    pub async fn record_gateway_update(
        &self,
        refund_ref: &str,
        new_status: RefundStatus,
        refunded_at: Option<DateTime<Utc>>,
        source: UpdateSource,
    ) -> Result<UpdateOutcome, EngineError> {
        let Some(mut payment) = self.store.find_payment_by_refund_ref(refund_ref).await? else {
            self.record_anomaly(None, refund_ref, None, new_status, source, "unknown refund reference")
                .await;
            return Ok(UpdateOutcome::Rejected);
        };

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = payment.refund_status;
            if current == new_status {
                return Ok(UpdateOutcome::Duplicate);
            }
            if !current.can_advance_to(new_status) {
                let detail = format!("out-of-order update {current} -> {new_status}");
                self.record_anomaly(
                    Some(&payment.id),
                    refund_ref,
                    Some(current),
                    new_status,
                    source,
                    &detail,
                )
                .await;
                return Ok(UpdateOutcome::Rejected);
            }

            let now = self.clock.now();
            let mut update = RefundUpdate::advance(current, new_status, now);
            if new_status == RefundStatus::Completed {
                update.refunded_at = Some(refunded_at.unwrap_or(now));
            }
            match self.store.update_refund(&payment.id, &update).await {
                Ok(p) => {
                    tracing::info!(
                        payment_id = %p.id,
                        from = %current,
                        to = %new_status,
                        source = source.as_str(),
                        "refund status advanced"
                    );
                    return Ok(UpdateOutcome::Applied(p));
                }
                Err(StoreError::RefundStatusMismatch(_)) => {
                    payment = self
                        .store
                        .get_payment(&payment.id)
                        .await?
                        .ok_or(EngineError::NotFound("payment"))?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Store(
            "refund update kept losing concurrent writes".to_string(),
        ))
    }

    async fn record_anomaly(
        &self,
        payment_id: Option<&str>,
        refund_ref: &str,
        current: Option<RefundStatus>,
        attempted: RefundStatus,
        source: UpdateSource,
        detail: &str,
    ) {
        tracing::warn!(
            refund_ref,
            payment_id = payment_id.unwrap_or(""),
            current = current.map(|s| s.as_str()).unwrap_or(""),
            attempted = %attempted,
            source = source.as_str(),
            detail,
            "refund update rejected"
        );
        let anomaly = ReconciliationAnomaly {
            id: Uuid::new_v4().to_string(),
            payment_id: payment_id.map(ToString::to_string),
            refund_ref: refund_ref.to_string(),
            current_status: current,
            attempted_status: attempted,
            source: source.as_str().to_string(),
            detail: detail.to_string(),
            recorded_at: self.clock.now(),
        };
        if let Err(e) = self.store.record_anomaly(&anomaly).await {
            tracing::error!(error = %e, refund_ref, "recording refund anomaly failed");
        }
    }

    /// Asks the gateway for the status of every in-flight refund and applies
    /// what it reports. Returns the number of refunds that advanced.
    pub async fn poll_in_flight(&self) -> Result<usize, EngineError> {
        let pending = self.store.refunds_in_flight(POLL_BATCH).await?;
        let now = self.clock.now();
        let mut advanced = 0;
        for payment in pending {
            let (Some(gateway_payment_id), Some(gateway_refund_id)) = (
                payment.gateway_payment_id.as_deref(),
                payment.gateway_refund_id.as_deref(),
            ) else {
                if payment.refund_status == RefundStatus::Initiated
                    && (now - payment.updated_at).num_seconds() >= RESUBMIT_AFTER_SECS
                {
                    self.resubmit_stale(payment, now).await;
                }
                continue;
            };
            let refund = match self
                .gateway
                .fetch_refund(gateway_payment_id, gateway_refund_id)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, payment_id = %payment.id, "refund status poll failed");
                    continue;
                }
            };
            let Some(status) = RefundStatus::from_gateway(&refund.status) else {
                tracing::warn!(status = %refund.status, refund_id = %refund.id, "unknown gateway refund status");
                continue;
            };
            match self
                .record_gateway_update(gateway_refund_id, status, refund.processed_at, UpdateSource::Poll)
                .await
            {
                Ok(UpdateOutcome::Applied(_)) => advanced += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, payment_id = %payment.id, "applying polled refund status failed")
                }
            }
        }
        Ok(advanced)
    }

    async fn resubmit_stale(&self, payment: Payment, now: DateTime<Utc>) {
        if self.submitting.contains(&payment.id) {
            return;
        }
        match self
            .store
            .claim_refund_submission(&payment.id, payment.updated_at, now)
            .await
        {
            Ok(true) => {
                tracing::warn!(payment_id = %payment.id, "refund never acknowledged by the gateway; resubmitting");
                self.spawn_submit(payment, Attempt::Resubmit);
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(error = %e, payment_id = %payment.id, "claiming refund resubmission failed")
            }
        }
    }

    /// Starts refunds for captured payments that ended up paying for nothing.
    pub async fn refund_orphaned_captures(&self) -> Result<usize, EngineError> {
        let orphans = self.store.orphaned_captures(ORPHAN_BATCH).await?;
        let mut started = 0;
        for payment in orphans {
            tracing::warn!(payment_id = %payment.id, booking_id = %payment.booking_id, "refunding orphaned capture");
            match self.initiate_refund(&payment).await {
                Ok(_) => started += 1,
                Err(e) => tracing::error!(error = %e, payment_id = %payment.id, "orphan refund failed"),
            }
        }
        Ok(started)
    }
}
