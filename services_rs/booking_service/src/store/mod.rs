//! Persistence boundary for vehicles, bookings, payments and refund audit.
//!
//! Every state change goes through a compare-and-set method: the caller names
//! the status it expects and the store refuses the write (returning the
//! status it actually found) when another writer got there first. Booking
//! insertion re-checks overlap atomically with the write.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::domain::{
    Booking, BookingStatus, DateRange, Payment, PaymentStatus, ReconciliationAnomaly,
    RefundStatus, Vehicle,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("overlapping active booking")]
    Overlap(Vec<DateRange>),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("booking status is {0}")]
    BookingStatusMismatch(BookingStatus),
    #[error("payment status is {0}")]
    PaymentStatusMismatch(PaymentStatus),
    #[error("refund status is {0}")]
    RefundStatusMismatch(RefundStatus),
    #[error("duplicate {0}")]
    Duplicate(&'static str),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Change to the refund fields of a payment, applied only while the current
/// refund status is one of `expected`.
#[derive(Debug, Clone)]
pub struct RefundUpdate {
    pub expected: Vec<RefundStatus>,
    pub next: RefundStatus,
    pub refund_id: Option<String>,
    pub gateway_refund_id: Option<String>,
    pub amount_cents: Option<i64>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

impl RefundUpdate {
    pub fn advance(from: RefundStatus, next: RefundStatus, at: DateTime<Utc>) -> Self {
        Self {
            expected: vec![from],
            next,
            refund_id: None,
            gateway_refund_id: None,
            amount_cents: None,
            refunded_at: None,
            at,
        }
    }
}

#[async_trait]
pub trait BookingStore: Send + Sync + 'static {
    async fn get_vehicle(&self, vehicle_id: &str) -> Result<Option<Vehicle>, StoreError>;

    /// Inserts a pending booking unless an active booking of the same vehicle
    /// overlaps it. Check and insert are atomic.
    async fn insert_booking(&self, booking: &Booking) -> Result<(), StoreError>;

    async fn get_booking(&self, booking_id: &str) -> Result<Option<Booking>, StoreError>;

    async fn find_booking_by_idempotency_key(
        &self,
        renter_id: &str,
        key: &str,
    ) -> Result<Option<Booking>, StoreError>;

    async fn active_bookings_overlapping(
        &self,
        vehicle_id: &str,
        range: &DateRange,
    ) -> Result<Vec<Booking>, StoreError>;

    async fn transition_booking(
        &self,
        booking_id: &str,
        expected: &[BookingStatus],
        next: BookingStatus,
        actor_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Booking, StoreError>;

    /// `pending → confirmed`, recording the captured payment that paid for it.
    async fn confirm_booking(
        &self,
        booking_id: &str,
        payment_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Booking, StoreError>;

    /// Ids of pending bookings created before `cutoff`, optionally for one
    /// vehicle only.
    async fn stale_pending(
        &self,
        vehicle_id: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;

    /// Ids of confirmed bookings whose end date is on or before `date`.
    async fn confirmed_ended_by(&self, date: NaiveDate) -> Result<Vec<String>, StoreError>;

    async fn insert_payment(&self, payment: &Payment) -> Result<(), StoreError>;

    async fn get_payment(&self, payment_id: &str) -> Result<Option<Payment>, StoreError>;

    /// All checkout attempts of a booking, newest first.
    async fn payments_for_booking(&self, booking_id: &str) -> Result<Vec<Payment>, StoreError>;

    async fn find_payment_by_order(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<Payment>, StoreError>;

    /// Looks a payment up by local refund id or gateway refund id.
    async fn find_payment_by_refund_ref(
        &self,
        refund_ref: &str,
    ) -> Result<Option<Payment>, StoreError>;

    async fn transition_payment(
        &self,
        payment_id: &str,
        expected: PaymentStatus,
        next: PaymentStatus,
        gateway_payment_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Payment, StoreError>;

    async fn update_refund(
        &self,
        payment_id: &str,
        update: &RefundUpdate,
    ) -> Result<Payment, StoreError>;

    /// Records the gateway's refund id without touching the refund status.
    async fn set_gateway_refund_id(
        &self,
        payment_id: &str,
        gateway_refund_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Payment, StoreError>;

    /// Takes over resubmission of an initiated refund the gateway never
    /// acknowledged. Succeeds only while `updated_at` still equals `seen`, and
    /// stamps it with `at` so other pollers skip the payment.
    async fn claim_refund_submission(
        &self,
        payment_id: &str,
        seen: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Payments whose refund is initiated or processed, oldest update first.
    async fn refunds_in_flight(&self, limit: i64) -> Result<Vec<Payment>, StoreError>;

    /// Captured, unrefunded payments that did not pay for their booking: the
    /// booking was cancelled or expired, or another payment confirmed it.
    async fn orphaned_captures(&self, limit: i64) -> Result<Vec<Payment>, StoreError>;

    async fn record_anomaly(&self, anomaly: &ReconciliationAnomaly) -> Result<(), StoreError>;
}
