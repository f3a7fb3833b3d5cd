use super::{BookingStore, RefundUpdate, StoreError};
use crate::domain::{
    Booking, BookingStatus, DateRange, Payment, PaymentStatus, ReconciliationAnomaly, Vehicle,
};
use crate::pricing;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    vehicles: HashMap<String, Vehicle>,
    bookings: HashMap<String, Booking>,
    // insertion order doubles as creation order
    payments: Vec<Payment>,
    anomalies: Vec<ReconciliationAnomaly>,
}

/// Process-local store for development and tests. All reads and writes take a
/// single mutex; it is never held across an `.await`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store poisoned".to_string()))
    }

    pub fn upsert_vehicle(&self, vehicle: Vehicle) -> Result<(), StoreError> {
        self.lock()?.vehicles.insert(vehicle.id.clone(), vehicle);
        Ok(())
    }

    #[cfg(test)]
    pub fn anomalies(&self) -> Result<Vec<ReconciliationAnomaly>, StoreError> {
        Ok(self.lock()?.anomalies.clone())
    }
}

fn payment_mut<'a>(inner: &'a mut Inner, payment_id: &str) -> Result<&'a mut Payment, StoreError> {
    inner
        .payments
        .iter_mut()
        .find(|p| p.id == payment_id)
        .ok_or(StoreError::NotFound("payment"))
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn get_vehicle(&self, vehicle_id: &str) -> Result<Option<Vehicle>, StoreError> {
        Ok(self.lock()?.vehicles.get(vehicle_id).cloned())
    }

    async fn insert_booking(&self, booking: &Booking) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.bookings.contains_key(&booking.id) {
            return Err(StoreError::Duplicate("booking id"));
        }
        if let Some(key) = booking.idempotency_key.as_deref() {
            let taken = inner.bookings.values().any(|b| {
                b.renter_id == booking.renter_id && b.idempotency_key.as_deref() == Some(key)
            });
            if taken {
                return Err(StoreError::Duplicate("idempotency key"));
            }
        }
        let conflicts = pricing::conflicts(
            &booking.range(),
            inner
                .bookings
                .values()
                .filter(|b| b.vehicle_id == booking.vehicle_id),
        );
        if !conflicts.is_empty() {
            return Err(StoreError::Overlap(conflicts));
        }
        inner.bookings.insert(booking.id.clone(), booking.clone());
        Ok(())
    }

    async fn get_booking(&self, booking_id: &str) -> Result<Option<Booking>, StoreError> {
        Ok(self.lock()?.bookings.get(booking_id).cloned())
    }

    async fn find_booking_by_idempotency_key(
        &self,
        renter_id: &str,
        key: &str,
    ) -> Result<Option<Booking>, StoreError> {
        Ok(self
            .lock()?
            .bookings
            .values()
            .find(|b| b.renter_id == renter_id && b.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn active_bookings_overlapping(
        &self,
        vehicle_id: &str,
        range: &DateRange,
    ) -> Result<Vec<Booking>, StoreError> {
        let inner = self.lock()?;
        let mut out: Vec<Booking> = inner
            .bookings
            .values()
            .filter(|b| b.vehicle_id == vehicle_id && b.status.is_active())
            .filter(|b| b.range().overlaps(range))
            .cloned()
            .collect();
        out.sort_by_key(|b| b.start_date);
        Ok(out)
    }

    async fn transition_booking(
        &self,
        booking_id: &str,
        expected: &[BookingStatus],
        next: BookingStatus,
        actor_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Booking, StoreError> {
        let mut inner = self.lock()?;
        let booking = inner
            .bookings
            .get_mut(booking_id)
            .ok_or(StoreError::NotFound("booking"))?;
        if !expected.contains(&booking.status) {
            return Err(StoreError::BookingStatusMismatch(booking.status));
        }
        booking.status = next;
        booking.updated_at = at;
        if next == BookingStatus::Cancelled {
            booking.cancelled_by = actor_id.map(ToString::to_string);
        }
        Ok(booking.clone())
    }

    async fn confirm_booking(
        &self,
        booking_id: &str,
        payment_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Booking, StoreError> {
        let mut inner = self.lock()?;
        let booking = inner
            .bookings
            .get_mut(booking_id)
            .ok_or(StoreError::NotFound("booking"))?;
        if booking.status != BookingStatus::Pending {
            return Err(StoreError::BookingStatusMismatch(booking.status));
        }
        booking.status = BookingStatus::Confirmed;
        booking.confirmed_payment_id = Some(payment_id.to_string());
        booking.updated_at = at;
        Ok(booking.clone())
    }

    async fn stale_pending(
        &self,
        vehicle_id: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .bookings
            .values()
            .filter(|b| b.status == BookingStatus::Pending && b.created_at < cutoff)
            .filter(|b| vehicle_id.map_or(true, |v| b.vehicle_id == v))
            .map(|b| b.id.clone())
            .collect())
    }

    async fn confirmed_ended_by(&self, date: NaiveDate) -> Result<Vec<String>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .bookings
            .values()
            .filter(|b| b.status == BookingStatus::Confirmed && b.end_date <= date)
            .map(|b| b.id.clone())
            .collect())
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if !inner.bookings.contains_key(&payment.booking_id) {
            return Err(StoreError::NotFound("booking"));
        }
        if inner
            .payments
            .iter()
            .any(|p| p.id == payment.id || p.gateway_order_id == payment.gateway_order_id)
        {
            return Err(StoreError::Duplicate("payment"));
        }
        inner.payments.push(payment.clone());
        Ok(())
    }

    async fn get_payment(&self, payment_id: &str) -> Result<Option<Payment>, StoreError> {
        Ok(self
            .lock()?
            .payments
            .iter()
            .find(|p| p.id == payment_id)
            .cloned())
    }

    async fn payments_for_booking(&self, booking_id: &str) -> Result<Vec<Payment>, StoreError> {
        Ok(self
            .lock()?
            .payments
            .iter()
            .rev()
            .filter(|p| p.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn find_payment_by_order(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        Ok(self
            .lock()?
            .payments
            .iter()
            .find(|p| p.gateway_order_id == gateway_order_id)
            .cloned())
    }

    async fn find_payment_by_refund_ref(
        &self,
        refund_ref: &str,
    ) -> Result<Option<Payment>, StoreError> {
        Ok(self
            .lock()?
            .payments
            .iter()
            .find(|p| {
                p.refund_id.as_deref() == Some(refund_ref)
                    || p.gateway_refund_id.as_deref() == Some(refund_ref)
            })
            .cloned())
    }

    async fn transition_payment(
        &self,
        payment_id: &str,
        expected: PaymentStatus,
        next: PaymentStatus,
        gateway_payment_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Payment, StoreError> {
        let mut inner = self.lock()?;
        let payment = payment_mut(&mut inner, payment_id)?;
        if payment.status != expected {
            return Err(StoreError::PaymentStatusMismatch(payment.status));
        }
        payment.status = next;
        if let Some(gp) = gateway_payment_id {
            payment.gateway_payment_id = Some(gp.to_string());
        }
        payment.updated_at = at;
        Ok(payment.clone())
    }

    async fn update_refund(
        &self,
        payment_id: &str,
        update: &RefundUpdate,
    ) -> Result<Payment, StoreError> {
        let mut inner = self.lock()?;
        let payment = payment_mut(&mut inner, payment_id)?;
        if !update.expected.contains(&payment.refund_status) {
            return Err(StoreError::RefundStatusMismatch(payment.refund_status));
        }
        payment.refund_status = update.next;
        if let Some(id) = &update.refund_id {
            payment.refund_id = Some(id.clone());
        }
        if let Some(id) = &update.gateway_refund_id {
            payment.gateway_refund_id = Some(id.clone());
        }
        if let Some(amount) = update.amount_cents {
            payment.refund_amount_cents = Some(amount);
        }
        if let Some(ts) = update.refunded_at {
            payment.refunded_at = Some(ts);
        }
        payment.updated_at = update.at;
        Ok(payment.clone())
    }

    async fn set_gateway_refund_id(
        &self,
        payment_id: &str,
        gateway_refund_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Payment, StoreError> {
        let mut inner = self.lock()?;
        let payment = payment_mut(&mut inner, payment_id)?;
        payment.gateway_refund_id = Some(gateway_refund_id.to_string());
        payment.updated_at = at;
        Ok(payment.clone())
    }

    async fn claim_refund_submission(
        &self,
        payment_id: &str,
        seen: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let payment = payment_mut(&mut inner, payment_id)?;
        if payment.refund_status != crate::domain::RefundStatus::Initiated
            || payment.gateway_refund_id.is_some()
            || payment.updated_at != seen
        {
            return Ok(false);
        }
        payment.updated_at = at;
        Ok(true)
    }

    async fn refunds_in_flight(&self, limit: i64) -> Result<Vec<Payment>, StoreError> {
        let inner = self.lock()?;
        let mut out: Vec<Payment> = inner
            .payments
            .iter()
            .filter(|p| p.refund_status.is_in_flight())
            .cloned()
            .collect();
        out.sort_by_key(|p| p.updated_at);
        out.truncate(usize::try_from(limit.max(0)).unwrap_or(0));
        Ok(out)
    }

    async fn orphaned_captures(&self, limit: i64) -> Result<Vec<Payment>, StoreError> {
        let inner = self.lock()?;
        let mut out: Vec<Payment> = inner
            .payments
            .iter()
            .filter(|p| {
                p.status == PaymentStatus::Captured
                    && p.refund_status == crate::domain::RefundStatus::NotRequested
            })
            .filter(|p| {
                inner.bookings.get(&p.booking_id).is_some_and(|b| match b.status {
                    BookingStatus::Cancelled | BookingStatus::Expired => true,
                    BookingStatus::Confirmed | BookingStatus::Completed => {
                        b.confirmed_payment_id.as_deref() != Some(p.id.as_str())
                    }
                    BookingStatus::Pending => false,
                })
            })
            .cloned()
            .collect();
        out.truncate(usize::try_from(limit.max(0)).unwrap_or(0));
        Ok(out)
    }

    async fn record_anomaly(&self, anomaly: &ReconciliationAnomaly) -> Result<(), StoreError> {
        self.lock()?.anomalies.push(anomaly.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RefundStatus;
    use std::sync::Arc;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn booking(id: &str, start: &str, end: &str) -> Booking {
        let now = Utc::now();
        Booking {
            id: id.to_string(),
            vehicle_id: "veh-1".into(),
            renter_id: "renter-1".into(),
            start_date: d(start),
            end_date: d(end),
            days: 1,
            base_price_cents: 100,
            platform_fee_cents: 2,
            total_price_cents: 102,
            currency: "INR".into(),
            status: BookingStatus::Pending,
            created_at: now,
            updated_at: now,
            cancelled_by: None,
            confirmed_payment_id: None,
            idempotency_key: None,
        }
    }

    fn payment(id: &str, booking_id: &str) -> Payment {
        let now = Utc::now();
        Payment {
            id: id.to_string(),
            booking_id: booking_id.to_string(),
            gateway_order_id: format!("order_{id}"),
            gateway_payment_id: None,
            amount_cents: 102,
            currency: "INR".into(),
            status: PaymentStatus::Created,
            refund_id: None,
            gateway_refund_id: None,
            refund_status: RefundStatus::NotRequested,
            refund_amount_cents: None,
            created_at: now,
            updated_at: now,
            refunded_at: None,
        }
    }

    #[tokio::test]
    async fn insert_rejects_overlap_but_allows_back_to_back() {
        let store = MemoryStore::new();
        store
            .insert_booking(&booking("a", "2025-06-01", "2025-06-03"))
            .await
            .unwrap();
        let err = store
            .insert_booking(&booking("b", "2025-06-02", "2025-06-04"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Overlap(ref c) if c.len() == 1));
        store
            .insert_booking(&booking("c", "2025-06-03", "2025-06-05"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn released_bookings_no_longer_block() {
        let store = MemoryStore::new();
        store
            .insert_booking(&booking("a", "2025-06-01", "2025-06-03"))
            .await
            .unwrap();
        store
            .transition_booking(
                "a",
                &[BookingStatus::Pending],
                BookingStatus::Expired,
                None,
                Utc::now(),
            )
            .await
            .unwrap();
        store
            .insert_booking(&booking("b", "2025-06-01", "2025-06-03"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn transitions_are_compare_and_set() {
        let store = MemoryStore::new();
        store
            .insert_booking(&booking("a", "2025-06-01", "2025-06-03"))
            .await
            .unwrap();
        let b = store
            .transition_booking(
                "a",
                &BookingStatus::ACTIVE,
                BookingStatus::Cancelled,
                Some("renter-1"),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(b.cancelled_by.as_deref(), Some("renter-1"));

        let err = store
            .transition_booking(
                "a",
                &[BookingStatus::Pending],
                BookingStatus::Confirmed,
                None,
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::BookingStatusMismatch(BookingStatus::Cancelled)
        ));
    }

    #[tokio::test]
    async fn payments_are_listed_newest_first_and_found_by_refund_ref() {
        let store = MemoryStore::new();
        store
            .insert_booking(&booking("a", "2025-06-01", "2025-06-03"))
            .await
            .unwrap();
        store.insert_payment(&payment("p1", "a")).await.unwrap();
        store.insert_payment(&payment("p2", "a")).await.unwrap();
        let ids: Vec<String> = store
            .payments_for_booking("a")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["p2", "p1"]);

        let mut update =
            RefundUpdate::advance(RefundStatus::NotRequested, RefundStatus::Initiated, Utc::now());
        update.refund_id = Some("rf-1".into());
        store.update_refund("p1", &update).await.unwrap();
        store
            .set_gateway_refund_id("p1", "rfnd_9", Utc::now())
            .await
            .unwrap();

        for r in ["rf-1", "rfnd_9"] {
            let found = store.find_payment_by_refund_ref(r).await.unwrap();
            assert_eq!(found.map(|p| p.id), Some("p1".to_string()));
        }
        let err = store.update_refund("p1", &update).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::RefundStatusMismatch(RefundStatus::Initiated)
        ));
    }

    #[tokio::test]
    async fn concurrent_inserts_admit_exactly_one() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert_booking(&booking(&format!("b{i}"), "2025-06-01", "2025-06-04"))
                    .await
                    .is_ok()
            }));
        }
        let mut ok = 0;
        for h in handles {
            if h.await.unwrap() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
    }
}
