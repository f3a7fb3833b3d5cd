//! Booking lifecycle: `pending → confirmed → (cancelled | completed)`, plus
//! `pending → expired` when a reservation is never paid for.

use crate::clock::Clock;
use crate::domain::{Booking, BookingStatus, DateRange, Payment, PaymentStatus, Vehicle};
use crate::error::EngineError;
use crate::pricing::{self, PricingPolicy, Quote};
use crate::refunds::{RefundTracker, RefundView};
use crate::store::{BookingStore, StoreError};
use chrono::Duration;
use rental_common::caller_auth::Actor;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BookingPolicy {
    pub pricing: PricingPolicy,
    pub pending_timeout: Duration,
    /// How long before the start of `start_date` cancellation closes.
    pub cancel_cutoff: Duration,
    /// Settlement currency; vehicles priced in anything else cannot be booked.
    pub currency: String,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            pricing: PricingPolicy::default(),
            pending_timeout: Duration::minutes(30),
            cancel_cutoff: Duration::zero(),
            currency: "INR".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Availability {
    pub vehicle_id: String,
    #[serde(flatten)]
    pub range: DateRange,
    pub available: bool,
    pub conflicts: Vec<DateRange>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedBooking {
    pub booking: Booking,
    pub quote: Quote,
    /// True when an earlier request with the same idempotency key created it.
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Cancellation {
    pub booking: Booking,
    pub refund: RefundView,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingView {
    pub booking: Booking,
    pub payment: Option<Payment>,
    pub refund: RefundView,
}

pub struct BookingEngine {
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    refunds: RefundTracker,
    policy: BookingPolicy,
}

fn quote_of(b: &Booking) -> Quote {
    Quote {
        days: b.days,
        base_price_cents: b.base_price_cents,
        platform_fee_cents: b.platform_fee_cents,
        total_price_cents: b.total_price_cents,
        currency: b.currency.clone(),
    }
}

pub(crate) fn ensure_renter_or_admin(booking: &Booking, actor: &Actor) -> Result<(), EngineError> {
    if actor.is_admin() || booking.renter_id == actor.id {
        return Ok(());
    }
    Err(EngineError::Unauthorized(
        "only the renter or an admin may do this".to_string(),
    ))
}

impl BookingEngine {
    pub fn new(
        store: Arc<dyn BookingStore>,
        clock: Arc<dyn Clock>,
        refunds: RefundTracker,
        policy: BookingPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            refunds,
            policy,
        }
    }

    pub async fn get(&self, booking_id: &str) -> Result<Booking, EngineError> {
        self.store
            .get_booking(booking_id)
            .await?
            .ok_or(EngineError::NotFound("booking"))
    }

    async fn vehicle(&self, vehicle_id: &str) -> Result<Vehicle, EngineError> {
        let vehicle = self
            .store
            .get_vehicle(vehicle_id)
            .await?
            .ok_or(EngineError::NotFound("vehicle"))?;
        if !vehicle.currency.eq_ignore_ascii_case(&self.policy.currency) {
            return Err(EngineError::Validation(format!(
                "vehicle is priced in {}; bookings settle in {}",
                vehicle.currency, self.policy.currency
            )));
        }
        Ok(vehicle)
    }

    pub async fn quote(&self, vehicle_id: &str, range: DateRange) -> Result<Quote, EngineError> {
        let vehicle = self.vehicle(vehicle_id).await?;
        pricing::compute_quote(&vehicle, &range, self.clock.today(), &self.policy.pricing)
    }

    /// Advisory read; `create` re-checks atomically.
    pub async fn check_availability(
        &self,
        vehicle_id: &str,
        range: DateRange,
    ) -> Result<Availability, EngineError> {
        pricing::validate_range(&range, self.clock.today(), self.policy.pricing.max_rental_days)?;
        let vehicle = self.vehicle(vehicle_id).await?;
        let overlapping = self
            .store
            .active_bookings_overlapping(vehicle_id, &range)
            .await?;
        // Stale reservations are released on the next create, so they do not block.
        let conflicts: Vec<DateRange> = overlapping
            .iter()
            .filter(|b| !self.is_stale(b))
            .map(Booking::range)
            .collect();
        Ok(Availability {
            vehicle_id: vehicle.id,
            range,
            available: vehicle.available && conflicts.is_empty(),
            conflicts,
        })
    }

    pub async fn create(
        &self,
        actor: &Actor,
        vehicle_id: &str,
        range: DateRange,
        idempotency_key: Option<&str>,
    ) -> Result<CreatedBooking, EngineError> {
        if let Some(key) = idempotency_key {
            if let Some(existing) = self
                .store
                .find_booking_by_idempotency_key(&actor.id, key)
                .await?
            {
                return Self::replay(existing, vehicle_id, &range);
            }
        }

        let vehicle = self.vehicle(vehicle_id).await?;
        if !vehicle.available {
            return Err(EngineError::Validation(
                "vehicle is not available for booking".to_string(),
            ));
        }
        if vehicle.host_id == actor.id {
            return Err(EngineError::Validation(
                "hosts cannot book their own vehicle".to_string(),
            ));
        }
        let quote =
            pricing::compute_quote(&vehicle, &range, self.clock.today(), &self.policy.pricing)?;

        self.release_stale(Some(vehicle_id)).await?;

        let now = self.clock.now();
        let booking = Booking {
            id: Uuid::new_v4().to_string(),
            vehicle_id: vehicle.id.clone(),
            renter_id: actor.id.clone(),
            start_date: range.start,
            end_date: range.end,
            days: quote.days,
            base_price_cents: quote.base_price_cents,
            platform_fee_cents: quote.platform_fee_cents,
            total_price_cents: quote.total_price_cents,
            currency: quote.currency.clone(),
            status: BookingStatus::Pending,
            created_at: now,
            updated_at: now,
            cancelled_by: None,
            confirmed_payment_id: None,
            idempotency_key: idempotency_key.map(ToString::to_string),
        };

        match self.store.insert_booking(&booking).await {
            Ok(()) => {
                tracing::info!(
                    booking_id = %booking.id,
                    vehicle_id = %booking.vehicle_id,
                    start_date = %booking.start_date,
                    end_date = %booking.end_date,
                    total_price_cents = booking.total_price_cents,
                    "booking created"
                );
                Ok(CreatedBooking {
                    booking,
                    quote,
                    replayed: false,
                })
            }
            Err(StoreError::Duplicate(_)) if idempotency_key.is_some() => {
                let key = idempotency_key.unwrap_or_default();
                let existing = self
                    .store
                    .find_booking_by_idempotency_key(&actor.id, key)
                    .await?
                    .ok_or_else(|| {
                        EngineError::Store("idempotency key conflict without a booking".to_string())
                    })?;
                Self::replay(existing, vehicle_id, &range)
            }
            Err(StoreError::Overlap(conflicts)) => {
                tracing::info!(vehicle_id, range = %range, "booking rejected: dates unavailable");
                Err(EngineError::Overlap { conflicts })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn replay(
        existing: Booking,
        vehicle_id: &str,
        range: &DateRange,
    ) -> Result<CreatedBooking, EngineError> {
        if existing.vehicle_id != vehicle_id || existing.range() != *range {
            return Err(EngineError::IdempotencyMismatch);
        }
        Ok(CreatedBooking {
            quote: quote_of(&existing),
            booking: existing,
            replayed: true,
        })
    }

    fn is_stale(&self, booking: &Booking) -> bool {
        booking.status == BookingStatus::Pending
            && booking.created_at < self.clock.now() - self.policy.pending_timeout
    }

    async fn expire(&self, booking_id: &str) -> Result<bool, EngineError> {
        match self
            .store
            .transition_booking(
                booking_id,
                &[BookingStatus::Pending],
                BookingStatus::Expired,
                None,
                self.clock.now(),
            )
            .await
        {
            Ok(_) => {
                tracing::info!(booking_id, "pending booking expired");
                Ok(true)
            }
            Err(StoreError::BookingStatusMismatch(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn release_stale(&self, vehicle_id: Option<&str>) -> Result<Vec<String>, EngineError> {
        let cutoff = self.clock.now() - self.policy.pending_timeout;
        let ids = self.store.stale_pending(vehicle_id, cutoff).await?;
        let mut released = Vec::with_capacity(ids.len());
        for id in ids {
            if self.expire(&id).await? {
                released.push(id);
            }
        }
        Ok(released)
    }

    /// Releases every pending booking older than the reservation timeout.
    pub async fn expire_stale(&self) -> Result<Vec<String>, EngineError> {
        self.release_stale(None).await
    }

    /// Fails with `StaleBooking` (expiring it) when the reservation timed out.
    pub async fn ensure_fresh_pending(
        &self,
        booking: &Booking,
        action: &'static str,
    ) -> Result<(), EngineError> {
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::InvalidState {
                current: booking.status,
                action,
            });
        }
        if self.is_stale(booking) {
            self.expire(&booking.id).await?;
            return Err(EngineError::StaleBooking);
        }
        Ok(())
    }

    /// Confirms a pending booking paid for by `payment`. Returns the booking
    /// and whether it had already been confirmed by this same payment.
    pub async fn confirm(
        &self,
        booking_id: &str,
        payment: &Payment,
    ) -> Result<(Booking, bool), EngineError> {
        if payment.booking_id != booking_id || payment.status != PaymentStatus::Captured {
            return Err(EngineError::PaymentState(
                "payment is not captured for this booking".to_string(),
            ));
        }

        let booking = self.get(booking_id).await?;
        if booking.status == BookingStatus::Confirmed {
            return Self::already_confirmed(booking, payment);
        }
        self.ensure_fresh_pending(&booking, "confirm").await?;

        match self
            .store
            .confirm_booking(booking_id, &payment.id, self.clock.now())
            .await
        {
            Ok(b) => {
                tracing::info!(booking_id, payment_id = %payment.id, "booking confirmed");
                Ok((b, false))
            }
            Err(StoreError::BookingStatusMismatch(BookingStatus::Confirmed)) => {
                let current = self.get(booking_id).await?;
                Self::already_confirmed(current, payment)
            }
            Err(StoreError::BookingStatusMismatch(current)) => Err(EngineError::InvalidState {
                current,
                action: "confirm",
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn already_confirmed(booking: Booking, payment: &Payment) -> Result<(Booking, bool), EngineError> {
        if booking.confirmed_payment_id.as_deref() == Some(payment.id.as_str()) {
            return Ok((booking, true));
        }
        Err(EngineError::InvalidState {
            current: booking.status,
            action: "confirm",
        })
    }

    pub async fn cancel(&self, booking_id: &str, actor: &Actor) -> Result<Cancellation, EngineError> {
        let booking = self.get(booking_id).await?;
        ensure_renter_or_admin(&booking, actor)?;
        if booking.status.is_terminal() {
            return Err(EngineError::NotCancellable(format!(
                "booking is {}",
                booking.status
            )));
        }
        let closes_at = booking.start_date.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
        if let Some(closes_at) = closes_at {
            if self.clock.now() >= closes_at - self.policy.cancel_cutoff {
                return Err(EngineError::NotCancellable(
                    "cancellation window has closed".to_string(),
                ));
            }
        }
        // A captured payment on a pending booking is about to confirm it.
        if booking.status == BookingStatus::Pending {
            let payments = self.store.payments_for_booking(booking_id).await?;
            if payments.iter().any(|p| p.status == PaymentStatus::Captured) {
                return Err(EngineError::NotCancellable(
                    "payment already captured; booking is being confirmed".to_string(),
                ));
            }
        }

        let cancelled = match self
            .store
            .transition_booking(
                booking_id,
                &BookingStatus::ACTIVE,
                BookingStatus::Cancelled,
                Some(&actor.id),
                self.clock.now(),
            )
            .await
        {
            Ok(b) => b,
            Err(StoreError::BookingStatusMismatch(current)) => {
                return Err(EngineError::NotCancellable(format!("booking is {current}")));
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            booking_id,
            actor_id = %actor.id,
            role = actor.role.as_str(),
            previous = %booking.status,
            "booking cancelled"
        );

        let payments = self.store.payments_for_booking(booking_id).await?;
        let captured = payments
            .into_iter()
            .find(|p| p.status == PaymentStatus::Captured);
        let refund = match captured {
            Some(p) => match self.refunds.initiate_refund(&p).await {
                Ok(view) => view,
                Err(e) => {
                    // The orphan sweep retries initiation for cancelled bookings.
                    tracing::error!(error = %e, booking_id, payment_id = %p.id, "refund initiation failed");
                    self.refunds.view(Some(&p))
                }
            },
            None => self.refunds.view(None),
        };

        Ok(Cancellation {
            booking: cancelled,
            refund,
        })
    }

    pub async fn complete(&self, booking_id: &str) -> Result<Booking, EngineError> {
        let booking = self.get(booking_id).await?;
        match booking.status {
            BookingStatus::Completed => return Ok(booking),
            BookingStatus::Confirmed => {}
            current => {
                return Err(EngineError::InvalidState {
                    current,
                    action: "complete",
                })
            }
        }
        if booking.end_date > self.clock.today() {
            return Err(EngineError::Validation(
                "rental has not ended yet".to_string(),
            ));
        }

        match self
            .store
            .transition_booking(
                booking_id,
                &[BookingStatus::Confirmed],
                BookingStatus::Completed,
                None,
                self.clock.now(),
            )
            .await
        {
            Ok(b) => {
                tracing::info!(booking_id, "booking completed");
                Ok(b)
            }
            Err(StoreError::BookingStatusMismatch(BookingStatus::Completed)) => {
                self.get(booking_id).await
            }
            Err(StoreError::BookingStatusMismatch(current)) => Err(EngineError::InvalidState {
                current,
                action: "complete",
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Completes every confirmed booking whose rental period is over.
    pub async fn complete_finished(&self) -> Result<Vec<String>, EngineError> {
        let ids = self.store.confirmed_ended_by(self.clock.today()).await?;
        let mut done = Vec::with_capacity(ids.len());
        for id in ids {
            match self.complete(&id).await {
                Ok(_) => done.push(id),
                Err(e) => tracing::warn!(error = %e, booking_id = %id, "auto-complete skipped"),
            }
        }
        Ok(done)
    }

    pub async fn view(&self, booking_id: &str, actor: &Actor) -> Result<BookingView, EngineError> {
        let booking = self.get(booking_id).await?;
        if ensure_renter_or_admin(&booking, actor).is_err() {
            let host = self
                .store
                .get_vehicle(&booking.vehicle_id)
                .await?
                .map(|v| v.host_id);
            if host.as_deref() != Some(actor.id.as_str()) {
                return Err(EngineError::Unauthorized(
                    "booking is not visible to this user".to_string(),
                ));
            }
        }

        let payments = self.store.payments_for_booking(booking_id).await?;
        let payment = match &booking.confirmed_payment_id {
            Some(id) => payments.iter().find(|p| &p.id == id).cloned(),
            None => None,
        }
        .or_else(|| {
            payments
                .iter()
                .find(|p| p.status == PaymentStatus::Captured)
                .cloned()
        })
        .or_else(|| payments.first().cloned());
        let refund = self.refunds.view(payment.as_ref());

        Ok(BookingView {
            booking,
            payment,
            refund,
        })
    }
}
