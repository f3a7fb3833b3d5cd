//! Rental duration, price breakdown and date-range overlap.

use crate::domain::{Booking, DateRange, Vehicle};
use crate::error::EngineError;
use chrono::NaiveDate;
use serde::Serialize;

const BPS_DENOMINATOR: i128 = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct PricingPolicy {
    pub fee_bps: i64,
    pub max_rental_days: i64,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            fee_bps: 200,
            max_rental_days: 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub days: i64,
    pub base_price_cents: i64,
    pub platform_fee_cents: i64,
    pub total_price_cents: i64,
    pub currency: String,
}

/// Platform fee in minor units, rounded half-up.
pub fn platform_fee(base_cents: i64, fee_bps: i64) -> Option<i64> {
    let scaled = i128::from(base_cents) * i128::from(fee_bps);
    let fee = (scaled + BPS_DENOMINATOR / 2) / BPS_DENOMINATOR;
    i64::try_from(fee).ok()
}

pub fn ranges_overlap(a: &DateRange, b: &DateRange) -> bool {
    a.overlaps(b)
}

pub fn validate_range(range: &DateRange, today: NaiveDate, max_days: i64) -> Result<(), EngineError> {
    if range.end <= range.start {
        return Err(EngineError::InvalidRange(
            "end_date must be after start_date".to_string(),
        ));
    }
    if range.start < today {
        return Err(EngineError::InvalidRange(
            "start_date must not be in the past".to_string(),
        ));
    }
    if max_days > 0 && range.days() > max_days {
        return Err(EngineError::InvalidRange(format!(
            "rental length must not exceed {max_days} days"
        )));
    }
    Ok(())
}

pub fn compute_quote(
    vehicle: &Vehicle,
    range: &DateRange,
    today: NaiveDate,
    policy: &PricingPolicy,
) -> Result<Quote, EngineError> {
    validate_range(range, today, policy.max_rental_days)?;
    if vehicle.price_per_day_cents <= 0 {
        return Err(EngineError::Validation(
            "vehicle has no valid daily price".to_string(),
        ));
    }

    let days = range.days();
    let base = days
        .checked_mul(vehicle.price_per_day_cents)
        .ok_or_else(|| EngineError::Validation("price overflow".to_string()))?;
    let fee = platform_fee(base, policy.fee_bps)
        .ok_or_else(|| EngineError::Validation("price overflow".to_string()))?;
    let total = base
        .checked_add(fee)
        .ok_or_else(|| EngineError::Validation("price overflow".to_string()))?;

    Ok(Quote {
        days,
        base_price_cents: base,
        platform_fee_cents: fee,
        total_price_cents: total,
        currency: vehicle.currency.clone(),
    })
}

/// Ranges of the active bookings in `existing` that collide with `range`.
pub fn conflicts<'a, I>(range: &DateRange, existing: I) -> Vec<DateRange>
where
    I: IntoIterator<Item = &'a Booking>,
{
    existing
        .into_iter()
        .filter(|b| b.status.is_active())
        .map(Booking::range)
        .filter(|r| ranges_overlap(r, range))
        .collect()
}
