use super::{BookingStore, RefundUpdate, StoreError};
use crate::domain::{
    Booking, BookingStatus, DateRange, Payment, PaymentStatus, ReconciliationAnomaly,
    RefundStatus, Vehicle,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

const BOOKING_COLS: &str = "id, vehicle_id, renter_id, start_date, end_date, days, \
     base_price_cents, platform_fee_cents, total_price_cents, currency, status, \
     created_at, updated_at, cancelled_by, confirmed_payment_id, idempotency_key";

const PAYMENT_COLS: &str = "id, booking_id, gateway_order_id, gateway_payment_id, \
     amount_cents, currency, status, refund_id, gateway_refund_id, refund_status, \
     refund_amount_cents, created_at, updated_at, refunded_at";

const PG_UNIQUE_VIOLATION: &str = "23505";
const PG_EXCLUSION_VIOLATION: &str = "23P01";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    db_schema: Option<String>,
}

impl PgStore {
    pub fn new(pool: PgPool, db_schema: Option<String>) -> Self {
        Self { pool, db_schema }
    }

    fn table(&self, name: &str) -> String {
        match &self.db_schema {
            Some(s) => format!("{s}.{name}"),
            None => name.to_string(),
        }
    }
}

fn db_error(op: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        tracing::error!(error = %e, op, "db query failed");
        StoreError::Backend(format!("{op} failed"))
    }
}

fn pg_code(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

fn active_statuses() -> Vec<String> {
    BookingStatus::ACTIVE
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

fn decode(op: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        tracing::error!(error = %e, op, "db row decode failed");
        StoreError::Backend(format!("{op} decode failed"))
    }
}

fn booking_from_row(row: &PgRow) -> Result<Booking, StoreError> {
    let status: String = row.try_get("status").map_err(decode("booking"))?;
    let status = BookingStatus::parse(&status)
        .ok_or_else(|| StoreError::Backend(format!("unknown booking status {status}")))?;
    Ok(Booking {
        id: row.try_get("id").map_err(decode("booking"))?,
        vehicle_id: row.try_get("vehicle_id").map_err(decode("booking"))?,
        renter_id: row.try_get("renter_id").map_err(decode("booking"))?,
        start_date: row.try_get("start_date").map_err(decode("booking"))?,
        end_date: row.try_get("end_date").map_err(decode("booking"))?,
        days: row.try_get("days").map_err(decode("booking"))?,
        base_price_cents: row.try_get("base_price_cents").map_err(decode("booking"))?,
        platform_fee_cents: row
            .try_get("platform_fee_cents")
            .map_err(decode("booking"))?,
        total_price_cents: row.try_get("total_price_cents").map_err(decode("booking"))?,
        currency: row.try_get("currency").map_err(decode("booking"))?,
        status,
        created_at: row.try_get("created_at").map_err(decode("booking"))?,
        updated_at: row.try_get("updated_at").map_err(decode("booking"))?,
        cancelled_by: row.try_get("cancelled_by").map_err(decode("booking"))?,
        confirmed_payment_id: row
            .try_get("confirmed_payment_id")
            .map_err(decode("booking"))?,
        idempotency_key: row.try_get("idempotency_key").map_err(decode("booking"))?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment, StoreError> {
    let status: String = row.try_get("status").map_err(decode("payment"))?;
    let status = PaymentStatus::parse(&status)
        .ok_or_else(|| StoreError::Backend(format!("unknown payment status {status}")))?;
    let refund_status: String = row.try_get("refund_status").map_err(decode("payment"))?;
    let refund_status = RefundStatus::parse(&refund_status)
        .ok_or_else(|| StoreError::Backend(format!("unknown refund status {refund_status}")))?;
    Ok(Payment {
        id: row.try_get("id").map_err(decode("payment"))?,
        booking_id: row.try_get("booking_id").map_err(decode("payment"))?,
        gateway_order_id: row.try_get("gateway_order_id").map_err(decode("payment"))?,
        gateway_payment_id: row.try_get("gateway_payment_id").map_err(decode("payment"))?,
        amount_cents: row.try_get("amount_cents").map_err(decode("payment"))?,
        currency: row.try_get("currency").map_err(decode("payment"))?,
        status,
        refund_id: row.try_get("refund_id").map_err(decode("payment"))?,
        gateway_refund_id: row.try_get("gateway_refund_id").map_err(decode("payment"))?,
        refund_status,
        refund_amount_cents: row
            .try_get("refund_amount_cents")
            .map_err(decode("payment"))?,
        created_at: row.try_get("created_at").map_err(decode("payment"))?,
        updated_at: row.try_get("updated_at").map_err(decode("payment"))?,
        refunded_at: row.try_get("refunded_at").map_err(decode("payment"))?,
    })
}

impl PgStore {
    async fn current_booking_status(&self, booking_id: &str) -> Result<StoreError, StoreError> {
        let bookings = self.table("bookings");
        let row = sqlx::query(&format!("SELECT status FROM {bookings} WHERE id=$1"))
            .bind(booking_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("booking status lookup"))?;
        let Some(row) = row else {
            return Ok(StoreError::NotFound("booking"));
        };
        let status: String = row.try_get("status").map_err(decode("booking"))?;
        Ok(match BookingStatus::parse(&status) {
            Some(s) => StoreError::BookingStatusMismatch(s),
            None => StoreError::Backend(format!("unknown booking status {status}")),
        })
    }

    async fn current_payment(&self, payment_id: &str) -> Result<Payment, StoreError> {
        self.get_payment(payment_id)
            .await?
            .ok_or(StoreError::NotFound("payment"))
    }
}

#[async_trait]
impl BookingStore for PgStore {
    async fn get_vehicle(&self, vehicle_id: &str) -> Result<Option<Vehicle>, StoreError> {
        let vehicles = self.table("vehicles");
        let row = sqlx::query(&format!(
            "SELECT id, host_id, price_per_day_cents, currency, status FROM {vehicles} WHERE id=$1"
        ))
        .bind(vehicle_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get_vehicle"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status").map_err(decode("vehicle"))?;
        Ok(Some(Vehicle {
            id: row.try_get("id").map_err(decode("vehicle"))?,
            host_id: row.try_get("host_id").map_err(decode("vehicle"))?,
            price_per_day_cents: row
                .try_get("price_per_day_cents")
                .map_err(decode("vehicle"))?,
            currency: row.try_get("currency").map_err(decode("vehicle"))?,
            available: status.trim().eq_ignore_ascii_case("available"),
        }))
    }

    async fn insert_booking(&self, b: &Booking) -> Result<(), StoreError> {
        let vehicles = self.table("vehicles");
        let bookings = self.table("bookings");

        let mut tx = self.pool.begin().await.map_err(db_error("begin tx"))?;

        // Serialises concurrent creates for the same vehicle.
        let locked = sqlx::query(&format!("SELECT id FROM {vehicles} WHERE id=$1 FOR UPDATE"))
            .bind(&b.vehicle_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error("lock vehicle"))?;
        if locked.is_none() {
            return Err(StoreError::NotFound("vehicle"));
        }

        let rows = sqlx::query(&format!(
            "SELECT start_date, end_date FROM {bookings} \
             WHERE vehicle_id=$1 AND status = ANY($2) AND start_date < $3 AND $4 < end_date \
             ORDER BY start_date"
        ))
        .bind(&b.vehicle_id)
        .bind(active_statuses())
        .bind(b.end_date)
        .bind(b.start_date)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error("overlap check"))?;
        if !rows.is_empty() {
            let mut conflicts = Vec::with_capacity(rows.len());
            for row in rows {
                let start: NaiveDate = row.try_get("start_date").map_err(decode("booking"))?;
                let end: NaiveDate = row.try_get("end_date").map_err(decode("booking"))?;
                conflicts.push(DateRange::new(start, end));
            }
            return Err(StoreError::Overlap(conflicts));
        }

        let res = sqlx::query(&format!(
            "INSERT INTO {bookings} ({BOOKING_COLS}) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)"
        ))
        .bind(&b.id)
        .bind(&b.vehicle_id)
        .bind(&b.renter_id)
        .bind(b.start_date)
        .bind(b.end_date)
        .bind(b.days)
        .bind(b.base_price_cents)
        .bind(b.platform_fee_cents)
        .bind(b.total_price_cents)
        .bind(&b.currency)
        .bind(b.status.as_str())
        .bind(b.created_at)
        .bind(b.updated_at)
        .bind(&b.cancelled_by)
        .bind(&b.confirmed_payment_id)
        .bind(&b.idempotency_key)
        .execute(&mut *tx)
        .await;
        if let Err(e) = res {
            return Err(match pg_code(&e).as_deref() {
                Some(PG_EXCLUSION_VIOLATION) => StoreError::Overlap(Vec::new()),
                Some(PG_UNIQUE_VIOLATION) => StoreError::Duplicate("idempotency key"),
                _ => db_error("insert booking")(e),
            });
        }

        tx.commit().await.map_err(db_error("commit"))?;
        Ok(())
    }

    async fn get_booking(&self, booking_id: &str) -> Result<Option<Booking>, StoreError> {
        let bookings = self.table("bookings");
        let row = sqlx::query(&format!("SELECT {BOOKING_COLS} FROM {bookings} WHERE id=$1"))
            .bind(booking_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get_booking"))?;
        row.as_ref().map(booking_from_row).transpose()
    }

    async fn find_booking_by_idempotency_key(
        &self,
        renter_id: &str,
        key: &str,
    ) -> Result<Option<Booking>, StoreError> {
        let bookings = self.table("bookings");
        let row = sqlx::query(&format!(
            "SELECT {BOOKING_COLS} FROM {bookings} WHERE renter_id=$1 AND idempotency_key=$2"
        ))
        .bind(renter_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("idempotency lookup"))?;
        row.as_ref().map(booking_from_row).transpose()
    }

    async fn active_bookings_overlapping(
        &self,
        vehicle_id: &str,
        range: &DateRange,
    ) -> Result<Vec<Booking>, StoreError> {
        let bookings = self.table("bookings");
        let rows = sqlx::query(&format!(
            "SELECT {BOOKING_COLS} FROM {bookings} \
             WHERE vehicle_id=$1 AND status = ANY($2) AND start_date < $3 AND $4 < end_date \
             ORDER BY start_date"
        ))
        .bind(vehicle_id)
        .bind(active_statuses())
        .bind(range.end)
        .bind(range.start)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("availability"))?;
        rows.iter().map(booking_from_row).collect()
    }

    async fn transition_booking(
        &self,
        booking_id: &str,
        expected: &[BookingStatus],
        next: BookingStatus,
        actor_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Booking, StoreError> {
        let bookings = self.table("bookings");
        let expected: Vec<String> = expected.iter().map(|s| s.as_str().to_string()).collect();
        let cancelled_by = if next == BookingStatus::Cancelled {
            actor_id
        } else {
            None
        };
        let row = sqlx::query(&format!(
            "UPDATE {bookings} SET status=$1, updated_at=$2, cancelled_by=COALESCE($3, cancelled_by) \
             WHERE id=$4 AND status = ANY($5) RETURNING {BOOKING_COLS}"
        ))
        .bind(next.as_str())
        .bind(at)
        .bind(cancelled_by)
        .bind(booking_id)
        .bind(expected)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("transition booking"))?;
        match row {
            Some(row) => booking_from_row(&row),
            None => Err(self.current_booking_status(booking_id).await?),
        }
    }

    async fn confirm_booking(
        &self,
        booking_id: &str,
        payment_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Booking, StoreError> {
        let bookings = self.table("bookings");
        let row = sqlx::query(&format!(
            "UPDATE {bookings} SET status='confirmed', confirmed_payment_id=$1, updated_at=$2 \
             WHERE id=$3 AND status='pending' RETURNING {BOOKING_COLS}"
        ))
        .bind(payment_id)
        .bind(at)
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("confirm booking"))?;
        match row {
            Some(row) => booking_from_row(&row),
            None => Err(self.current_booking_status(booking_id).await?),
        }
    }

    async fn stale_pending(
        &self,
        vehicle_id: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let bookings = self.table("bookings");
        let rows = sqlx::query(&format!(
            "SELECT id FROM {bookings} \
             WHERE status='pending' AND created_at < $1 AND ($2::TEXT IS NULL OR vehicle_id=$2) \
             ORDER BY created_at LIMIT 500"
        ))
        .bind(cutoff)
        .bind(vehicle_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("stale pending"))?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("id").map_err(decode("booking")))
            .collect()
    }

    async fn confirmed_ended_by(&self, date: NaiveDate) -> Result<Vec<String>, StoreError> {
        let bookings = self.table("bookings");
        let rows = sqlx::query(&format!(
            "SELECT id FROM {bookings} WHERE status='confirmed' AND end_date <= $1 \
             ORDER BY end_date LIMIT 500"
        ))
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("finished bookings"))?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("id").map_err(decode("booking")))
            .collect()
    }

    async fn insert_payment(&self, p: &Payment) -> Result<(), StoreError> {
        let payments = self.table("payments");
        let res = sqlx::query(&format!(
            "INSERT INTO {payments} ({PAYMENT_COLS}) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)"
        ))
        .bind(&p.id)
        .bind(&p.booking_id)
        .bind(&p.gateway_order_id)
        .bind(&p.gateway_payment_id)
        .bind(p.amount_cents)
        .bind(&p.currency)
        .bind(p.status.as_str())
        .bind(&p.refund_id)
        .bind(&p.gateway_refund_id)
        .bind(p.refund_status.as_str())
        .bind(p.refund_amount_cents)
        .bind(p.created_at)
        .bind(p.updated_at)
        .bind(p.refunded_at)
        .execute(&self.pool)
        .await;
        match res {
            Ok(_) => Ok(()),
            Err(e) if pg_code(&e).as_deref() == Some(PG_UNIQUE_VIOLATION) => {
                Err(StoreError::Duplicate("payment"))
            }
            Err(e) => Err(db_error("insert payment")(e)),
        }
    }

    async fn get_payment(&self, payment_id: &str) -> Result<Option<Payment>, StoreError> {
        let payments = self.table("payments");
        let row = sqlx::query(&format!("SELECT {PAYMENT_COLS} FROM {payments} WHERE id=$1"))
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get_payment"))?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn payments_for_booking(&self, booking_id: &str) -> Result<Vec<Payment>, StoreError> {
        let payments = self.table("payments");
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLS} FROM {payments} WHERE booking_id=$1 \
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("payments_for_booking"))?;
        rows.iter().map(payment_from_row).collect()
    }

    async fn find_payment_by_order(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        let payments = self.table("payments");
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLS} FROM {payments} WHERE gateway_order_id=$1"
        ))
        .bind(gateway_order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("payment by order"))?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn find_payment_by_refund_ref(
        &self,
        refund_ref: &str,
    ) -> Result<Option<Payment>, StoreError> {
        let payments = self.table("payments");
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLS} FROM {payments} \
             WHERE refund_id=$1 OR gateway_refund_id=$1 LIMIT 1"
        ))
        .bind(refund_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("payment by refund"))?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn transition_payment(
        &self,
        payment_id: &str,
        expected: PaymentStatus,
        next: PaymentStatus,
        gateway_payment_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Payment, StoreError> {
        let payments = self.table("payments");
        let row = sqlx::query(&format!(
            "UPDATE {payments} SET status=$1, gateway_payment_id=COALESCE($2, gateway_payment_id), \
             updated_at=$3 WHERE id=$4 AND status=$5 RETURNING {PAYMENT_COLS}"
        ))
        .bind(next.as_str())
        .bind(gateway_payment_id)
        .bind(at)
        .bind(payment_id)
        .bind(expected.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("transition payment"))?;
        match row {
            Some(row) => payment_from_row(&row),
            None => {
                let current = self.current_payment(payment_id).await?;
                Err(StoreError::PaymentStatusMismatch(current.status))
            }
        }
    }

    async fn update_refund(
        &self,
        payment_id: &str,
        u: &RefundUpdate,
    ) -> Result<Payment, StoreError> {
        let payments = self.table("payments");
        let expected: Vec<String> = u.expected.iter().map(|s| s.as_str().to_string()).collect();
        let row = sqlx::query(&format!(
            "UPDATE {payments} SET refund_status=$1, \
             refund_id=COALESCE($2, refund_id), \
             gateway_refund_id=COALESCE($3, gateway_refund_id), \
             refund_amount_cents=COALESCE($4, refund_amount_cents), \
             refunded_at=COALESCE($5, refunded_at), \
             updated_at=$6 \
             WHERE id=$7 AND refund_status = ANY($8) RETURNING {PAYMENT_COLS}"
        ))
        .bind(u.next.as_str())
        .bind(&u.refund_id)
        .bind(&u.gateway_refund_id)
        .bind(u.amount_cents)
        .bind(u.refunded_at)
        .bind(u.at)
        .bind(payment_id)
        .bind(expected)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("update refund"))?;
        match row {
            Some(row) => payment_from_row(&row),
            None => {
                let current = self.current_payment(payment_id).await?;
                Err(StoreError::RefundStatusMismatch(current.refund_status))
            }
        }
    }

    async fn set_gateway_refund_id(
        &self,
        payment_id: &str,
        gateway_refund_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Payment, StoreError> {
        let payments = self.table("payments");
        let row = sqlx::query(&format!(
            "UPDATE {payments} SET gateway_refund_id=$1, updated_at=$2 WHERE id=$3 \
             RETURNING {PAYMENT_COLS}"
        ))
        .bind(gateway_refund_id)
        .bind(at)
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("set gateway refund id"))?;
        match row {
            Some(row) => payment_from_row(&row),
            None => Err(StoreError::NotFound("payment")),
        }
    }

    async fn claim_refund_submission(
        &self,
        payment_id: &str,
        seen: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let payments = self.table("payments");
        let res = sqlx::query(&format!(
            "UPDATE {payments} SET updated_at=$1 \
             WHERE id=$2 AND refund_status='initiated' AND gateway_refund_id IS NULL \
             AND updated_at=$3"
        ))
        .bind(at)
        .bind(payment_id)
        .bind(seen)
        .execute(&self.pool)
        .await
        .map_err(db_error("claim refund submission"))?;
        Ok(res.rows_affected() == 1)
    }

    async fn refunds_in_flight(&self, limit: i64) -> Result<Vec<Payment>, StoreError> {
        let payments = self.table("payments");
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLS} FROM {payments} \
             WHERE refund_status IN ('initiated','processed') ORDER BY updated_at LIMIT $1"
        ))
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("refunds in flight"))?;
        rows.iter().map(payment_from_row).collect()
    }

    async fn orphaned_captures(&self, limit: i64) -> Result<Vec<Payment>, StoreError> {
        let payments = self.table("payments");
        let bookings = self.table("bookings");
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLS} FROM {payments} \
             WHERE status='captured' AND refund_status='not_requested' \
             AND EXISTS (SELECT 1 FROM {bookings} b WHERE b.id = {payments}.booking_id AND (\
                 b.status IN ('cancelled','expired') \
                 OR (b.status IN ('confirmed','completed') \
                     AND b.confirmed_payment_id IS DISTINCT FROM {payments}.id))) \
             ORDER BY updated_at LIMIT $1"
        ))
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("unrefunded captures"))?;
        rows.iter().map(payment_from_row).collect()
    }

    async fn record_anomaly(&self, a: &ReconciliationAnomaly) -> Result<(), StoreError> {
        let anomalies = self.table("refund_anomalies");
        sqlx::query(&format!(
            "INSERT INTO {anomalies} \
             (id, payment_id, refund_ref, current_status, attempted_status, source, detail, recorded_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8)"
        ))
        .bind(&a.id)
        .bind(&a.payment_id)
        .bind(&a.refund_ref)
        .bind(a.current_status.map(|s| s.as_str()))
        .bind(a.attempted_status.as_str())
        .bind(&a.source)
        .bind(&a.detail)
        .bind(a.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("record anomaly"))?;
        Ok(())
    }
}
