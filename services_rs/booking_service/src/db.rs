use sqlx::postgres::{PgPool, PgPoolOptions};

fn table_name(schema: &Option<String>, name: &str) -> String {
    match schema {
        Some(s) => format!("{s}.{name}"),
        None => name.to_string(),
    }
}

pub async fn connect(db_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(db_url)
        .await
}

pub async fn ensure_schema(pool: &PgPool, db_schema: &Option<String>) -> Result<(), sqlx::Error> {
    if let Some(schema) = db_schema {
        let ddl = format!("CREATE SCHEMA IF NOT EXISTS {schema}");
        let _ = sqlx::query(&ddl).execute(pool).await;
    }

    let vehicles = table_name(db_schema, "vehicles");
    let bookings = table_name(db_schema, "bookings");
    let payments = table_name(db_schema, "payments");
    let anomalies = table_name(db_schema, "refund_anomalies");

    // The exclusion constraint needs gist support for plain equality.
    let _ = sqlx::query("CREATE EXTENSION IF NOT EXISTS btree_gist")
        .execute(pool)
        .await;

    let ddls = [
        format!(
            "CREATE TABLE IF NOT EXISTS {vehicles} (\
             id VARCHAR(64) PRIMARY KEY,\
             host_id VARCHAR(128) NOT NULL,\
             price_per_day_cents BIGINT NOT NULL,\
             currency VARCHAR(3) NOT NULL DEFAULT 'INR',\
             status VARCHAR(16) NOT NULL DEFAULT 'available'\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {bookings} (\
             id VARCHAR(36) PRIMARY KEY,\
             vehicle_id VARCHAR(64) NOT NULL,\
             renter_id VARCHAR(128) NOT NULL,\
             start_date DATE NOT NULL,\
             end_date DATE NOT NULL,\
             days BIGINT NOT NULL,\
             base_price_cents BIGINT NOT NULL,\
             platform_fee_cents BIGINT NOT NULL,\
             total_price_cents BIGINT NOT NULL,\
             currency VARCHAR(3) NOT NULL,\
             status VARCHAR(16) NOT NULL DEFAULT 'pending',\
             created_at TIMESTAMPTZ NOT NULL,\
             updated_at TIMESTAMPTZ NOT NULL,\
             cancelled_by VARCHAR(128),\
             confirmed_payment_id VARCHAR(36),\
             idempotency_key VARCHAR(120),\
             CHECK (end_date > start_date)\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {payments} (\
             id VARCHAR(36) PRIMARY KEY,\
             booking_id VARCHAR(36) NOT NULL,\
             gateway_order_id VARCHAR(64) NOT NULL UNIQUE,\
             gateway_payment_id VARCHAR(64),\
             amount_cents BIGINT NOT NULL,\
             currency VARCHAR(3) NOT NULL,\
             status VARCHAR(16) NOT NULL DEFAULT 'created',\
             refund_id VARCHAR(36),\
             gateway_refund_id VARCHAR(64),\
             refund_status VARCHAR(16) NOT NULL DEFAULT 'not_requested',\
             refund_amount_cents BIGINT,\
             created_at TIMESTAMPTZ NOT NULL,\
             updated_at TIMESTAMPTZ NOT NULL,\
             refunded_at TIMESTAMPTZ\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {anomalies} (\
             id VARCHAR(36) PRIMARY KEY,\
             payment_id VARCHAR(36),\
             refund_ref VARCHAR(64) NOT NULL,\
             current_status VARCHAR(16),\
             attempted_status VARCHAR(16) NOT NULL,\
             source VARCHAR(32) NOT NULL,\
             detail VARCHAR(512) NOT NULL,\
             recorded_at TIMESTAMPTZ NOT NULL\
             )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_bookings_vehicle_dates \
             ON {bookings}(vehicle_id, start_date, end_date)"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_bookings_status_created ON {bookings}(status, created_at)"),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_bookings_renter_idem \
             ON {bookings}(renter_id, idempotency_key) WHERE idempotency_key IS NOT NULL"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_payments_booking ON {payments}(booking_id, created_at)"),
        format!("CREATE INDEX IF NOT EXISTS idx_payments_refund_id ON {payments}(refund_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_payments_gw_refund_id ON {payments}(gateway_refund_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_payments_refund_status ON {payments}(refund_status)"),
    ];

    for ddl in ddls {
        sqlx::query(&ddl).execute(pool).await?;
    }

    // Backstop for the locked overlap check; fails if it already exists.
    let _ = sqlx::query(&format!(
        "ALTER TABLE {bookings} ADD CONSTRAINT bookings_no_active_overlap \
         EXCLUDE USING gist (vehicle_id WITH =, daterange(start_date, end_date, '[)') WITH &&) \
         WHERE (status IN ('pending','confirmed'))"
    ))
    .execute(pool)
    .await;

    Ok(())
}
