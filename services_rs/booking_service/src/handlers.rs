use crate::domain::{Booking, DateRange, RefundStatus};
use crate::engine::{Availability, BookingView, Cancellation, CreatedBooking};
use crate::error::{ApiError, ApiResult, EngineError};
use crate::models::*;
use crate::payments::{CaptureOutcome, CheckoutOrder};
use crate::refunds::{UpdateOutcome, UpdateSource};
use crate::signature;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{NaiveDate, TimeZone, Utc};
use rental_common::caller_auth::Actor;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-gateway-signature";
const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

pub async fn health(State(state): State<AppState>) -> Json<HealthOut> {
    Json(HealthOut {
        status: "ok",
        env: state.env_name.clone(),
        service: "Rental Booking API",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn parse_date(raw: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request("invalid date (YYYY-MM-DD)"))
}

fn parse_range(start: &str, end: &str) -> Result<DateRange, ApiError> {
    Ok(DateRange::new(parse_date(start)?, parse_date(end)?))
}

fn idempotency_key(headers: &HeaderMap) -> Result<Option<String>, ApiError> {
    let Some(raw) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };
    let key = raw
        .to_str()
        .map_err(|_| ApiError::bad_request("invalid Idempotency-Key"))?
        .trim();
    if key.is_empty() {
        return Ok(None);
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN || !key.chars().all(|c| c.is_ascii_graphic()) {
        return Err(ApiError::bad_request("invalid Idempotency-Key"));
    }
    Ok(Some(key.to_string()))
}

fn non_empty(raw: &str, field: &str) -> Result<String, ApiError> {
    let v = raw.trim();
    if v.is_empty() || v.len() > 128 {
        return Err(ApiError::bad_request(format!("{field} required")));
    }
    Ok(v.to_string())
}

pub async fn quote(
    State(state): State<AppState>,
    Path(vehicle_id): Path<String>,
    Json(body): Json<DateRangeIn>,
) -> ApiResult<Json<QuoteOut>> {
    let range = parse_range(&body.start_date, &body.end_date)?;
    let quote = state.engine.quote(&vehicle_id, range).await?;
    Ok(Json(QuoteOut {
        vehicle_id,
        start_date: range.start.to_string(),
        end_date: range.end.to_string(),
        quote,
    }))
}

pub async fn availability(
    State(state): State<AppState>,
    Path(vehicle_id): Path<String>,
    Query(params): Query<DateRangeIn>,
) -> ApiResult<Json<Availability>> {
    let range = parse_range(&params.start_date, &params.end_date)?;
    Ok(Json(state.engine.check_availability(&vehicle_id, range).await?))
}

pub async fn create_booking(
    State(state): State<AppState>,
    actor: Actor,
    headers: HeaderMap,
    Json(body): Json<CreateBookingIn>,
) -> ApiResult<(StatusCode, Json<CreatedBooking>)> {
    let vehicle_id = non_empty(&body.vehicle_id, "vehicle_id")?;
    let range = parse_range(&body.start_date, &body.end_date)?;
    let key = idempotency_key(&headers)?;
    let created = state
        .engine
        .create(&actor, &vehicle_id, range, key.as_deref())
        .await?;
    let status = if created.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(created)))
}

pub async fn get_booking(
    State(state): State<AppState>,
    actor: Actor,
    Path(booking_id): Path<String>,
) -> ApiResult<Json<BookingView>> {
    Ok(Json(state.engine.view(&booking_id, &actor).await?))
}

pub async fn create_payment_order(
    State(state): State<AppState>,
    actor: Actor,
    Path(booking_id): Path<String>,
) -> ApiResult<Json<CheckoutOrder>> {
    Ok(Json(state.payments.create_order(&booking_id, &actor).await?))
}

pub async fn verify_payment(
    State(state): State<AppState>,
    actor: Actor,
    Path(booking_id): Path<String>,
    Json(body): Json<VerifyPaymentIn>,
) -> ApiResult<Json<CaptureOutcome>> {
    let gateway_payment_id = non_empty(&body.gateway_payment_id, "gateway_payment_id")?;
    let out = state
        .payments
        .verify_and_capture(
            &booking_id,
            &actor,
            &gateway_payment_id,
            body.gateway_signature.trim(),
        )
        .await?;
    Ok(Json(out))
}

pub async fn cancel_booking(
    State(state): State<AppState>,
    actor: Actor,
    Path(booking_id): Path<String>,
) -> ApiResult<Json<Cancellation>> {
    Ok(Json(state.engine.cancel(&booking_id, &actor).await?))
}

pub async fn complete_booking(
    State(state): State<AppState>,
    actor: Actor,
    Path(booking_id): Path<String>,
) -> ApiResult<Json<Booking>> {
    if !actor.is_admin() {
        return Err(ApiError::forbidden("admin role required"));
    }
    Ok(Json(state.engine.complete(&booking_id).await?))
}

fn webhook_ack(status: &'static str) -> Json<WebhookOut> {
    Json(WebhookOut { status })
}

/// Signed gateway callbacks. Anything we cannot apply is acknowledged with a
/// 200 so the gateway stops redelivering it.
pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookOut>> {
    if !state.webhooks_enabled() {
        return Err(ApiError::unavailable("webhooks not configured"));
    }
    let provided = headers
        .get(WEBHOOK_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !signature::verify_webhook(&state.webhook_secret, &body, provided) {
        tracing::warn!("webhook signature mismatch");
        return Err(ApiError::unauthorized("invalid webhook signature"));
    }
    let event: WebhookIn = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("invalid webhook payload"))?;
    let payload = event.payload;

    match event.event.as_str() {
        "payment.captured" => {
            let (Some(order_id), Some(payment_id)) =
                (payload.order_id.as_deref(), payload.payment_id.as_deref())
            else {
                return Err(ApiError::bad_request("order_id and payment_id required"));
            };
            match state.payments.capture_from_webhook(order_id, payment_id).await {
                Ok(Some(out)) if out.already_confirmed => Ok(webhook_ack("duplicate")),
                Ok(Some(_)) => Ok(webhook_ack("applied")),
                Ok(None) => Ok(webhook_ack("ignored")),
                Err(
                    EngineError::StaleBooking
                    | EngineError::InvalidState { .. }
                    | EngineError::PaymentState(_),
                ) => Ok(webhook_ack("rejected")),
                Err(e) => Err(e.into()),
            }
        }
        "payment.failed" => {
            let Some(order_id) = payload.order_id.as_deref() else {
                return Err(ApiError::bad_request("order_id required"));
            };
            if state.payments.fail_from_webhook(order_id).await? {
                Ok(webhook_ack("applied"))
            } else {
                Ok(webhook_ack("ignored"))
            }
        }
        name if name.starts_with("refund.") => {
            let raw_status = payload
                .status
                .as_deref()
                .unwrap_or_else(|| name.trim_start_matches("refund."));
            let Some(status) = RefundStatus::from_gateway(raw_status) else {
                tracing::warn!(event = name, status = raw_status, "unknown refund status in webhook");
                return Ok(webhook_ack("ignored"));
            };
            let refund_ref = payload
                .receipt
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .or(payload.refund_id.as_deref())
                .ok_or_else(|| ApiError::bad_request("refund_id required"))?;
            let refunded_at = payload
                .processed_at
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single());
            let outcome = state
                .refunds
                .record_gateway_update(refund_ref, status, refunded_at, UpdateSource::Webhook)
                .await?;
            if let UpdateOutcome::Applied(p) = &outcome {
                tracing::debug!(payment_id = %p.id, booking_id = %p.booking_id, "webhook refund update applied");
            }
            Ok(webhook_ack(outcome.as_str()))
        }
        other => {
            tracing::info!(event = other, "ignoring webhook event");
            Ok(webhook_ack("ignored"))
        }
    }
}
