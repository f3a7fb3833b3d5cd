mod clock;
mod config;
mod db;
mod domain;
mod engine;
mod error;
mod gateway;
mod handlers;
mod housekeeping;
mod models;
mod payments;
mod pricing;
mod refunds;
mod retry;
mod signature;
mod state;
mod store;
#[cfg(test)]
mod testing;

use axum::extract::MatchedPath;
use axum::http::{header, header::HeaderName, Method, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use clock::{Clock, SystemClock};
use config::{Config, StoreBackend};
use domain::Vehicle;
use engine::{BookingEngine, BookingPolicy};
use gateway::HttpGateway;
use payments::PaymentOrchestrator;
use pricing::PricingPolicy;
use refunds::RefundTracker;
use rental_common::caller_auth::CallerAuthLayer;
use rental_common::request_id::RequestIdLayer;
use retry::RetryPolicy;
use state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use store::{BookingStore, MemoryStore, PgStore};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let store: Arc<dyn BookingStore> = match cfg.store {
        StoreBackend::Postgres => {
            let pool = match db::connect(&cfg.db_url).await {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(error = %e, "db connect failed");
                    std::process::exit(2);
                }
            };
            if let Err(e) = db::ensure_schema(&pool, &cfg.db_schema).await {
                tracing::error!(error = %e, "db ensure_schema failed");
                std::process::exit(2);
            }
            Arc::new(PgStore::new(pool, cfg.db_schema.clone()))
        }
        StoreBackend::Memory => {
            tracing::warn!("using in-memory booking store; data is lost on restart");
            let store = MemoryStore::new();
            let demo = Vehicle {
                id: "veh-demo".to_string(),
                host_id: "host-demo".to_string(),
                price_per_day_cents: 100_000,
                currency: cfg.currency.clone(),
                available: true,
            };
            if let Err(e) = store.upsert_vehicle(demo) {
                tracing::error!(error = %e, "seeding demo vehicle failed");
                std::process::exit(2);
            }
            Arc::new(store)
        }
    };

    let gateway = match HttpGateway::new(
        &cfg.gateway_base_url,
        &cfg.gateway_key_id,
        &cfg.gateway_key_secret,
        Duration::from_secs(cfg.gateway_timeout_secs),
    ) {
        Ok(g) => Arc::new(g),
        Err(e) => {
            tracing::error!(error = %e, "gateway client init failed");
            std::process::exit(2);
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let retry = RetryPolicy {
        max_attempts: cfg.gateway_max_attempts,
        base_backoff_ms: cfg.gateway_backoff_ms,
        ..RetryPolicy::default()
    };
    let refunds = RefundTracker::new(
        store.clone(),
        gateway.clone(),
        clock.clone(),
        retry,
        cfg.refund_poll_interval_secs.max(1),
    );
    let policy = BookingPolicy {
        pricing: PricingPolicy {
            fee_bps: cfg.fee_bps,
            max_rental_days: cfg.max_rental_days,
        },
        pending_timeout: chrono::Duration::seconds(cfg.pending_timeout_secs),
        cancel_cutoff: chrono::Duration::hours(cfg.cancel_cutoff_hours),
        currency: cfg.currency.clone(),
    };
    let engine = Arc::new(BookingEngine::new(
        store.clone(),
        clock.clone(),
        refunds.clone(),
        policy,
    ));
    let payments = Arc::new(PaymentOrchestrator::new(
        store,
        engine.clone(),
        refunds.clone(),
        gateway,
        clock,
        retry,
        cfg.gateway_key_id.clone(),
        cfg.gateway_key_secret.clone(),
    ));

    housekeeping::spawn_sweeper(engine.clone(), refunds.clone(), cfg.housekeeping_interval_secs);
    housekeeping::spawn_refund_poller(refunds.clone(), cfg.refund_poll_interval_secs);

    let state = AppState {
        engine,
        payments,
        refunds,
        env_name: cfg.env_name.clone(),
        webhook_secret: cfg.gateway_webhook_secret.clone(),
    };

    let internal = CallerAuthLayer::new(cfg.require_internal_secret, cfg.internal_secret.clone())
        .with_allowed_callers(cfg.internal_allowed_callers.clone());
    let origins: Vec<axum::http::HeaderValue> = cfg
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(cors_allowed_headers())
        .allow_credentials(false)
        .allow_origin(AllowOrigin::list(origins));

    let app = build_router(state, internal, cors, cfg.max_body_bytes);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));
    tracing::info!(%addr, env = ?cfg.env_kind, store = ?cfg.store, "starting rental_booking_service");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, %addr, "bind failed");
            std::process::exit(2);
        }
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}

fn build_router(
    state: AppState,
    internal: CallerAuthLayer,
    cors: CorsLayer,
    max_body_bytes: usize,
) -> Router {
    let authed = Router::new()
        .route("/vehicles/:vehicle_id/quote", post(handlers::quote))
        .route(
            "/vehicles/:vehicle_id/availability",
            get(handlers::availability),
        )
        .route("/bookings", post(handlers::create_booking))
        .route("/bookings/:booking_id", get(handlers::get_booking))
        .route(
            "/bookings/:booking_id/payment-order",
            post(handlers::create_payment_order),
        )
        .route(
            "/bookings/:booking_id/payment/verify",
            post(handlers::verify_payment),
        )
        .route(
            "/bookings/:booking_id/cancel",
            post(handlers::cancel_booking),
        )
        .route(
            "/bookings/:booking_id/complete",
            post(handlers::complete_booking),
        )
        .layer(internal);

    Router::new()
        .route("/health", get(handlers::health))
        // Authenticated by its own body signature, not the internal secret.
        .route("/webhooks/gateway", post(handlers::gateway_webhook))
        .merge(authed)
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        // Log the matched route template, never the query string.
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let path = req
                    .extensions()
                    .get::<MatchedPath>()
                    .map(MatchedPath::as_str)
                    .unwrap_or_else(|| req.uri().path());
                tracing::span!(
                    tracing::Level::INFO,
                    "http_request",
                    method = %req.method(),
                    path = %path
                )
            }),
        )
        .layer(RequestIdLayer::new(HeaderName::from_static("x-request-id")))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

fn cors_allowed_headers() -> Vec<HeaderName> {
    vec![
        header::ACCEPT,
        header::CONTENT_TYPE,
        HeaderName::from_static("x-request-id"),
        HeaderName::from_static("idempotency-key"),
    ]
}

#[cfg(test)]
mod router_tests {
    use super::*;
    use crate::domain::BookingStatus;
    use crate::signature::hmac_hex;
    use crate::testing::Harness;
    use axum::body::Body;
    use axum::http::Request;
    use rental_common::caller_auth::{Actor, Role};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const WEBHOOK_SECRET: &str = "whsec_router_test";

    fn app_with(h: &Harness, internal: CallerAuthLayer) -> Router {
        let state = AppState {
            engine: h.engine.clone(),
            payments: h.payments.clone(),
            refunds: h.refunds.clone(),
            env_name: "test".to_string(),
            webhook_secret: WEBHOOK_SECRET.to_string(),
        };
        build_router(state, internal, CorsLayer::new(), 64 * 1024)
    }

    fn app(h: &Harness) -> Router {
        app_with(h, CallerAuthLayer::new(false, None))
    }

    fn as_renter(builder: axum::http::request::Builder) -> axum::http::request::Builder {
        builder
            .header("x-actor-id", "renter-1")
            .header("x-actor-role", "renter")
    }

    fn post(uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
    }

    fn webhook(body: &Value) -> Request<Body> {
        let raw = body.to_string();
        Request::builder()
            .method("POST")
            .uri("/webhooks/gateway")
            .header("content-type", "application/json")
            .header("x-gateway-signature", hmac_hex(WEBHOOK_SECRET, raw.as_bytes()))
            .body(Body::from(raw))
            .unwrap()
    }

    async fn json_body(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_open_and_unknown_routes_are_404() {
        let h = Harness::new();
        let app = app_with(&h, CallerAuthLayer::new(true, Some("internal-test".into())));

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/does_not_exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/bookings/abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn booking_over_http_with_idempotency_and_overlap() {
        let h = Harness::new();
        let app = app(&h);
        let body = json!({
            "vehicle_id": "veh-1",
            "start_date": "2025-06-10",
            "end_date": "2025-06-13"
        });
        let request = |key: &str| {
            as_renter(post("/bookings"))
                .header("idempotency-key", key)
                .body(Body::from(body.to_string()))
                .unwrap()
        };

        let resp = app.clone().oneshot(request("k-1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = json_body(resp).await;
        assert_eq!(created["booking"]["status"], "pending");
        assert_eq!(created["quote"]["total_price_cents"], 306_000);
        assert_eq!(created["quote"]["platform_fee_cents"], 6_000);

        let resp = app.clone().oneshot(request("k-1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let replay = json_body(resp).await;
        assert_eq!(replay["booking"]["id"], created["booking"]["id"]);
        assert_eq!(replay["replayed"], true);

        let resp = app.clone().oneshot(request("k-2")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let err = json_body(resp).await;
        assert_eq!(err["detail"], "dates unavailable: [2025-06-10, 2025-06-13)");

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/vehicles/veh-1/availability?start_date=2025-06-12&end_date=2025-06-15")
                    .header("x-actor-id", "renter-2")
                    .header("x-actor-role", "renter")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let avail = json_body(resp).await;
        assert_eq!(avail["available"], false);
        assert_eq!(avail["conflicts"][0]["start"], "2025-06-10");
    }

    #[tokio::test]
    async fn bad_input_is_a_400_with_detail() {
        let h = Harness::new();
        let body = json!({"start_date": "2025-06-13", "end_date": "2025-06-10"});
        let resp = app(&h)
            .oneshot(
                as_renter(post("/vehicles/veh-1/quote"))
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let err = json_body(resp).await;
        assert_eq!(
            err["detail"],
            "invalid date range: end_date must be after start_date"
        );

        let body = json!({"start_date": "10/06/2025", "end_date": "2025-06-12"});
        let resp = app(&h)
            .oneshot(
                as_renter(post("/vehicles/veh-1/quote"))
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["detail"], "invalid date (YYYY-MM-DD)");
    }

    #[tokio::test]
    async fn webhook_requires_a_valid_signature() {
        let h = Harness::new();
        let resp = app(&h)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/gateway")
                    .header("x-gateway-signature", "00ff")
                    .body(Body::from(r#"{"event":"refund.processed","payload":{}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app(&h)
            .oneshot(webhook(&json!({
                "event": "refund.processed",
                "payload": {"refund_id": "rfnd_unknown"}
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "rejected");
        assert_eq!(h.store.anomalies().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_refund_is_visible_through_polling() {
        let h = Harness::new();
        let renter = Actor::new("renter-1", Role::Renter);
        let booking = h
            .engine
            .create(&renter, "veh-1", h.range("2025-06-10", "2025-06-13"), None)
            .await
            .expect("booking")
            .booking;
        let payment = h.capture_for(&booking).await;
        h.engine.confirm(&booking.id, &payment).await.expect("confirm");
        let app = app(&h);

        let resp = app
            .clone()
            .oneshot(
                as_renter(post(&format!("/bookings/{}/cancel", booking.id)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let cancelled = json_body(resp).await;
        assert_eq!(cancelled["booking"]["status"], "cancelled");
        assert_eq!(cancelled["refund"]["status"], "initiated");
        assert_eq!(cancelled["refund"]["poll_after_secs"], 10);
        let refund_id = cancelled["refund"]["refund_id"]
            .as_str()
            .expect("refund id")
            .to_string();

        let poll = |app: Router| {
            let uri = format!("/bookings/{}", booking.id);
            async move {
                let resp = app
                    .oneshot(as_renter(Request::builder().uri(uri)).body(Body::empty()).unwrap())
                    .await
                    .unwrap();
                assert_eq!(resp.status(), StatusCode::OK);
                json_body(resp).await
            }
        };

        let resp = app
            .clone()
            .oneshot(webhook(&json!({
                "event": "refund.processed",
                "payload": {"receipt": refund_id, "refund_id": "rfnd_gw_1"}
            })))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await["status"], "applied");
        let view = poll(app.clone()).await;
        assert_eq!(view["refund"]["status"], "processed");
        assert_eq!(view["refund"]["terminal"], false);

        let resp = app
            .clone()
            .oneshot(webhook(&json!({
                "event": "refund.completed",
                "payload": {"receipt": refund_id, "processed_at": 1_749_600_000}
            })))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await["status"], "applied");

        // A late, out-of-order delivery is absorbed.
        let resp = app
            .clone()
            .oneshot(webhook(&json!({
                "event": "refund.processed",
                "payload": {"receipt": refund_id}
            })))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await["status"], "rejected");

        let view = poll(app).await;
        assert_eq!(view["booking"]["status"], "cancelled");
        assert_eq!(view["refund"]["status"], "completed");
        assert_eq!(view["refund"]["terminal"], true);
        assert_eq!(view["refund"]["poll_after_secs"], Value::Null);
        assert_eq!(
            h.engine.get(&booking.id).await.unwrap().status,
            BookingStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn completion_is_admin_only() {
        let h = Harness::new();
        let resp = app(&h)
            .oneshot(
                as_renter(post("/bookings/any/complete"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
