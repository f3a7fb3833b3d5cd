use axum::body::Body;
use axum::http::{header::HeaderName, Request, StatusCode};
use axum::routing::get;
use axum::Router;
use rental_common::caller_auth::{Actor, CallerAuthLayer};
use rental_common::request_id::{RequestId, RequestIdLayer};
use tower::ServiceExt;

async fn whoami(actor: Actor) -> String {
    format!("{}:{}", actor.id, actor.role.as_str())
}

async fn echo_request_id(rid: RequestId) -> String {
    rid.0
}

async fn body_text(resp: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn app(layer: CallerAuthLayer) -> Router {
    Router::new().route("/me", get(whoami)).layer(layer)
}

#[tokio::test]
async fn not_required_trusts_identity_headers() {
    let resp = app(CallerAuthLayer::new(false, None))
        .oneshot(
            Request::builder()
                .uri("/me")
                .header("x-actor-id", "renter-7")
                .header("x-actor-role", "renter")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "renter-7:renter");
}

#[tokio::test]
async fn missing_identity_is_401_even_when_caller_is_trusted() {
    let resp = app(CallerAuthLayer::new(false, None))
        .oneshot(Request::builder().uri("/me").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn required_without_secret_is_503() {
    let resp = app(CallerAuthLayer::new(true, None))
        .oneshot(Request::builder().uri("/me").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn required_rejects_missing_or_wrong_secret() {
    let app = app(CallerAuthLayer::new(true, Some("secret".to_string())));

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/me")
                .header("x-actor-id", "admin-1")
                .header("x-actor-role", "admin")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/me")
                .header("x-internal-secret", "nope")
                .header("x-actor-id", "admin-1")
                .header("x-actor-role", "admin")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn required_with_secret_and_allowed_caller_passes_identity() {
    let app = app(
        CallerAuthLayer::new(true, Some("secret".to_string()))
            .with_allowed_callers(vec!["bff".to_string()]),
    );

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/me")
                .header("x-internal-secret", "secret")
                .header("x-internal-service-id", "scheduler")
                .header("x-actor-id", "host-3")
                .header("x-actor-role", "host")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/me")
                .header("x-internal-secret", "secret")
                .header("x-internal-service-id", "BFF")
                .header("x-actor-id", "host-3")
                .header("x-actor-role", "host")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "host-3:host");
}

#[tokio::test]
async fn request_id_is_propagated_or_generated() {
    let app = Router::new()
        .route("/rid", get(echo_request_id))
        .layer(RequestIdLayer::new(HeaderName::from_static("x-request-id")));

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/rid")
                .header("x-request-id", "abc-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        resp.headers().get("x-request-id").unwrap().to_str().unwrap(),
        "abc-123"
    );
    assert_eq!(body_text(resp).await, "abc-123");

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/rid")
                .header("x-request-id", "bad id with spaces")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let header = resp
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_ne!(header, "bad id with spaces");
    assert_eq!(header.len(), 32);
    assert_eq!(body_text(resp).await, header);
}
