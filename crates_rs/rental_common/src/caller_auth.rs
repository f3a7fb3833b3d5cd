use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use subtle::ConstantTimeEq;
use tower::{Layer, Service};

pub const INTERNAL_SECRET_HEADER: &str = "x-internal-secret";
pub const INTERNAL_CALLER_HEADER: &str = "x-internal-service-id";
pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

const MAX_ACTOR_ID_LEN: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Renter,
    Host,
    Admin,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "renter" => Some(Self::Renter),
            "host" => Some(Self::Host),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Renter => "renter",
            Self::Host => "host",
            Self::Admin => "admin",
        }
    }
}

/// Identity of the end user on whose behalf the edge gateway is calling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Reads the forwarded identity headers. Returns `None` when either header
    /// is missing or malformed.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let id = headers
            .get(ACTOR_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty() && s.len() <= MAX_ACTOR_ID_LEN)
            .filter(|s| s.chars().all(|c| c.is_ascii_graphic()))?;
        let role = headers
            .get(ACTOR_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(Role::parse)?;
        Some(Self::new(id, role))
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    detail: &'a str,
}

fn reject(status: StatusCode, detail: &str) -> Response {
    (status, axum::Json(ErrorBody { detail })).into_response()
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Actor>()
            .cloned()
            .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "actor identity required"))
    }
}

/// Verifies the internal shared secret (and optionally the caller id) and, for
/// accepted requests, attaches the forwarded [`Actor`] as a request extension.
///
/// Identity headers are only honoured after the secret check passes. When the
/// layer is configured as not required (local development) they are trusted
/// as-is.
#[derive(Clone)]
pub struct CallerAuthLayer {
    required: bool,
    secret: Option<String>,
    allowed_callers: Vec<String>,
}

impl CallerAuthLayer {
    pub fn new(required: bool, secret: Option<String>) -> Self {
        Self {
            required,
            secret,
            allowed_callers: Vec::new(),
        }
    }

    pub fn with_allowed_callers(mut self, callers: Vec<String>) -> Self {
        let mut out: Vec<String> = Vec::new();
        for raw in callers {
            let caller = raw.trim().to_ascii_lowercase();
            if caller.is_empty() || out.iter().any(|c| c == &caller) {
                continue;
            }
            out.push(caller);
        }
        self.allowed_callers = out;
        self
    }
}

impl<S> Layer<S> for CallerAuthLayer {
    type Service = CallerAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CallerAuthService {
            inner,
            required: self.required,
            secret: self.secret.clone(),
            allowed_callers: self.allowed_callers.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CallerAuthService<S> {
    inner: S,
    required: bool,
    secret: Option<String>,
    allowed_callers: Vec<String>,
}

fn caller_check(
    headers: &HeaderMap,
    required: bool,
    secret: Option<&str>,
    allowed_callers: &[String],
) -> Result<(), Response> {
    if !required {
        return Ok(());
    }
    let Some(secret) = secret.map(str::trim).filter(|s| !s.is_empty()) else {
        return Err(reject(
            StatusCode::SERVICE_UNAVAILABLE,
            "internal auth not configured",
        ));
    };

    let provided = headers
        .get(INTERNAL_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");
    if provided.is_empty() || provided.as_bytes().ct_eq(secret.as_bytes()).unwrap_u8() != 1 {
        return Err(reject(StatusCode::UNAUTHORIZED, "internal auth required"));
    }

    if !allowed_callers.is_empty() {
        let caller = headers
            .get(INTERNAL_CALLER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if caller.is_empty() || !allowed_callers.iter().any(|c| c == &caller) {
            return Err(reject(
                StatusCode::UNAUTHORIZED,
                "internal caller not allowed",
            ));
        }
    }
    Ok(())
}

impl<S, B> Service<Request<B>> for CallerAuthService<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let checked = caller_check(
            req.headers(),
            self.required,
            self.secret.as_deref(),
            &self.allowed_callers,
        );
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if let Err(resp) = checked {
                return Ok(resp);
            }
            match Actor::from_headers(req.headers()) {
                Some(actor) => {
                    req.extensions_mut().insert(actor);
                }
                None => {
                    if req.headers().contains_key(ACTOR_ID_HEADER) {
                        tracing::warn!("malformed actor identity headers ignored");
                    }
                }
            }
            inner.call(req).await
        })
    }
}
