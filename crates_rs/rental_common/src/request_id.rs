use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header::HeaderName, HeaderValue, Request};
use axum::response::Response;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use uuid::Uuid;

const MAX_REQUEST_ID_LEN: usize = 128;

/// Correlation id for one request; propagated from the caller when it sends a
/// sane value, generated otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn accept(raw: &str) -> Option<Self> {
        let s = raw.trim();
        if s.is_empty() || s.len() > MAX_REQUEST_ID_LEN {
            return None;
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
        {
            return None;
        }
        Some(Self(s.to_string()))
    }

    fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestId>()
            .cloned()
            .unwrap_or_else(|| RequestId("-".to_string())))
    }
}

#[derive(Clone)]
pub struct RequestIdLayer {
    header: HeaderName,
}

impl RequestIdLayer {
    pub fn new(header_name: HeaderName) -> Self {
        Self {
            header: header_name,
        }
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService {
            inner,
            header: self.header.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
    header: HeaderName,
}

impl<S, B> Service<Request<B>> for RequestIdService<S>
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
        let header = self.header.clone();
        let rid = req
            .headers()
            .get(&header)
            .and_then(|v| v.to_str().ok())
            .and_then(RequestId::accept)
            .unwrap_or_else(RequestId::generate);

        // Downstream handlers and the trace span read the normalized value.
        if let Ok(v) = HeaderValue::from_str(rid.as_str()) {
            req.headers_mut().insert(header.clone(), v);
        }
        req.extensions_mut().insert(rid.clone());

        let mut inner = self.inner.clone();
        Box::pin(async move {
            let mut resp = inner.call(req).await?;
            if let Ok(v) = HeaderValue::from_str(rid.as_str()) {
                resp.headers_mut().insert(header, v);
            }
            Ok(resp)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_reasonable_ids_and_rejects_garbage() {
        assert_eq!(
            RequestId::accept(" req-123 ").map(|r| r.0),
            Some("req-123".to_string())
        );
        assert!(RequestId::accept("").is_none());
        assert!(RequestId::accept("has space").is_none());
        assert!(RequestId::accept(&"a".repeat(MAX_REQUEST_ID_LEN + 1)).is_none());
    }

    #[test]
    fn generated_ids_are_simple_uuids() {
        let rid = RequestId::generate();
        assert_eq!(rid.as_str().len(), 32);
        assert!(RequestId::accept(rid.as_str()).is_some());
    }
}
