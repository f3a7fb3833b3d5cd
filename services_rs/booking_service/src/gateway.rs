use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway transport error: {0}")]
    Transport(String),
    #[error("gateway returned {status}: {detail}")]
    Upstream { status: u16, detail: String },
    #[error("gateway rejected request ({status}): {detail}")]
    Rejected { status: u16, detail: String },
    #[error("gateway response invalid: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Upstream { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub receipt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayOrder {
    pub id: String,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    pub gateway_payment_id: String,
    pub amount_cents: i64,
    pub receipt: String,
}

/// Gateway-side view of a refund. `status` is the gateway's own vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRefund {
    pub id: String,
    pub status: String,
    pub processed_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync + 'static {
    async fn create_order(&self, req: &OrderRequest) -> Result<GatewayOrder, GatewayError>;

    async fn refund(&self, req: &RefundRequest) -> Result<GatewayRefund, GatewayError>;

    async fn fetch_refund(
        &self,
        gateway_payment_id: &str,
        gateway_refund_id: &str,
    ) -> Result<GatewayRefund, GatewayError>;

    /// Finds the refund the gateway holds for a payment under our `receipt`.
    async fn find_refund(
        &self,
        gateway_payment_id: &str,
        receipt: &str,
    ) -> Result<Option<GatewayRefund>, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct OrderOut {
    id: String,
    amount: i64,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct RefundOut {
    id: String,
    status: String,
    #[serde(default)]
    processed_at: Option<i64>,
    #[serde(default)]
    receipt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundListOut {
    #[serde(default)]
    items: Vec<RefundOut>,
}

impl RefundOut {
    fn into_refund(self) -> GatewayRefund {
        GatewayRefund {
            id: self.id,
            status: self.status,
            processed_at: self
                .processed_at
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
        }
    }
}

/// HTTP client for the card gateway's REST API (basic auth with the key pair).
#[derive(Clone)]
pub struct HttpGateway {
    http: Client,
    base_url: String,
    key_id: String,
    key_secret: String,
}

impl HttpGateway {
    pub fn new(
        base_url: &str,
        key_id: &str,
        key_secret: &str,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            key_id: key_id.to_string(),
            key_secret: key_secret.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        if !status.is_success() {
            let mut detail = body.clone();
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(&body) {
                if let Some(d) = v
                    .pointer("/error/description")
                    .or_else(|| v.get("detail"))
                    .and_then(|x| x.as_str())
                {
                    detail = d.to_string();
                }
            }
            let code = status.as_u16();
            if status.is_server_error() || code == 429 {
                return Err(GatewayError::Upstream {
                    status: code,
                    detail,
                });
            }
            return Err(GatewayError::Rejected {
                status: code,
                detail,
            });
        }
        serde_json::from_str(&body).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}

fn transport(e: reqwest::Error) -> GatewayError {
    GatewayError::Transport(e.to_string())
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_order(&self, req: &OrderRequest) -> Result<GatewayOrder, GatewayError> {
        let resp = self
            .http
            .post(self.url("/v1/orders"))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&serde_json::json!({
                "amount": req.amount_cents,
                "currency": req.currency,
                "receipt": req.receipt,
            }))
            .send()
            .await
            .map_err(transport)?;
        let out: OrderOut = Self::read_json(resp).await?;
        if out.amount != req.amount_cents {
            return Err(GatewayError::InvalidResponse(format!(
                "order amount {} does not match requested {}",
                out.amount, req.amount_cents
            )));
        }
        Ok(GatewayOrder {
            id: out.id,
            amount_cents: out.amount,
            currency: out.currency,
        })
    }

    async fn refund(&self, req: &RefundRequest) -> Result<GatewayRefund, GatewayError> {
        let path = format!("/v1/payments/{}/refund", req.gateway_payment_id);
        let resp = self
            .http
            .post(self.url(&path))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .header("x-idempotency-key", req.receipt.as_str())
            .json(&serde_json::json!({
                "amount": req.amount_cents,
                "receipt": req.receipt,
            }))
            .send()
            .await
            .map_err(transport)?;
        let out: RefundOut = Self::read_json(resp).await?;
        Ok(out.into_refund())
    }

    async fn fetch_refund(
        &self,
        gateway_payment_id: &str,
        gateway_refund_id: &str,
    ) -> Result<GatewayRefund, GatewayError> {
        let path = format!("/v1/payments/{gateway_payment_id}/refunds/{gateway_refund_id}");
        let resp = self
            .http
            .get(self.url(&path))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .send()
            .await
            .map_err(transport)?;
        let out: RefundOut = Self::read_json(resp).await?;
        Ok(out.into_refund())
    }

    async fn find_refund(
        &self,
        gateway_payment_id: &str,
        receipt: &str,
    ) -> Result<Option<GatewayRefund>, GatewayError> {
        let path = format!("/v1/payments/{gateway_payment_id}/refunds");
        let resp = self
            .http
            .get(self.url(&path))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .send()
            .await
            .map_err(transport)?;
        let out: RefundListOut = Self::read_json(resp).await?;
        Ok(out
            .items
            .into_iter()
            .find(|r| r.receipt.as_deref() == Some(receipt))
            .map(RefundOut::into_refund))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::testing::spawn_mock_gateway;

    fn client(base: &str) -> HttpGateway {
        HttpGateway::new(base, "key_live_1", "secret_live_1", Duration::from_secs(5))
            .expect("client")
    }

    #[tokio::test]
    async fn create_order_posts_amount_with_basic_auth() {
        let (base, mut rx) = spawn_mock_gateway(vec![(
            "200 OK",
            r#"{"id":"order_9","amount":306000,"currency":"INR","status":"created"}"#,
        )])
        .await;

        let order = client(&base)
            .create_order(&OrderRequest {
                amount_cents: 306_000,
                currency: "INR".into(),
                receipt: "bk-1".into(),
            })
            .await
            .expect("order");
        assert_eq!(order.id, "order_9");
        assert_eq!(order.amount_cents, 306_000);

        let captured = rx.recv().await.expect("captured request");
        assert_eq!(captured.method, "POST");
        assert_eq!(captured.path, "/v1/orders");
        // base64("key_live_1:secret_live_1")
        assert_eq!(
            captured.headers.get("authorization").map(String::as_str),
            Some("Basic a2V5X2xpdmVfMTpzZWNyZXRfbGl2ZV8x")
        );
        let body: serde_json::Value = serde_json::from_str(&captured.body).expect("json body");
        assert_eq!(body.get("amount").and_then(|v| v.as_i64()), Some(306_000));
        assert_eq!(body.get("currency").and_then(|v| v.as_str()), Some("INR"));
        assert_eq!(body.get("receipt").and_then(|v| v.as_str()), Some("bk-1"));
    }

    #[tokio::test]
    async fn client_errors_are_not_retryable() {
        let (base, _rx) = spawn_mock_gateway(vec![(
            "400 Bad Request",
            r#"{"error":{"description":"amount too small"}}"#,
        )])
        .await;
        let err = client(&base)
            .create_order(&OrderRequest {
                amount_cents: 1,
                currency: "INR".into(),
                receipt: "bk-2".into(),
            })
            .await
            .expect_err("rejected");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("amount too small"));
    }

    #[tokio::test]
    async fn refund_is_retried_after_a_server_error() {
        let (base, mut rx) = spawn_mock_gateway(vec![
            ("503 Service Unavailable", r#"{"detail":"busy"}"#),
            (
                "200 OK",
                r#"{"id":"rfnd_1","payment_id":"pay_1","amount":306000,"status":"pending"}"#,
            ),
        ])
        .await;
        let gw = client(&base);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        let req = RefundRequest {
            gateway_payment_id: "pay_1".into(),
            amount_cents: 306_000,
            receipt: "rf-local-1".into(),
        };
        let refund = policy
            .run("refund", || gw.refund(&req))
            .await
            .expect("refund");
        assert_eq!(refund.id, "rfnd_1");
        assert_eq!(refund.status, "pending");

        for _ in 0..2 {
            let captured = rx.recv().await.expect("captured");
            assert_eq!(captured.path, "/v1/payments/pay_1/refund");
            assert_eq!(
                captured.headers.get("x-idempotency-key").map(String::as_str),
                Some("rf-local-1")
            );
        }
    }

    #[tokio::test]
    async fn find_refund_matches_on_receipt() {
        let body = r#"{"entity":"collection","count":2,"items":[
            {"id":"rfnd_a","status":"processed","receipt":"rf-other"},
            {"id":"rfnd_b","status":"pending","receipt":"rf-local-1"}]}"#;
        let (base, mut rx) =
            spawn_mock_gateway(vec![("200 OK", body), ("200 OK", body)]).await;
        let gw = client(&base);

        let found = gw
            .find_refund("pay_1", "rf-local-1")
            .await
            .expect("lookup")
            .expect("refund on record");
        assert_eq!(found.id, "rfnd_b");
        assert_eq!(found.status, "pending");

        let missing = gw.find_refund("pay_1", "rf-local-9").await.expect("lookup");
        assert_eq!(missing, None);

        let captured = rx.recv().await.expect("captured");
        assert_eq!(captured.method, "GET");
        assert_eq!(captured.path, "/v1/payments/pay_1/refunds");
    }

    #[tokio::test]
    async fn fetch_refund_reads_status_and_processed_at() {
        let (base, mut rx) = spawn_mock_gateway(vec![(
            "200 OK",
            r#"{"id":"rfnd_1","status":"processed","processed_at":1751328000}"#,
        )])
        .await;
        let refund = client(&base)
            .fetch_refund("pay_1", "rfnd_1")
            .await
            .expect("refund");
        assert_eq!(refund.status, "processed");
        assert_eq!(
            refund.processed_at.map(|t| t.to_rfc3339()),
            Some("2025-07-01T00:00:00+00:00".to_string())
        );
        let captured = rx.recv().await.expect("captured");
        assert_eq!(captured.method, "GET");
        assert_eq!(captured.path, "/v1/payments/pay_1/refunds/rfnd_1");
    }
}
