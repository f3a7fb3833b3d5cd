//! Shared fixtures for unit tests: an in-memory engine wired to a scripted
//! gateway, plus a raw TCP server standing in for the gateway's REST API.

use crate::clock::{Clock, ManualClock};
use crate::domain::{Booking, BookingStatus, DateRange, Payment, PaymentStatus, RefundStatus, Vehicle};
use crate::engine::{BookingEngine, BookingPolicy};
use crate::gateway::{
    GatewayError, GatewayOrder, GatewayRefund, OrderRequest, PaymentGateway, RefundRequest,
};
use crate::payments::PaymentOrchestrator;
use crate::refunds::RefundTracker;
use crate::retry::RetryPolicy;
use crate::store::{BookingStore, MemoryStore, RefundUpdate};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const KEY_ID: &str = "key_test_1";
pub const KEY_SECRET: &str = "secret_test_1";
pub const START: &str = "2025-06-01T09:00:00Z";

pub fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
}

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .expect("timestamp")
        .with_timezone(&Utc)
}

pub fn captured_payment(booking_id: &str) -> Payment {
    let n = Uuid::new_v4().simple().to_string();
    Payment {
        id: Uuid::new_v4().to_string(),
        booking_id: booking_id.to_string(),
        gateway_order_id: format!("order_{n}"),
        gateway_payment_id: Some(format!("pay_{n}")),
        amount_cents: 306_000,
        currency: "INR".into(),
        status: PaymentStatus::Captured,
        refund_id: None,
        gateway_refund_id: None,
        refund_status: RefundStatus::NotRequested,
        refund_amount_cents: None,
        created_at: ts(START),
        updated_at: ts(START),
        refunded_at: None,
    }
}

#[derive(Debug, Clone)]
enum RefundMode {
    Blocked,
    Status(String),
    Failing,
    /// Rejects the submission as a duplicate of a refund it already holds.
    RejectDuplicate,
}

/// Scripted gateway. Orders always succeed unless `fail_orders` is set.
#[derive(Debug)]
pub struct FakeGateway {
    refund_mode: RefundMode,
    fetched_status: Mutex<String>,
    on_record: Mutex<Option<GatewayRefund>>,
    fail_orders: bool,
    order_calls: AtomicUsize,
    refund_calls: AtomicUsize,
}

impl FakeGateway {
    fn with_mode(refund_mode: RefundMode) -> Self {
        Self {
            refund_mode,
            fetched_status: Mutex::new("pending".to_string()),
            on_record: Mutex::new(None),
            fail_orders: false,
            order_calls: AtomicUsize::new(0),
            refund_calls: AtomicUsize::new(0),
        }
    }

    /// Refund submissions never return.
    pub fn blocked() -> Self {
        Self::with_mode(RefundMode::Blocked)
    }

    pub fn refund_status(status: &str) -> Self {
        Self::with_mode(RefundMode::Status(status.to_string()))
    }

    pub fn failing_refunds() -> Self {
        Self::with_mode(RefundMode::Failing)
    }

    pub fn rejecting_duplicates() -> Self {
        Self::with_mode(RefundMode::RejectDuplicate)
    }

    pub fn failing_orders() -> Self {
        Self {
            fail_orders: true,
            ..Self::blocked()
        }
    }

    pub fn refund_calls(&self) -> usize {
        self.refund_calls.load(Ordering::SeqCst)
    }

    pub fn order_calls(&self) -> usize {
        self.order_calls.load(Ordering::SeqCst)
    }

    pub fn set_fetched_status(&self, status: &str) {
        *self.fetched_status.lock().expect("status lock") = status.to_string();
    }

    /// Makes receipt lookups find a refund, as if an earlier submission landed.
    pub fn set_refund_on_record(&self, id: &str, status: &str) {
        *self.on_record.lock().expect("record lock") = Some(GatewayRefund {
            id: id.to_string(),
            status: status.to_string(),
            processed_at: None,
        });
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_order(&self, req: &OrderRequest) -> Result<GatewayOrder, GatewayError> {
        let n = self.order_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_orders {
            return Err(GatewayError::Upstream {
                status: 503,
                detail: "gateway down".into(),
            });
        }
        Ok(GatewayOrder {
            id: format!("order_fake_{n}"),
            amount_cents: req.amount_cents,
            currency: req.currency.clone(),
        })
    }

    async fn refund(&self, _req: &RefundRequest) -> Result<GatewayRefund, GatewayError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        match &self.refund_mode {
            RefundMode::Blocked => std::future::pending().await,
            RefundMode::Status(status) => Ok(GatewayRefund {
                id: "rfnd_fake_1".into(),
                status: status.clone(),
                processed_at: None,
            }),
            RefundMode::Failing => Err(GatewayError::Upstream {
                status: 503,
                detail: "refunds unavailable".into(),
            }),
            RefundMode::RejectDuplicate => {
                self.set_refund_on_record("rfnd_fake_1", "processed");
                Err(GatewayError::Rejected {
                    status: 400,
                    detail: "refund already requested".into(),
                })
            }
        }
    }

    async fn fetch_refund(
        &self,
        _gateway_payment_id: &str,
        gateway_refund_id: &str,
    ) -> Result<GatewayRefund, GatewayError> {
        let status = self.fetched_status.lock().expect("status lock").clone();
        Ok(GatewayRefund {
            id: gateway_refund_id.to_string(),
            status,
            processed_at: None,
        })
    }

    async fn find_refund(
        &self,
        _gateway_payment_id: &str,
        _receipt: &str,
    ) -> Result<Option<GatewayRefund>, GatewayError> {
        Ok(self.on_record.lock().expect("record lock").clone())
    }
}

/// Engine, refund tracker and checkout flow over a [`MemoryStore`] with one
/// vehicle (`veh-1`, hosted by `host-1`, 1000.00 INR a day) and a clock
/// frozen at [`START`].
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub gateway: Arc<FakeGateway>,
    pub retry: RetryPolicy,
    pub refunds: RefundTracker,
    pub engine: Arc<BookingEngine>,
    pub payments: Arc<PaymentOrchestrator>,
    seeded: AtomicU32,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_gateway(FakeGateway::blocked())
    }

    pub fn with_gateway(gateway: FakeGateway) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::at(START));
        let gateway = Arc::new(gateway);
        let retry = RetryPolicy {
            max_attempts: 3,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        let refunds = RefundTracker::new(
            store.clone(),
            gateway.clone(),
            clock.clone(),
            retry,
            10,
        );
        let engine = Arc::new(BookingEngine::new(
            store.clone(),
            clock.clone(),
            refunds.clone(),
            BookingPolicy::default(),
        ));
        let payments = Arc::new(PaymentOrchestrator::new(
            store.clone(),
            engine.clone(),
            refunds.clone(),
            gateway.clone(),
            clock.clone(),
            retry,
            KEY_ID.to_string(),
            KEY_SECRET.to_string(),
        ));
        let h = Self {
            store,
            clock,
            gateway,
            retry,
            refunds,
            engine,
            payments,
            seeded: AtomicU32::new(0),
        };
        h.add_vehicle("veh-1", "host-1", 100_000, true);
        h
    }

    pub fn add_vehicle(&self, id: &str, host_id: &str, price_per_day_cents: i64, available: bool) {
        self.store
            .upsert_vehicle(Vehicle {
                id: id.into(),
                host_id: host_id.into(),
                price_per_day_cents,
                currency: "INR".into(),
                available,
            })
            .expect("vehicle");
    }

    pub fn range(&self, start: &str, end: &str) -> DateRange {
        DateRange::new(d(start), d(end))
    }

    /// Inserts a pending booking on `veh-1` without going through the engine.
    pub async fn seed_booking(&self) -> Booking {
        let n = i64::from(self.seeded.fetch_add(1, Ordering::SeqCst));
        let start = d("2025-08-01") + chrono::Duration::days(n * 3);
        let now = self.clock.now();
        let booking = Booking {
            id: Uuid::new_v4().to_string(),
            vehicle_id: "veh-1".into(),
            renter_id: "renter-seed".into(),
            start_date: start,
            end_date: start + chrono::Duration::days(2),
            days: 2,
            base_price_cents: 200_000,
            platform_fee_cents: 4_000,
            total_price_cents: 204_000,
            currency: "INR".into(),
            status: BookingStatus::Pending,
            created_at: now,
            updated_at: now,
            cancelled_by: None,
            confirmed_payment_id: None,
            idempotency_key: None,
        };
        self.store.insert_booking(&booking).await.expect("seed booking");
        booking
    }

    pub async fn seed_captured_payment(&self) -> Payment {
        let booking = self.seed_booking().await;
        self.capture_for(&booking).await
    }

    /// Stores a captured payment for `booking` without confirming it.
    pub async fn capture_for(&self, booking: &Booking) -> Payment {
        let mut payment = captured_payment(&booking.id);
        payment.amount_cents = booking.total_price_cents;
        self.store
            .insert_payment(&payment)
            .await
            .expect("insert payment");
        payment
    }

    /// A captured payment whose refund was initiated but never reached the
    /// gateway, as left behind by a restart.
    pub async fn seed_initiated_refund(&self) -> Payment {
        let payment = self.seed_captured_payment().await;
        let mut update = RefundUpdate::advance(
            RefundStatus::NotRequested,
            RefundStatus::Initiated,
            self.clock.now(),
        );
        update.refund_id = Some(Uuid::new_v4().to_string());
        update.amount_cents = Some(payment.amount_cents);
        self.store
            .update_refund(&payment.id, &update)
            .await
            .expect("initiate refund")
    }

    /// Waits until the gateway has seen `n` refund submissions.
    pub async fn wait_for_refund_calls(&self, n: usize) {
        for _ in 0..200 {
            if self.gateway.refund_calls() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("gateway never saw {n} refund submissions");
    }

    pub async fn payment(&self, payment_id: &str) -> Payment {
        self.store
            .get_payment(payment_id)
            .await
            .expect("get payment")
            .expect("payment exists")
    }

    /// Polls until background work leaves the payment in the wanted state.
    pub async fn wait_for_payment<F>(&self, payment_id: &str, done: F) -> Payment
    where
        F: Fn(&Payment) -> bool,
    {
        for _ in 0..200 {
            let p = self.payment(payment_id).await;
            if done(&p) {
                return p;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("payment {payment_id} never reached the expected state");
    }
}

#[derive(Debug)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Serves one canned `(status line, body)` per connection, in order, and
/// forwards every request it read.
pub async fn spawn_mock_gateway(
    responses: Vec<(&str, &str)>,
) -> (String, mpsc::UnboundedReceiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (tx, rx) = mpsc::unbounded_channel();
    let responses: Vec<(String, String)> = responses
        .into_iter()
        .map(|(s, b)| (s.to_string(), b.to_string()))
        .collect();

    tokio::spawn(async move {
        for (status_line, response_body) in responses {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut buf: Vec<u8> = Vec::new();
            let mut tmp = [0u8; 2048];
            let header_end = loop {
                let n = stream.read(&mut tmp).await.expect("read");
                if n == 0 {
                    break None;
                }
                buf.extend_from_slice(&tmp[..n]);
                if let Some(i) = find_subsequence(&buf, b"\r\n\r\n") {
                    break Some(i);
                }
            };
            let Some(header_end) = header_end else {
                continue;
            };

            let header_text = String::from_utf8_lossy(&buf[..header_end]).to_string();
            let mut lines = header_text.split("\r\n");
            let mut req_parts = lines.next().unwrap_or_default().split_whitespace();
            let method = req_parts.next().unwrap_or_default().to_string();
            let path = req_parts.next().unwrap_or_default().to_string();

            let mut headers: HashMap<String, String> = HashMap::new();
            for line in lines {
                if let Some((k, v)) = line.split_once(':') {
                    headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
                }
            }
            let content_len = headers
                .get("content-length")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);

            let mut body = buf[(header_end + 4)..].to_vec();
            while body.len() < content_len {
                let n = stream.read(&mut tmp).await.expect("read body");
                if n == 0 {
                    break;
                }
                body.extend_from_slice(&tmp[..n]);
            }
            body.truncate(content_len);

            let _ = tx.send(CapturedRequest {
                method,
                path,
                headers,
                body: String::from_utf8_lossy(&body).to_string(),
            });

            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                response_body.len(),
                response_body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.flush().await;
        }
    });

    (format!("http://{addr}"), rx)
}
