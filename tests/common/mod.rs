//! Shared harness: an in-memory SQLite database, a scriptable mock
//! gateway, and the full service stack plus HTTP router wired together.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use http::HeaderMap;
use rust_decimal::Decimal;
use sea_orm::ActiveValue::Set;
use sea_orm::{ActiveModelTrait, ConnectOptions, Database};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use checkout_api::config::AppConfig;
use checkout_api::db::{ensure_schema, DbPool};
use checkout_api::entities::coupon::{self, CouponKind, CouponStatus};
use checkout_api::entities::order::PaymentProvider;
use checkout_api::entities::refund::RefundStatus;
use checkout_api::entities::tax_rate;
use checkout_api::errors::ServiceError;
use checkout_api::events::{Event, EventSender};
use checkout_api::gateway::{
    ClientHandle, CreateIntent, GatewayEvent, GatewayEventKind, GatewayRefund, GatewayRegistry,
    IntentStatus, PaymentGateway, PaymentIntent,
};
use checkout_api::services::orders::{
    CreateOrderRequest, OrderItemRequest, OrderResponse, OrderService,
};
use checkout_api::services::webhooks::WebhookService;
use checkout_api::{api_v1_routes, AppState};

/// What the mock gateway should answer for a given call.
#[derive(Clone, Debug)]
pub enum GatewayScript {
    /// An intent in the given provider-side state
    Intent(IntentStatus),
    /// A card decline
    Decline(&'static str),
    /// Transport failure after exhausting retries
    Transport,
}

/// In-process stand-in for a payment provider. Every behavior is set per
/// test and every call is counted, so tests can assert both outcomes and
/// that no-op paths really skip the network.
pub struct MockGateway {
    create_script: Mutex<GatewayScript>,
    confirm_script: Mutex<GatewayScript>,
    refund_transport_failure: AtomicBool,
    webhook_event: Mutex<Option<GatewayEvent>>,
    webhook_bad_signature: AtomicBool,
    pub create_calls: AtomicUsize,
    pub confirm_calls: AtomicUsize,
    pub refund_calls: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            create_script: Mutex::new(GatewayScript::Intent(IntentStatus::Pending)),
            confirm_script: Mutex::new(GatewayScript::Intent(IntentStatus::Succeeded)),
            refund_transport_failure: AtomicBool::new(false),
            webhook_event: Mutex::new(None),
            webhook_bad_signature: AtomicBool::new(false),
            create_calls: AtomicUsize::new(0),
            confirm_calls: AtomicUsize::new(0),
            refund_calls: AtomicUsize::new(0),
        }
    }

    pub fn script_create(&self, script: GatewayScript) {
        *self.create_script.lock().unwrap() = script;
    }

    pub fn script_confirm(&self, script: GatewayScript) {
        *self.confirm_script.lock().unwrap() = script;
    }

    pub fn fail_refunds(&self, fail: bool) {
        self.refund_transport_failure.store(fail, Ordering::SeqCst);
    }

    /// The event `verify_webhook` will report for the next deliveries.
    pub fn script_webhook(&self, kind: GatewayEventKind, provider_intent_id: Option<&str>) {
        *self.webhook_event.lock().unwrap() = Some(GatewayEvent {
            event_id: Some(format!("evt_{}", Uuid::new_v4().simple())),
            provider_intent_id: provider_intent_id.map(str::to_string),
            kind,
            raw: json!({"type": "mock.event"}),
        });
    }

    pub fn reject_webhook_signatures(&self, reject: bool) {
        self.webhook_bad_signature.store(reject, Ordering::SeqCst);
    }

    pub fn confirm_count(&self) -> usize {
        self.confirm_calls.load(Ordering::SeqCst)
    }

    pub fn refund_count(&self) -> usize {
        self.refund_calls.load(Ordering::SeqCst)
    }

    fn run_script(
        script: &GatewayScript,
        provider_intent_id: String,
    ) -> Result<PaymentIntent, ServiceError> {
        match script {
            GatewayScript::Intent(status) => {
                let failure_reason = match status {
                    IntentStatus::Declined => Some("card_declined".to_string()),
                    _ => None,
                };
                Ok(PaymentIntent {
                    provider_intent_id: provider_intent_id.clone(),
                    status: *status,
                    client_handle: Some(ClientHandle::ClientSecret(format!(
                        "{}_secret",
                        provider_intent_id
                    ))),
                    failure_reason,
                    raw: json!({"id": provider_intent_id, "object": "payment_intent"}),
                })
            }
            GatewayScript::Decline(message) => Err(ServiceError::PaymentDeclined {
                provider: "stripe".to_string(),
                message: (*message).to_string(),
            }),
            GatewayScript::Transport => Err(ServiceError::GatewayError {
                provider: "stripe".to_string(),
                message: "exhausted 3 attempts: provider returned 503".to_string(),
                retryable: true,
            }),
        }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Stripe
    }

    async fn create_intent(&self, request: &CreateIntent) -> Result<PaymentIntent, ServiceError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.create_script.lock().unwrap().clone();
        Self::run_script(&script, format!("pi_{}", request.order_id.simple()))
    }

    async fn retrieve(&self, provider_intent_id: &str) -> Result<PaymentIntent, ServiceError> {
        let script = self.confirm_script.lock().unwrap().clone();
        Self::run_script(&script, provider_intent_id.to_string())
    }

    async fn confirm(&self, provider_intent_id: &str) -> Result<PaymentIntent, ServiceError> {
        self.confirm_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.confirm_script.lock().unwrap().clone();
        Self::run_script(&script, provider_intent_id.to_string())
    }

    async fn refund(
        &self,
        _provider_reference: &str,
        _amount: i64,
        _currency: &str,
    ) -> Result<GatewayRefund, ServiceError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        if self.refund_transport_failure.load(Ordering::SeqCst) {
            return Err(ServiceError::GatewayError {
                provider: "stripe".to_string(),
                message: "exhausted 3 attempts: connection reset".to_string(),
                retryable: true,
            });
        }
        Ok(GatewayRefund {
            provider_refund_id: format!("re_{}", Uuid::new_v4().simple()),
            status: RefundStatus::Succeeded,
            raw: json!({"object": "refund", "status": "succeeded"}),
        })
    }

    async fn verify_webhook(
        &self,
        _raw_body: &[u8],
        _headers: &HeaderMap,
    ) -> Result<GatewayEvent, ServiceError> {
        if self.webhook_bad_signature.load(Ordering::SeqCst) {
            return Err(ServiceError::SignatureError(
                "signature mismatch".to_string(),
            ));
        }
        Ok(self
            .webhook_event
            .lock()
            .unwrap()
            .clone()
            .expect("webhook event not scripted"))
    }
}

/// Full application wired against [`MockGateway`] and in-memory SQLite.
pub struct TestApp {
    pub db: Arc<DbPool>,
    pub gateway: Arc<MockGateway>,
    pub orders: OrderService,
    pub webhooks: WebhookService,
    events: mpsc::Receiver<Event>,
    router: Router,
}

impl TestApp {
    pub async fn new() -> Self {
        // A single connection: every pooled connection to sqlite::memory:
        // would otherwise get its own empty database.
        let mut options = ConnectOptions::new("sqlite::memory:");
        options.max_connections(1).sqlx_logging(false);
        let db = Database::connect(options).await.expect("sqlite connect");
        ensure_schema(&db).await.expect("schema");
        let db = Arc::new(db);

        let (event_tx, events) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);

        let gateway = Arc::new(MockGateway::new());
        let mut registry = GatewayRegistry::new();
        registry.register(gateway.clone());

        let orders = OrderService::new(
            db.clone(),
            registry.clone(),
            Some(Arc::new(event_sender.clone())),
            "USD".to_string(),
        );
        let webhooks = WebhookService::new(
            registry.clone(),
            orders.clone(),
            Some(Arc::new(event_sender.clone())),
        );

        let state = AppState {
            db: db.clone(),
            config: AppConfig::new(
                "sqlite::memory:".to_string(),
                "127.0.0.1".to_string(),
                0,
                "test".to_string(),
            ),
            event_sender,
            gateways: registry,
            orders: orders.clone(),
            webhooks: webhooks.clone(),
        };
        let router = Router::new()
            .nest("/api/v1", api_v1_routes())
            .with_state(state);

        Self {
            db,
            gateway,
            orders,
            webhooks,
            events,
            router,
        }
    }

    /// Everything emitted since the last drain.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().method(method).uri(path);
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        };
        self.router.clone().oneshot(request).await.expect("response")
    }

    pub async fn seed_coupon(
        &self,
        code: &str,
        kind: CouponKind,
        discount_value: Decimal,
        max_redemptions: Option<i32>,
    ) -> coupon::Model {
        let now = Utc::now();
        coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_string()),
            kind: Set(kind),
            discount_value: Set(discount_value),
            currency: Set(match kind {
                CouponKind::Fixed => Some("USD".to_string()),
                CouponKind::Percentage => None,
            }),
            redemption_count: Set(0),
            max_redemptions: Set(max_redemptions),
            stackable: Set(false),
            status: Set(CouponStatus::Active),
            starts_at: Set(None),
            expires_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await
        .expect("seed coupon")
    }

    pub async fn seed_tax_rate(
        &self,
        country: &str,
        region: Option<&str>,
        percentage: Decimal,
        is_default: bool,
    ) -> tax_rate::Model {
        let now = Utc::now();
        tax_rate::ActiveModel {
            id: Set(Uuid::new_v4()),
            country: Set(country.to_string()),
            region: Set(region.map(str::to_string)),
            percentage: Set(percentage),
            effective_from: Set(now - chrono::Duration::days(30)),
            effective_until: Set(None),
            is_default: Set(is_default),
            created_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await
        .expect("seed tax rate")
    }

    /// Shortcut used by refund and webhook tests: a paid order.
    pub async fn completed_order(&self, request: CreateOrderRequest) -> OrderResponse {
        let order = self.orders.create_order(request).await.expect("create");
        self.orders
            .capture_order(&order.order_number)
            .await
            .expect("capture")
    }
}

pub fn cart(items: &[(&str, i64, i32)]) -> Vec<OrderItemRequest> {
    items
        .iter()
        .map(|(name, unit_amount, quantity)| OrderItemRequest {
            name: (*name).to_string(),
            unit_amount: *unit_amount,
            quantity: *quantity,
        })
        .collect()
}

/// A plain US order request; tests override fields as needed.
pub fn order_request(items: Vec<OrderItemRequest>) -> CreateOrderRequest {
    CreateOrderRequest {
        items,
        provider: PaymentProvider::Stripe,
        currency: None,
        coupon_code: None,
        billing_country: "US".to_string(),
        billing_region: None,
        metadata: None,
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
