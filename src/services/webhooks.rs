//! Webhook reconciliation.
//!
//! Providers deliver webhooks at-least-once and out of order. Every
//! delivery is authenticated by its adapter first; after that the payload
//! is reduced to a normalized event and pushed through the same state
//! machine the capture path uses, so duplicates and races resolve
//! identically no matter which side reports first.

use std::sync::Arc;

use http::HeaderMap;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::entities::order::{OrderStatus, PaymentProvider};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::gateway::{GatewayEventKind, GatewayRegistry, IntentStatus, PaymentIntent};
use crate::services::audit::ACTOR_WEBHOOK;
use crate::services::orders::OrderService;

/// What happened to a verified delivery. Returned with 200 either way so
/// the provider stops retrying; `applied` is false for duplicates, stale
/// notifications and events about payments this system never created.
#[derive(Debug, Serialize)]
pub struct WebhookOutcome {
    pub provider: PaymentProvider,
    pub event_id: Option<String>,
    pub provider_intent_id: Option<String>,
    pub applied: bool,
    pub order_status: Option<OrderStatus>,
}

#[derive(Clone)]
pub struct WebhookService {
    registry: GatewayRegistry,
    orders: OrderService,
    event_sender: Option<Arc<EventSender>>,
}

impl WebhookService {
    pub fn new(
        registry: GatewayRegistry,
        orders: OrderService,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            registry,
            orders,
            event_sender,
        }
    }

    /// Verifies and applies one delivery.
    ///
    /// Signature failures are the only error path: anything authentic is
    /// acknowledged, even when it cannot be applied, because the provider
    /// would otherwise redeliver forever.
    #[instrument(skip(self, raw_body, headers), fields(provider = %provider))]
    pub async fn process(
        &self,
        provider: PaymentProvider,
        raw_body: &[u8],
        headers: &HeaderMap,
    ) -> Result<WebhookOutcome, ServiceError> {
        let gateway = self.registry.get(provider)?;

        let event = match gateway.verify_webhook(raw_body, headers).await {
            Ok(event) => event,
            Err(e @ ServiceError::SignatureError(_)) => {
                warn!(provider = %provider, "Rejected webhook with an invalid signature");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let intent_status = match &event.kind {
            GatewayEventKind::PaymentSucceeded => IntentStatus::Succeeded,
            GatewayEventKind::PaymentFailed => IntentStatus::Declined,
            GatewayEventKind::Ignored(event_type) => {
                info!(provider = %provider, event_type, "Ignoring unrelated webhook event");
                return self
                    .acknowledge(provider, event.event_id, event.provider_intent_id, None)
                    .await;
            }
        };

        let provider_intent_id = match event.provider_intent_id.clone() {
            Some(id) => id,
            None => {
                warn!(
                    provider = %provider,
                    event_id = event.event_id.as_deref().unwrap_or("unknown"),
                    "Payment webhook carries no payment identifier"
                );
                return self.acknowledge(provider, event.event_id, None, None).await;
            }
        };

        let order = match self.orders.find_by_intent(&provider_intent_id).await? {
            Some(order) => order,
            None => {
                // Same provider account, different system. Acknowledge so
                // the delivery queue drains.
                info!(
                    provider = %provider,
                    %provider_intent_id,
                    "No order references this payment"
                );
                return self
                    .acknowledge(provider, event.event_id, Some(provider_intent_id), None)
                    .await;
            }
        };

        let intent = PaymentIntent {
            provider_intent_id: provider_intent_id.clone(),
            status: intent_status,
            client_handle: None,
            failure_reason: failure_reason(&event.raw),
            raw: event.raw.clone(),
        };

        let before = order.status;
        let order_number = order.order_number.clone();
        let updated = match self
            .orders
            .apply_intent_status(order, &intent, ACTOR_WEBHOOK)
            .await
        {
            Ok(updated) => updated,
            // A failure notice for an order that already completed (or the
            // mirror case) is stale information, not a client error.
            Err(ServiceError::InvalidStatusTransition { order, status, event: transition }) => {
                warn!(
                    order_number = %order,
                    status = %status,
                    event = %transition,
                    "Webhook cannot be applied in the order's current state, acknowledging"
                );
                self.emit_processed(provider, &provider_intent_id, false).await;
                return Ok(WebhookOutcome {
                    provider,
                    event_id: event.event_id,
                    provider_intent_id: Some(provider_intent_id),
                    applied: false,
                    order_status: None,
                });
            }
            Err(e) => return Err(e),
        };

        let applied = updated.status != before;
        info!(
            provider = %provider,
            %order_number,
            %provider_intent_id,
            applied,
            status = %updated.status,
            "Webhook processed"
        );

        self.emit_processed(provider, &provider_intent_id, applied).await;
        Ok(WebhookOutcome {
            provider,
            event_id: event.event_id,
            provider_intent_id: Some(provider_intent_id),
            applied,
            order_status: Some(updated.status),
        })
    }

    async fn acknowledge(
        &self,
        provider: PaymentProvider,
        event_id: Option<String>,
        provider_intent_id: Option<String>,
        order_status: Option<OrderStatus>,
    ) -> Result<WebhookOutcome, ServiceError> {
        let provider_ref = provider_intent_id
            .clone()
            .or_else(|| event_id.clone())
            .unwrap_or_else(|| "unknown".to_string());
        self.emit_processed(provider, &provider_ref, false).await;
        Ok(WebhookOutcome {
            provider,
            event_id,
            provider_intent_id,
            applied: false,
            order_status,
        })
    }

    async fn emit_processed(&self, provider: PaymentProvider, provider_ref: &str, applied: bool) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender
                .send(Event::WebhookProcessed {
                    provider: provider.to_string(),
                    provider_ref: provider_ref.to_string(),
                    applied,
                })
                .await
            {
                warn!(error = %e, "Failed to send event");
            }
        }
    }
}

/// Best-effort decline detail out of the raw payload; both providers bury
/// it in different places and neither guarantees it.
fn failure_reason(raw: &serde_json::Value) -> Option<String> {
    raw.pointer("/data/object/last_payment_error/message")
        .or_else(|| raw.pointer("/resource/status_details/reason"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| {
            // Fall back to the provider's event name for the audit trail.
            raw.pointer("/type")
                .or_else(|| raw.pointer("/event_type"))
                .and_then(|v| v.as_str())
                .map(|t| format!("reported by {}", t))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use sea_orm::{ConnectOptions, Database};
    use serde_json::json;

    use crate::db::{ensure_schema, DbPool};
    use crate::gateway::{CreateIntent, GatewayEvent, GatewayRefund, PaymentGateway};

    enum StubBehavior {
        Event(GatewayEventKind, Option<String>),
        BadSignature,
    }

    struct StubGateway(StubBehavior);

    #[async_trait]
    impl PaymentGateway for StubGateway {
        fn provider(&self) -> PaymentProvider {
            PaymentProvider::Stripe
        }

        async fn create_intent(&self, _: &CreateIntent) -> Result<PaymentIntent, ServiceError> {
            unimplemented!("not exercised by webhook tests")
        }

        async fn retrieve(&self, _: &str) -> Result<PaymentIntent, ServiceError> {
            unimplemented!("not exercised by webhook tests")
        }

        async fn confirm(&self, _: &str) -> Result<PaymentIntent, ServiceError> {
            unimplemented!("not exercised by webhook tests")
        }

        async fn refund(&self, _: &str, _: i64, _: &str) -> Result<GatewayRefund, ServiceError> {
            unimplemented!("not exercised by webhook tests")
        }

        async fn verify_webhook(
            &self,
            _raw_body: &[u8],
            _headers: &HeaderMap,
        ) -> Result<GatewayEvent, ServiceError> {
            match &self.0 {
                StubBehavior::Event(kind, intent_id) => Ok(GatewayEvent {
                    event_id: Some("evt_stub".to_string()),
                    provider_intent_id: intent_id.clone(),
                    kind: kind.clone(),
                    raw: json!({"type": "stub"}),
                }),
                StubBehavior::BadSignature => Err(ServiceError::SignatureError(
                    "signature mismatch".to_string(),
                )),
            }
        }
    }

    async fn service_with(behavior: StubBehavior) -> WebhookService {
        // A single connection: every pooled connection to sqlite::memory:
        // would otherwise get its own empty database.
        let mut options = ConnectOptions::new("sqlite::memory:");
        options.max_connections(1);
        let db: DbPool = Database::connect(options).await.unwrap();
        ensure_schema(&db).await.unwrap();
        let db = Arc::new(db);

        let mut registry = GatewayRegistry::new();
        registry.register(Arc::new(StubGateway(behavior)));
        let orders = OrderService::new(db, registry.clone(), None, "USD".to_string());
        WebhookService::new(registry, orders, None)
    }

    #[tokio::test]
    async fn unrelated_events_are_acknowledged_without_lookup() {
        let service = service_with(StubBehavior::Event(
            GatewayEventKind::Ignored("invoice.created".to_string()),
            None,
        ))
        .await;

        let outcome = service
            .process(PaymentProvider::Stripe, b"{}", &HeaderMap::new())
            .await
            .unwrap();
        assert!(!outcome.applied);
        assert_eq!(outcome.order_status, None);
    }

    #[tokio::test]
    async fn invalid_signature_is_an_error() {
        let service = service_with(StubBehavior::BadSignature).await;

        let err = service
            .process(PaymentProvider::Stripe, b"{}", &HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::SignatureError(_)));
    }

    #[tokio::test]
    async fn payment_events_for_unknown_intents_are_acknowledged() {
        let service = service_with(StubBehavior::Event(
            GatewayEventKind::PaymentSucceeded,
            Some("pi_never_seen".to_string()),
        ))
        .await;

        let outcome = service
            .process(PaymentProvider::Stripe, b"{}", &HeaderMap::new())
            .await
            .unwrap();
        assert!(!outcome.applied);
        assert_eq!(outcome.provider_intent_id.as_deref(), Some("pi_never_seen"));
    }

    #[test]
    fn failure_reason_prefers_provider_detail() {
        let stripe = json!({
            "type": "payment_intent.payment_failed",
            "data": {"object": {"last_payment_error": {"message": "Your card was declined."}}}
        });
        assert_eq!(
            failure_reason(&stripe).as_deref(),
            Some("Your card was declined.")
        );

        let bare = json!({"type": "payment_intent.payment_failed"});
        assert_eq!(
            failure_reason(&bare).as_deref(),
            Some("reported by payment_intent.payment_failed")
        );
    }
}
