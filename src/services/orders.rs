//! Payment orchestration: order creation, capture, cancellation and
//! refunds, driven by an explicit state machine.
//!
//! Two sources of truth race each other here: direct gateway responses
//! (the client calling capture) and asynchronous webhooks. Every
//! transition therefore goes through a conditional UPDATE guarded on the
//! current status; whoever loses the race observes zero affected rows and
//! downgrades to a no-op.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db::DbPool;
use crate::entities::order::{self, Entity as OrderEntity, OrderStatus, PaymentProvider};
use crate::entities::order_item::{self, Entity as OrderItemEntity};
use crate::entities::payment_transaction::{
    self, Entity as TransactionEntity, TransactionKind, TransactionStatus,
};
use crate::entities::refund::{self, Entity as RefundEntity, RefundStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::gateway::{CreateIntent, GatewayRegistry, IntentStatus, PaymentIntent};
use crate::services::audit::{self, ACTOR_API};
use crate::services::coupons::CouponService;
use crate::services::pricing::{self, PricingItem};
use crate::services::taxes::TaxService;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, message = "Order must contain at least one item"))]
    pub items: Vec<OrderItemRequest>,
    pub provider: PaymentProvider,
    /// Defaults to the configured currency when omitted
    #[validate(length(min = 3, max = 3, message = "Currency must be a 3-letter code"))]
    pub currency: Option<String>,
    pub coupon_code: Option<String>,
    #[validate(length(min = 2, max = 2, message = "Billing country must be a 2-letter code"))]
    pub billing_country: String,
    pub billing_region: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Item-level bounds are enforced by the pricer, which rejects negative
/// amounts and non-positive quantities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItemRequest {
    pub name: String,
    pub unit_amount: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RefundRequest {
    /// Minor units; omitted means the full remaining balance
    #[validate(range(min = 1, message = "Refund amount must be positive"))]
    pub amount: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderItemResponse {
    pub name: String,
    pub unit_amount: i64,
    pub quantity: i32,
    pub discount_amount: i64,
    pub tax_amount: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub id: Uuid,
    pub transaction_number: String,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub provider_reference: Option<String>,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub currency: String,
    pub subtotal: i64,
    pub discount_total: i64,
    pub tax_total: i64,
    pub total: i64,
    pub status: OrderStatus,
    pub provider: PaymentProvider,
    pub provider_intent_id: Option<String>,
    /// Stripe client_secret or PayPal approval URL, whatever the
    /// storefront needs next
    pub client_handle: Option<String>,
    pub coupon_id: Option<Uuid>,
    pub coupon_redeemed: bool,
    pub billing_country: String,
    pub billing_region: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub items: Vec<OrderItemResponse>,
    pub transactions: Vec<TransactionResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefundResponse {
    pub id: Uuid,
    pub refund_number: String,
    pub transaction_id: Uuid,
    pub amount: i64,
    pub status: RefundStatus,
    pub provider_refund_id: Option<String>,
    pub order_status: OrderStatus,
}

impl From<order_item::Model> for OrderItemResponse {
    fn from(model: order_item::Model) -> Self {
        Self {
            name: model.name,
            unit_amount: model.unit_amount,
            quantity: model.quantity,
            discount_amount: model.discount_amount,
            tax_amount: model.tax_amount,
        }
    }
}

impl From<payment_transaction::Model> for TransactionResponse {
    fn from(model: payment_transaction::Model) -> Self {
        Self {
            id: model.id,
            transaction_number: model.transaction_number,
            kind: model.kind,
            status: model.status,
            provider_reference: model.provider_reference,
            amount: model.amount,
            currency: model.currency,
        }
    }
}

/// Lifecycle events the order state machine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEvent {
    IntentCreated,
    PaymentSucceeded,
    PaymentRequiresAction,
    PaymentProcessing,
    PaymentDeclined,
    CancelRequested,
    FullyRefunded,
}

impl OrderEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IntentCreated => "create a payment intent",
            Self::PaymentSucceeded => "complete payment",
            Self::PaymentRequiresAction => "request customer action",
            Self::PaymentProcessing => "enter processing",
            Self::PaymentDeclined => "record a declined payment",
            Self::CancelRequested => "be cancelled",
            Self::FullyRefunded => "be refunded",
        }
    }

    fn audit_name(&self) -> &'static str {
        match self {
            Self::IntentCreated => "order_created",
            Self::PaymentSucceeded => "payment_succeeded",
            Self::PaymentRequiresAction => "payment_requires_action",
            Self::PaymentProcessing => "payment_processing",
            Self::PaymentDeclined => "payment_failed",
            Self::CancelRequested => "order_cancelled",
            Self::FullyRefunded => "order_refunded",
        }
    }
}

/// The full transition table. `None` means the transition is illegal;
/// re-applying the event that produced the current state returns the
/// current state, which callers treat as an idempotent no-op.
pub fn next_status(current: OrderStatus, event: OrderEvent) -> Option<OrderStatus> {
    use OrderEvent::*;
    use OrderStatus::*;

    match (current, event) {
        (Draft, IntentCreated) => Some(AwaitingPayment),
        (AwaitingPayment, PaymentRequiresAction) => Some(RequiresAction),
        (AwaitingPayment | RequiresAction, PaymentProcessing) => Some(Processing),
        (AwaitingPayment | RequiresAction | Processing, PaymentSucceeded) => Some(Completed),
        (AwaitingPayment | RequiresAction | Processing, PaymentDeclined) => Some(Cancelled),
        (Draft | AwaitingPayment | RequiresAction | Processing, CancelRequested) => Some(Cancelled),
        (Completed, FullyRefunded) => Some(Refunded),

        // Replays of the event that produced the current state
        (AwaitingPayment, IntentCreated) => Some(AwaitingPayment),
        (RequiresAction, PaymentRequiresAction) => Some(RequiresAction),
        (Processing, PaymentProcessing) => Some(Processing),
        (Completed, PaymentSucceeded) => Some(Completed),
        (Cancelled, PaymentDeclined | CancelRequested) => Some(Cancelled),
        (Refunded, FullyRefunded) => Some(Refunded),

        _ => None,
    }
}

/// Source states a guarded UPDATE for this event may fire from. Mirrors
/// the transition table; the database check is what wins races.
fn guard_states(event: OrderEvent) -> &'static [OrderStatus] {
    use OrderStatus::*;
    match event {
        OrderEvent::IntentCreated => &[Draft],
        OrderEvent::PaymentRequiresAction => &[AwaitingPayment],
        OrderEvent::PaymentProcessing => &[AwaitingPayment, RequiresAction],
        OrderEvent::PaymentSucceeded => &[AwaitingPayment, RequiresAction, Processing],
        OrderEvent::PaymentDeclined => &[AwaitingPayment, RequiresAction, Processing],
        OrderEvent::CancelRequested => &[Draft, AwaitingPayment, RequiresAction, Processing],
        OrderEvent::FullyRefunded => &[Completed],
    }
}

fn transaction_status_for(event: OrderEvent) -> TransactionStatus {
    match event {
        OrderEvent::PaymentSucceeded => TransactionStatus::Succeeded,
        OrderEvent::PaymentRequiresAction => TransactionStatus::RequiresAction,
        OrderEvent::PaymentDeclined => TransactionStatus::Failed,
        OrderEvent::CancelRequested => TransactionStatus::Cancelled,
        _ => TransactionStatus::Pending,
    }
}

fn generate_number(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, hex[..8].to_uppercase())
}

#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    registry: GatewayRegistry,
    coupons: CouponService,
    taxes: TaxService,
    event_sender: Option<Arc<EventSender>>,
    default_currency: String,
}

impl OrderService {
    pub fn new(
        db_pool: Arc<DbPool>,
        registry: GatewayRegistry,
        event_sender: Option<Arc<EventSender>>,
        default_currency: String,
    ) -> Self {
        let coupons = CouponService::new(db_pool.clone());
        let taxes = TaxService::new(db_pool.clone());
        Self {
            db_pool,
            registry,
            coupons,
            taxes,
            event_sender,
            default_currency,
        }
    }

    /// Prices the cart and opens the provider-side payment.
    ///
    /// Persistence and the gateway call share one transaction: the order,
    /// its items and the pending authorization are inserted first, the
    /// intent is created while the transaction is still open, and the
    /// commit happens only after the gateway accepted. A gateway failure
    /// rolls the whole order back, so no half-created order ever becomes
    /// visible.
    #[instrument(skip(self, request), fields(provider = %request.provider))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<OrderResponse, ServiceError> {
        request.validate()?;
        let gateway = self.registry.get(request.provider)?;

        let now = Utc::now();
        let currency = request
            .currency
            .clone()
            .unwrap_or_else(|| self.default_currency.clone())
            .to_uppercase();

        let coupon = match request.coupon_code.as_deref() {
            Some(code) => Some(self.coupons.validate(code, &currency, now).await?),
            None => None,
        };
        let tax_rate = self
            .taxes
            .resolve(
                &request.billing_country,
                request.billing_region.as_deref(),
                now,
            )
            .await?;

        let cart: Vec<PricingItem> = request
            .items
            .iter()
            .map(|item| PricingItem {
                name: item.name.clone(),
                unit_amount: item.unit_amount,
                quantity: item.quantity,
            })
            .collect();
        let summary = pricing::price_order(&cart, coupon.as_ref(), tax_rate.as_ref(), &currency)?;

        let order_id = Uuid::new_v4();
        let order_number = generate_number("ORD");

        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for order creation");
            ServiceError::DatabaseError(e)
        })?;

        let order_model = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.clone()),
            currency: Set(currency.clone()),
            subtotal: Set(summary.subtotal),
            discount_total: Set(summary.discount_total),
            tax_total: Set(summary.tax_total),
            total: Set(summary.total),
            status: Set(OrderStatus::Draft),
            provider: Set(request.provider),
            provider_intent_id: Set(None),
            client_handle: Set(None),
            coupon_id: Set(coupon.as_ref().map(|c| c.id)),
            coupon_redeemed: Set(false),
            tax_rate_id: Set(tax_rate.as_ref().map(|r| r.id)),
            billing_country: Set(request.billing_country.to_uppercase()),
            billing_region: Set(request.billing_region.clone()),
            metadata: Set(request.metadata.clone()),
            created_at: Set(now),
            updated_at: Set(now),
            paid_at: Set(None),
            cancelled_at: Set(None),
        }
        .insert(&txn)
        .await?;

        for priced in &summary.items {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                name: Set(priced.name.clone()),
                unit_amount: Set(priced.unit_amount),
                quantity: Set(priced.quantity),
                discount_amount: Set(priced.discount_amount),
                tax_amount: Set(priced.tax_amount),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        let transaction =
            insert_transaction(&txn, &order_model, TransactionKind::Authorization, None, None)
                .await?;

        // The gateway call happens with the transaction still open; any
        // error from here on rolls everything back on drop.
        let intent = gateway
            .create_intent(&CreateIntent {
                order_id,
                order_number: order_number.clone(),
                amount: summary.total,
                currency: currency.clone(),
                idempotency_key: order_id.to_string(),
                metadata: Default::default(),
            })
            .await?;

        let mut active: order::ActiveModel = order_model.into();
        active.status = Set(OrderStatus::AwaitingPayment);
        active.provider_intent_id = Set(Some(intent.provider_intent_id.clone()));
        active.client_handle = Set(intent
            .client_handle
            .as_ref()
            .map(|handle| handle.as_str().to_string()));
        active.updated_at = Set(Utc::now());
        let order_model = active.update(&txn).await?;

        let mut tx_active: payment_transaction::ActiveModel = transaction.into();
        tx_active.provider_reference = Set(Some(intent.provider_intent_id.clone()));
        tx_active.raw_response = Set(Some(intent.raw.clone()));
        tx_active.updated_at = Set(Utc::now());
        let transaction = tx_active.update(&txn).await?;

        audit::record(
            &txn,
            Some(order_id),
            ACTOR_API,
            "order_created",
            json!({
                "order_number": order_number,
                "total": summary.total,
                "currency": currency,
                "provider": order_model.provider.as_str(),
                "provider_intent_id": intent.provider_intent_id,
                "coupon_id": order_model.coupon_id,
            }),
        )
        .await?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, %order_number, "Failed to commit order creation");
            ServiceError::DatabaseError(e)
        })?;

        info!(
            %order_number,
            total = summary.total,
            provider = %order_model.provider,
            "Order created"
        );

        self.emit(Event::OrderCreated(order_id)).await;
        self.emit(Event::PaymentIntentCreated {
            order_id,
            transaction_id: transaction.id,
            provider: order_model.provider.to_string(),
        })
        .await;

        self.to_response(order_model).await
    }

    /// Asks the provider to confirm and capture the payment.
    ///
    /// Capturing an order that is already `completed` or `processing` is a
    /// no-op that returns the current state without touching the gateway,
    /// so storefront retries never double-charge.
    #[instrument(skip(self))]
    pub async fn capture_order(&self, order_number: &str) -> Result<OrderResponse, ServiceError> {
        let order = self.require_order(order_number).await?;

        match order.status {
            OrderStatus::Completed | OrderStatus::Processing => {
                info!(%order_number, status = %order.status, "Capture is a no-op");
                return self.to_response(order).await;
            }
            OrderStatus::AwaitingPayment | OrderStatus::RequiresAction => {}
            other => {
                return Err(ServiceError::InvalidStatusTransition {
                    order: order.order_number.clone(),
                    status: other.to_string(),
                    event: "be captured".to_string(),
                })
            }
        }

        let provider_intent_id = order.provider_intent_id.clone().ok_or_else(|| {
            ServiceError::InternalError(format!(
                "order {} has no provider intent to capture",
                order.order_number
            ))
        })?;
        let gateway = self.registry.get(order.provider)?;

        // Record the attempt before going to the network so a transport
        // failure still leaves a trace.
        let attempt = insert_transaction(
            self.db_pool.as_ref(),
            &order,
            TransactionKind::Capture,
            Some(provider_intent_id.clone()),
            None,
        )
        .await?;

        let intent = match gateway.confirm(&provider_intent_id).await {
            Ok(intent) => intent,
            Err(ServiceError::PaymentDeclined { provider, message }) => {
                let declined = PaymentIntent {
                    provider_intent_id: provider_intent_id.clone(),
                    status: IntentStatus::Declined,
                    client_handle: None,
                    failure_reason: Some(message.clone()),
                    raw: json!({ "error": message }),
                };
                self.apply_intent_status(order, &declined, ACTOR_API).await?;
                return Err(ServiceError::PaymentDeclined { provider, message });
            }
            Err(e) => {
                // The order is untouched and may be retried; only the
                // attempt row records the failure.
                let mut active: payment_transaction::ActiveModel = attempt.into();
                active.status = Set(TransactionStatus::Failed);
                active.updated_at = Set(Utc::now());
                active.update(self.db_pool.as_ref()).await?;
                warn!(
                    order_number = %order.order_number,
                    error = %e,
                    "Capture attempt failed at the gateway"
                );
                return Err(e);
            }
        };

        let updated = self.apply_intent_status(order, &intent, ACTOR_API).await?;
        self.to_response(updated).await
    }

    /// Cancels an order in any pre-completed state.
    #[instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        order_number: &str,
        reason: Option<String>,
    ) -> Result<OrderResponse, ServiceError> {
        let order = self.require_order(order_number).await?;
        if order.status == OrderStatus::Cancelled {
            return self.to_response(order).await;
        }
        let updated = self
            .apply_event(
                order,
                OrderEvent::CancelRequested,
                None,
                ACTOR_API,
                reason.as_deref(),
            )
            .await?;
        self.to_response(updated).await
    }

    /// Refunds a captured payment, fully or partially.
    ///
    /// Runs in three stages: reserve the amount (row lock + over-refund
    /// check + pending refund row, committed before any network IO), call
    /// the gateway, then finalize. A full refund flips the order to
    /// `refunded` and returns the coupon redemption; partial refunds leave
    /// both alone.
    #[instrument(skip(self, request))]
    pub async fn refund(
        &self,
        transaction_id: Uuid,
        request: RefundRequest,
    ) -> Result<RefundResponse, ServiceError> {
        request.validate()?;

        // Stage 1: reserve.
        let txn = self.db_pool.begin().await?;
        let transaction = TransactionEntity::find_by_id(transaction_id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Transaction {} not found", transaction_id))
            })?;
        let order = OrderEntity::find_by_id(transaction.order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order for transaction {} not found", transaction_id))
            })?;

        if order.status != OrderStatus::Completed {
            return Err(ServiceError::InvalidStatusTransition {
                order: order.order_number.clone(),
                status: order.status.to_string(),
                event: "be refunded".to_string(),
            });
        }
        if transaction.status != TransactionStatus::Succeeded {
            return Err(ServiceError::ValidationError(format!(
                "transaction {} is not a settled charge",
                transaction.transaction_number
            )));
        }
        let provider_reference = transaction.provider_reference.clone().ok_or_else(|| {
            ServiceError::InternalError(format!(
                "transaction {} has no provider reference",
                transaction.transaction_number
            ))
        })?;

        let existing = RefundEntity::find()
            .filter(refund::Column::TransactionId.eq(transaction_id))
            .all(&txn)
            .await?;
        let already_held: i64 = existing
            .iter()
            .filter(|r| r.status.holds_amount())
            .map(|r| r.amount)
            .sum();
        let remaining = transaction.amount - already_held;
        let amount = request.amount.unwrap_or(remaining);
        if amount <= 0 || remaining <= 0 {
            return Err(ServiceError::ValidationError(
                "nothing left to refund on this transaction".to_string(),
            ));
        }
        if amount > remaining {
            return Err(ServiceError::ValidationError(format!(
                "refund of {} exceeds the remaining balance of {}",
                amount, remaining
            )));
        }

        let now = Utc::now();
        let refund_row = refund::ActiveModel {
            id: Set(Uuid::new_v4()),
            transaction_id: Set(transaction_id),
            refund_number: Set(generate_number("REF")),
            amount: Set(amount),
            status: Set(RefundStatus::Pending),
            provider_refund_id: Set(None),
            reason: Set(request.reason.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        audit::record(
            &txn,
            Some(order.id),
            ACTOR_API,
            "refund_requested",
            json!({
                "refund_number": refund_row.refund_number,
                "transaction_number": transaction.transaction_number,
                "amount": amount,
                "reason": request.reason,
            }),
        )
        .await?;
        txn.commit().await?;

        self.emit(Event::RefundRequested {
            transaction_id,
            refund_id: refund_row.id,
            amount,
        })
        .await;

        // Stage 2: the provider call. The reserved row survives a crash
        // here, and a failure below marks it failed, releasing the amount.
        let gateway = self.registry.get(order.provider)?;
        let outcome = gateway
            .refund(&provider_reference, amount, &order.currency)
            .await;

        // Stage 3: finalize.
        match outcome {
            Ok(gateway_refund) => {
                let full_refund = already_held + amount >= transaction.amount;
                let txn = self.db_pool.begin().await?;

                let mut active: refund::ActiveModel = refund_row.into();
                active.status = Set(gateway_refund.status);
                active.provider_refund_id = Set(Some(gateway_refund.provider_refund_id.clone()));
                active.updated_at = Set(Utc::now());
                let refund_row = active.update(&txn).await?;

                let mut order_status = order.status;
                if full_refund {
                    let rows = OrderEntity::update_many()
                        .col_expr(order::Column::Status, Expr::value(OrderStatus::Refunded))
                        .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
                        .filter(order::Column::Id.eq(order.id))
                        .filter(order::Column::Status.eq(OrderStatus::Completed))
                        .exec(&txn)
                        .await?
                        .rows_affected;
                    if rows > 0 {
                        order_status = OrderStatus::Refunded;
                        if order.coupon_redeemed {
                            if let Some(coupon_id) = order.coupon_id {
                                self.coupons.release(&txn, coupon_id).await?;
                            }
                        }
                    }
                }

                audit::record(
                    &txn,
                    Some(order.id),
                    ACTOR_API,
                    "refund_settled",
                    json!({
                        "refund_number": refund_row.refund_number,
                        "amount": amount,
                        "provider_refund_id": gateway_refund.provider_refund_id,
                        "full_refund": full_refund,
                    }),
                )
                .await?;
                txn.commit().await?;

                info!(
                    order_number = %order.order_number,
                    refund_number = %refund_row.refund_number,
                    amount,
                    full_refund,
                    "Refund settled"
                );
                self.emit(Event::RefundSucceeded {
                    transaction_id,
                    refund_id: refund_row.id,
                })
                .await;

                Ok(RefundResponse {
                    id: refund_row.id,
                    refund_number: refund_row.refund_number,
                    transaction_id,
                    amount,
                    status: refund_row.status,
                    provider_refund_id: refund_row.provider_refund_id,
                    order_status,
                })
            }
            Err(e) => {
                warn!(
                    order_number = %order.order_number,
                    error = %e,
                    "Gateway refund failed, releasing reserved amount"
                );
                let txn = self.db_pool.begin().await?;
                let refund_id = refund_row.id;
                let mut active: refund::ActiveModel = refund_row.into();
                active.status = Set(RefundStatus::Failed);
                active.updated_at = Set(Utc::now());
                active.update(&txn).await?;
                audit::record(
                    &txn,
                    Some(order.id),
                    ACTOR_API,
                    "refund_failed",
                    json!({ "transaction_id": transaction_id, "amount": amount, "error": e.to_string() }),
                )
                .await?;
                txn.commit().await?;

                self.emit(Event::RefundFailed {
                    transaction_id,
                    refund_id,
                })
                .await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_number: &str) -> Result<OrderResponse, ServiceError> {
        let order = self.require_order(order_number).await?;
        self.to_response(order).await
    }

    /// Applies a normalized provider-side payment state to the order.
    /// Shared by the capture path and the webhook reconciler, so both
    /// race through the same guarded update.
    pub(crate) async fn apply_intent_status(
        &self,
        order: order::Model,
        intent: &PaymentIntent,
        actor: &str,
    ) -> Result<order::Model, ServiceError> {
        let event = match intent.status {
            IntentStatus::Succeeded => OrderEvent::PaymentSucceeded,
            IntentStatus::RequiresAction => OrderEvent::PaymentRequiresAction,
            IntentStatus::Processing => OrderEvent::PaymentProcessing,
            IntentStatus::Declined | IntentStatus::Cancelled => OrderEvent::PaymentDeclined,
            // Nothing has happened provider-side yet.
            IntentStatus::Pending => return Ok(order),
        };
        self.apply_event(order, event, Some(intent), actor, intent.failure_reason.as_deref())
            .await
    }

    pub(crate) async fn find_by_intent(
        &self,
        provider_intent_id: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        OrderEntity::find()
            .filter(order::Column::ProviderIntentId.eq(provider_intent_id))
            .one(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::from)
    }

    /// The transition core. Validates the event against the table, then
    /// performs one conditional UPDATE guarded on the source states; zero
    /// affected rows means another actor moved the order first and the
    /// call settles into a no-op returning the fresh state.
    async fn apply_event(
        &self,
        order: order::Model,
        event: OrderEvent,
        intent: Option<&PaymentIntent>,
        actor: &str,
        note: Option<&str>,
    ) -> Result<order::Model, ServiceError> {
        let target = next_status(order.status, event).ok_or_else(|| {
            ServiceError::InvalidStatusTransition {
                order: order.order_number.clone(),
                status: order.status.to_string(),
                event: event.as_str().to_string(),
            }
        })?;
        if target == order.status {
            return Ok(order);
        }

        let now = Utc::now();
        let txn = self.db_pool.begin().await?;

        let mut update = OrderEntity::update_many()
            .col_expr(order::Column::Status, Expr::value(target))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Status.is_in(guard_states(event).iter().copied()));
        match event {
            OrderEvent::PaymentSucceeded => {
                // Completion, paid_at and the coupon idempotency flag are
                // one statement: whoever wins this UPDATE owns the ledger
                // increment, and nobody else can repeat it.
                update = update
                    .col_expr(order::Column::PaidAt, Expr::value(now))
                    .col_expr(
                        order::Column::CouponRedeemed,
                        Expr::value(order.coupon_id.is_some()),
                    );
            }
            OrderEvent::PaymentDeclined | OrderEvent::CancelRequested => {
                update = update.col_expr(order::Column::CancelledAt, Expr::value(now));
            }
            _ => {}
        }

        let rows = update.exec(&txn).await?.rows_affected;
        if rows == 0 {
            txn.rollback().await?;
            info!(
                order_number = %order.order_number,
                event = ?event,
                "Order already moved by a concurrent actor, treating as no-op"
            );
            return self.require_order_by_id(order.id).await;
        }

        let mut transaction_id = None;
        if let Some(latest) = latest_transaction(&txn, order.id).await? {
            transaction_id = Some(latest.id);
            let mut active: payment_transaction::ActiveModel = latest.into();
            active.status = Set(transaction_status_for(event));
            if let Some(intent) = intent {
                active.provider_reference = Set(Some(intent.provider_intent_id.clone()));
                active.raw_response = Set(Some(intent.raw.clone()));
            }
            active.updated_at = Set(now);
            active.update(&txn).await?;
        }

        let mut coupon_redeemed = false;
        if event == OrderEvent::PaymentSucceeded {
            if let Some(coupon_id) = order.coupon_id {
                match self.coupons.redeem(&txn, coupon_id).await {
                    Ok(()) => coupon_redeemed = true,
                    Err(ServiceError::CouponExhausted) => {
                        // The provider already took the money; completing
                        // without the discount bookkeeping beats stranding
                        // a paid order. The flag stays honest.
                        warn!(
                            order_number = %order.order_number,
                            %coupon_id,
                            "Coupon exhausted at completion time, completing without redemption"
                        );
                        OrderEntity::update_many()
                            .col_expr(order::Column::CouponRedeemed, Expr::value(false))
                            .filter(order::Column::Id.eq(order.id))
                            .exec(&txn)
                            .await?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        audit::record(
            &txn,
            Some(order.id),
            actor,
            event.audit_name(),
            json!({
                "old_status": order.status.as_str(),
                "new_status": target.as_str(),
                "provider_intent_id": intent.map(|i| i.provider_intent_id.clone()),
                "note": note,
            }),
        )
        .await?;
        txn.commit().await?;

        info!(
            order_number = %order.order_number,
            old_status = %order.status,
            new_status = %target,
            actor,
            "Order transitioned"
        );

        self.emit(Event::OrderStatusChanged {
            order_id: order.id,
            old_status: order.status.to_string(),
            new_status: target.to_string(),
        })
        .await;
        match event {
            OrderEvent::PaymentSucceeded => {
                self.emit(Event::OrderCompleted(order.id)).await;
                if let Some(transaction_id) = transaction_id {
                    self.emit(Event::PaymentSucceeded {
                        order_id: order.id,
                        transaction_id,
                    })
                    .await;
                }
                if coupon_redeemed {
                    if let Some(coupon_id) = order.coupon_id {
                        if let Ok(Some(coupon)) = self.coupons.get(coupon_id).await {
                            self.emit(Event::CouponRedeemed {
                                order_id: order.id,
                                code: coupon.code,
                            })
                            .await;
                        }
                    }
                }
            }
            OrderEvent::PaymentRequiresAction => {
                if let Some(transaction_id) = transaction_id {
                    self.emit(Event::PaymentRequiresAction {
                        order_id: order.id,
                        transaction_id,
                    })
                    .await;
                }
            }
            OrderEvent::PaymentDeclined => {
                if let Some(transaction_id) = transaction_id {
                    self.emit(Event::PaymentFailed {
                        order_id: order.id,
                        transaction_id,
                        reason: note.map(str::to_string),
                    })
                    .await;
                }
            }
            OrderEvent::CancelRequested => {
                self.emit(Event::OrderCancelled(order.id)).await;
            }
            _ => {}
        }

        self.require_order_by_id(order.id).await
    }

    async fn require_order(&self, order_number: &str) -> Result<order::Model, ServiceError> {
        OrderEntity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(self.db_pool.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_number)))
    }

    async fn require_order_by_id(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        OrderEntity::find_by_id(order_id)
            .one(self.db_pool.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    async fn to_response(&self, order: order::Model) -> Result<OrderResponse, ServiceError> {
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(self.db_pool.as_ref())
            .await?;
        let transactions = TransactionEntity::find()
            .filter(payment_transaction::Column::OrderId.eq(order.id))
            .order_by_asc(payment_transaction::Column::CreatedAt)
            .all(self.db_pool.as_ref())
            .await?;

        Ok(OrderResponse {
            id: order.id,
            order_number: order.order_number,
            currency: order.currency,
            subtotal: order.subtotal,
            discount_total: order.discount_total,
            tax_total: order.tax_total,
            total: order.total,
            status: order.status,
            provider: order.provider,
            provider_intent_id: order.provider_intent_id,
            client_handle: order.client_handle,
            coupon_id: order.coupon_id,
            coupon_redeemed: order.coupon_redeemed,
            billing_country: order.billing_country,
            billing_region: order.billing_region,
            created_at: order.created_at,
            paid_at: order.paid_at,
            cancelled_at: order.cancelled_at,
            items: items.into_iter().map(Into::into).collect(),
            transactions: transactions.into_iter().map(Into::into).collect(),
        })
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "Failed to send event");
            }
        }
    }
}

async fn latest_transaction<C>(
    conn: &C,
    order_id: Uuid,
) -> Result<Option<payment_transaction::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    TransactionEntity::find()
        .filter(payment_transaction::Column::OrderId.eq(order_id))
        .order_by_desc(payment_transaction::Column::CreatedAt)
        .one(conn)
        .await
        .map_err(ServiceError::from)
}

async fn insert_transaction<C>(
    conn: &C,
    order: &order::Model,
    kind: TransactionKind,
    provider_reference: Option<String>,
    raw_response: Option<serde_json::Value>,
) -> Result<payment_transaction::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let now = Utc::now();
    payment_transaction::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        transaction_number: Set(generate_number("TXN")),
        kind: Set(kind),
        status: Set(TransactionStatus::Pending),
        provider_reference: Set(provider_reference),
        amount: Set(order.total),
        currency: Set(order.currency.clone()),
        raw_response: Set(raw_response),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await
    .map_err(ServiceError::from)
}
