//! End-to-end order lifecycle against the mock gateway:
//! creation with pricing, capture, idempotent no-ops, declines,
//! cancellation, and creation rollback when the provider is down.

mod common;

use assert_matches::assert_matches;
use common::{cart, order_request, GatewayScript, TestApp};
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;

use checkout_api::entities::coupon::CouponKind;
use checkout_api::entities::order::{Entity as OrderEntity, OrderStatus};
use checkout_api::entities::order_item::Entity as OrderItemEntity;
use checkout_api::entities::payment_transaction::{
    Entity as TransactionEntity, TransactionKind, TransactionStatus,
};
use checkout_api::errors::ServiceError;
use checkout_api::events::Event;
use checkout_api::gateway::IntentStatus;

#[tokio::test]
async fn create_order_prices_cart_and_opens_payment() {
    let mut app = TestApp::new().await;

    let order = app
        .orders
        .create_order(order_request(cart(&[
            ("Widget", 2_500, 2),
            ("Gadget", 1_000, 1),
        ])))
        .await
        .expect("create order");

    assert_eq!(order.status, OrderStatus::AwaitingPayment);
    assert_eq!(order.subtotal, 6_000);
    assert_eq!(order.discount_total, 0);
    assert_eq!(order.tax_total, 0);
    assert_eq!(order.total, 6_000);
    assert_eq!(order.currency, "USD");
    assert!(order.order_number.starts_with("ORD-"));

    let intent_id = order.provider_intent_id.expect("intent id");
    assert!(intent_id.starts_with("pi_"));
    assert!(order.client_handle.expect("client handle").ends_with("_secret"));

    assert_eq!(order.items.len(), 2);
    assert_eq!(order.transactions.len(), 1);
    assert_eq!(order.transactions[0].kind, TransactionKind::Authorization);
    assert_eq!(order.transactions[0].status, TransactionStatus::Pending);
    assert_eq!(
        order.transactions[0].provider_reference.as_deref(),
        Some(intent_id.as_str())
    );

    let events = app.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::OrderCreated(id) if *id == order.id)));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::PaymentIntentCreated { order_id, .. } if *order_id == order.id)));
}

#[tokio::test]
async fn create_order_applies_coupon_then_tax_on_discounted_base() {
    let app = TestApp::new().await;
    app.seed_coupon("SAVE25", CouponKind::Percentage, dec!(25), None)
        .await;
    app.seed_tax_rate("US", None, dec!(8.5), false).await;

    let mut request = order_request(cart(&[("Course", 10_000, 1)]));
    request.coupon_code = Some("save25".to_string());

    let order = app.orders.create_order(request).await.expect("create order");

    assert_eq!(order.subtotal, 10_000);
    assert_eq!(order.discount_total, 2_500);
    // 8.5% of 7,500 = 637.5, rounded half-up
    assert_eq!(order.tax_total, 638);
    assert_eq!(order.total, 8_138);
    assert!(order.coupon_id.is_some());
    // Validation never claims the redemption; that happens at completion
    assert!(!order.coupon_redeemed);
}

#[tokio::test]
async fn gateway_outage_rolls_back_the_whole_order() {
    let app = TestApp::new().await;
    app.gateway.script_create(GatewayScript::Transport);

    let err = app
        .orders
        .create_order(order_request(cart(&[("Widget", 2_500, 1)])))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    // Nothing may survive the rollback, not even the draft
    let orders = OrderEntity::find().all(app.db.as_ref()).await.unwrap();
    assert!(orders.is_empty());
    let items = OrderItemEntity::find().all(app.db.as_ref()).await.unwrap();
    assert!(items.is_empty());
    let transactions = TransactionEntity::find().all(app.db.as_ref()).await.unwrap();
    assert!(transactions.is_empty());
}

#[tokio::test]
async fn immediate_decline_at_creation_leaves_no_order() {
    let app = TestApp::new().await;
    app.gateway
        .script_create(GatewayScript::Decline("insufficient_funds"));

    let err = app
        .orders
        .create_order(order_request(cart(&[("Widget", 2_500, 1)])))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::PaymentDeclined { .. });

    let orders = OrderEntity::find().all(app.db.as_ref()).await.unwrap();
    assert!(orders.is_empty());
}

#[tokio::test]
async fn capture_completes_the_order() {
    let mut app = TestApp::new().await;

    let order = app
        .orders
        .create_order(order_request(cart(&[("Widget", 2_500, 2)])))
        .await
        .expect("create order");
    app.drain_events();

    let captured = app
        .orders
        .capture_order(&order.order_number)
        .await
        .expect("capture");

    assert_eq!(captured.status, OrderStatus::Completed);
    assert!(captured.paid_at.is_some());
    assert_eq!(captured.transactions.len(), 2);
    let capture_row = &captured.transactions[1];
    assert_eq!(capture_row.kind, TransactionKind::Capture);
    assert_eq!(capture_row.status, TransactionStatus::Succeeded);

    let events = app.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::OrderCompleted(id) if *id == order.id)));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::PaymentSucceeded { order_id, .. } if *order_id == order.id)));
}

#[tokio::test]
async fn capturing_a_completed_order_skips_the_gateway() {
    let app = TestApp::new().await;

    let order = app
        .orders
        .create_order(order_request(cart(&[("Widget", 2_500, 1)])))
        .await
        .expect("create order");

    let first = app.orders.capture_order(&order.order_number).await.unwrap();
    assert_eq!(first.status, OrderStatus::Completed);
    assert_eq!(app.gateway.confirm_count(), 1);

    let second = app.orders.capture_order(&order.order_number).await.unwrap();
    assert_eq!(second.status, OrderStatus::Completed);
    assert_eq!(second.paid_at, first.paid_at);
    // Still one confirm: the retry never reached the provider
    assert_eq!(app.gateway.confirm_count(), 1);
    // And no extra capture transaction was recorded
    assert_eq!(second.transactions.len(), first.transactions.len());
}

#[tokio::test]
async fn capture_while_processing_waits_for_the_webhook() {
    let app = TestApp::new().await;
    app.gateway
        .script_confirm(GatewayScript::Intent(IntentStatus::Processing));

    let order = app
        .orders
        .create_order(order_request(cart(&[("Widget", 2_500, 1)])))
        .await
        .expect("create order");

    let captured = app.orders.capture_order(&order.order_number).await.unwrap();
    assert_eq!(captured.status, OrderStatus::Processing);
    assert_eq!(app.gateway.confirm_count(), 1);

    // Retrying while the provider settles must not re-confirm
    let retried = app.orders.capture_order(&order.order_number).await.unwrap();
    assert_eq!(retried.status, OrderStatus::Processing);
    assert_eq!(app.gateway.confirm_count(), 1);
}

#[tokio::test]
async fn transport_failure_during_capture_leaves_the_order_capturable() {
    let app = TestApp::new().await;
    app.gateway.script_confirm(GatewayScript::Transport);

    let order = app
        .orders
        .create_order(order_request(cart(&[("Widget", 2_500, 1)])))
        .await
        .expect("create order");

    let err = app
        .orders
        .capture_order(&order.order_number)
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    // The order is untouched; only the attempt row records the failure
    let after = app.orders.get_order(&order.order_number).await.unwrap();
    assert_eq!(after.status, OrderStatus::AwaitingPayment);
    let attempt = after.transactions.last().unwrap();
    assert_eq!(attempt.kind, TransactionKind::Capture);
    assert_eq!(attempt.status, TransactionStatus::Failed);

    // The provider came back; a retry settles the order
    app.gateway
        .script_confirm(GatewayScript::Intent(IntentStatus::Succeeded));
    let completed = app.orders.capture_order(&order.order_number).await.unwrap();
    assert_eq!(completed.status, OrderStatus::Completed);
    assert_eq!(completed.transactions.len(), 3);
}

#[tokio::test]
async fn requires_action_allows_a_second_capture() {
    let app = TestApp::new().await;
    app.gateway
        .script_confirm(GatewayScript::Intent(IntentStatus::RequiresAction));

    let order = app
        .orders
        .create_order(order_request(cart(&[("Widget", 2_500, 1)])))
        .await
        .expect("create order");

    let challenged = app.orders.capture_order(&order.order_number).await.unwrap();
    assert_eq!(challenged.status, OrderStatus::RequiresAction);

    // Customer finished the 3DS challenge; the next capture settles it
    app.gateway
        .script_confirm(GatewayScript::Intent(IntentStatus::Succeeded));
    let completed = app.orders.capture_order(&order.order_number).await.unwrap();
    assert_eq!(completed.status, OrderStatus::Completed);
    assert_eq!(app.gateway.confirm_count(), 2);
}

#[tokio::test]
async fn declined_capture_cancels_the_order_and_spares_the_coupon() {
    let mut app = TestApp::new().await;
    let coupon = app
        .seed_coupon("SAVE10", CouponKind::Percentage, dec!(10), Some(5))
        .await;
    app.gateway
        .script_confirm(GatewayScript::Decline("card_declined"));

    let mut request = order_request(cart(&[("Widget", 2_500, 1)]));
    request.coupon_code = Some("SAVE10".to_string());
    let order = app.orders.create_order(request).await.expect("create order");
    app.drain_events();

    let err = app
        .orders
        .capture_order(&order.order_number)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::PaymentDeclined { .. });

    let after = app.orders.get_order(&order.order_number).await.unwrap();
    assert_eq!(after.status, OrderStatus::Cancelled);
    assert!(after.cancelled_at.is_some());
    assert!(!after.coupon_redeemed);
    let capture_row = after.transactions.last().unwrap();
    assert_eq!(capture_row.kind, TransactionKind::Capture);
    assert_eq!(capture_row.status, TransactionStatus::Failed);

    // The decline must not consume a redemption
    let coupon_after = checkout_api::entities::coupon::Entity::find_by_id(coupon.id)
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(coupon_after.redemption_count, 0);

    let events = app.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::PaymentFailed { order_id, .. } if *order_id == order.id)));
}

#[tokio::test]
async fn cancel_is_idempotent_and_blocks_later_capture() {
    let app = TestApp::new().await;

    let order = app
        .orders
        .create_order(order_request(cart(&[("Widget", 2_500, 1)])))
        .await
        .expect("create order");

    let cancelled = app
        .orders
        .cancel_order(&order.order_number, Some("changed my mind".to_string()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());

    // Second cancel: same state back, no error
    let again = app.orders.cancel_order(&order.order_number, None).await.unwrap();
    assert_eq!(again.status, OrderStatus::Cancelled);

    let err = app
        .orders
        .capture_order(&order.order_number)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidStatusTransition { .. });
    assert_eq!(err.status_code(), http::StatusCode::CONFLICT);
    assert_eq!(app.gateway.confirm_count(), 0);
}

#[tokio::test]
async fn completed_orders_cannot_be_cancelled() {
    let app = TestApp::new().await;

    let order = app
        .completed_order(order_request(cart(&[("Widget", 2_500, 1)])))
        .await;

    let err = app
        .orders
        .cancel_order(&order.order_number, None)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::InvalidStatusTransition { ref status, .. } if status == "completed"
    );
}

#[tokio::test]
async fn unknown_orders_are_not_found() {
    let app = TestApp::new().await;
    let err = app.orders.get_order("ORD-DOESNOTEXIST").await.unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}
