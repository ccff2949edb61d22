//! Refund flows: partial and full refunds, over-refund protection, the
//! reserve/call/finalize sequence around the gateway, and coupon return
//! on full refunds.

mod common;

use assert_matches::assert_matches;
use common::{cart, order_request, TestApp};
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

use checkout_api::entities::coupon::{self, CouponKind};
use checkout_api::entities::order::OrderStatus;
use checkout_api::entities::refund::{self, Entity as RefundEntity, RefundStatus};
use checkout_api::errors::ServiceError;
use checkout_api::events::Event;
use checkout_api::services::orders::RefundRequest;

fn refund_request(amount: Option<i64>) -> RefundRequest {
    RefundRequest {
        amount,
        reason: Some("requested by customer".to_string()),
    }
}

#[tokio::test]
async fn partial_refund_keeps_the_order_completed() {
    let mut app = TestApp::new().await;
    let order = app
        .completed_order(order_request(cart(&[("Course", 10_000, 1)])))
        .await;
    let charge = order.transactions.last().unwrap();
    app.drain_events();

    let refund = app
        .orders
        .refund(charge.id, refund_request(Some(3_000)))
        .await
        .expect("refund");

    assert_eq!(refund.amount, 3_000);
    assert_eq!(refund.status, RefundStatus::Succeeded);
    assert!(refund.refund_number.starts_with("REF-"));
    assert!(refund
        .provider_refund_id
        .as_deref()
        .is_some_and(|id| id.starts_with("re_")));
    assert_eq!(refund.order_status, OrderStatus::Completed);

    let after = app.orders.get_order(&order.order_number).await.unwrap();
    assert_eq!(after.status, OrderStatus::Completed);

    let events = app.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::RefundRequested { amount, .. } if *amount == 3_000)));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::RefundSucceeded { transaction_id, .. } if *transaction_id == charge.id)));
}

#[tokio::test]
async fn full_refund_flips_the_order_and_returns_the_coupon() {
    let app = TestApp::new().await;
    let seeded = app
        .seed_coupon("SAVE10", CouponKind::Percentage, dec!(10), Some(1))
        .await;

    let mut request = order_request(cart(&[("Course", 10_000, 1)]));
    request.coupon_code = Some("SAVE10".to_string());
    let order = app.completed_order(request).await;
    assert!(order.coupon_redeemed);
    let charge = order.transactions.last().unwrap();

    // Omitted amount means the whole remaining balance.
    let refund = app
        .orders
        .refund(charge.id, refund_request(None))
        .await
        .expect("refund");
    assert_eq!(refund.amount, 9_000);
    assert_eq!(refund.order_status, OrderStatus::Refunded);

    let after = app.orders.get_order(&order.order_number).await.unwrap();
    assert_eq!(after.status, OrderStatus::Refunded);

    // The redemption went back to the pool.
    let coupon_after = coupon::Entity::find_by_id(seeded.id)
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(coupon_after.redemption_count, 0);
}

#[tokio::test]
async fn successive_partials_end_in_a_full_refund() {
    let app = TestApp::new().await;
    let order = app
        .completed_order(order_request(cart(&[("Course", 10_000, 1)])))
        .await;
    let charge = order.transactions.last().unwrap();

    let first = app
        .orders
        .refund(charge.id, refund_request(Some(6_000)))
        .await
        .unwrap();
    assert_eq!(first.order_status, OrderStatus::Completed);

    // The second refund drains the rest, which makes it a full refund.
    let second = app
        .orders
        .refund(charge.id, refund_request(None))
        .await
        .unwrap();
    assert_eq!(second.amount, 4_000);
    assert_eq!(second.order_status, OrderStatus::Refunded);

    let err = app
        .orders
        .refund(charge.id, refund_request(None))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(ref msg) if msg.contains("nothing left"));
}

#[tokio::test]
async fn over_refunds_never_reach_the_gateway() {
    let app = TestApp::new().await;
    let order = app
        .completed_order(order_request(cart(&[("Course", 10_000, 1)])))
        .await;
    let charge = order.transactions.last().unwrap();

    let err = app
        .orders
        .refund(charge.id, refund_request(Some(10_001)))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(ref msg) if msg.contains("exceeds"));
    assert_eq!(app.gateway.refund_count(), 0);

    // No reservation row was left behind either.
    let rows = RefundEntity::find()
        .filter(refund::Column::TransactionId.eq(charge.id))
        .all(app.db.as_ref())
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn refunds_require_a_completed_order() {
    let app = TestApp::new().await;
    let order = app
        .orders
        .create_order(order_request(cart(&[("Course", 10_000, 1)])))
        .await
        .unwrap();
    let authorization = &order.transactions[0];

    let err = app
        .orders
        .refund(authorization.id, refund_request(Some(1_000)))
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::InvalidStatusTransition { ref status, .. } if status == "awaiting_payment"
    );
}

#[tokio::test]
async fn refunds_require_a_settled_transaction() {
    let app = TestApp::new().await;
    let order = app
        .completed_order(order_request(cart(&[("Course", 10_000, 1)])))
        .await;
    // The authorization row never settles; only the capture does.
    let authorization = &order.transactions[0];

    let err = app
        .orders
        .refund(authorization.id, refund_request(Some(1_000)))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(ref msg) if msg.contains("not a settled charge"));
}

#[tokio::test]
async fn gateway_failure_releases_the_reservation() {
    let mut app = TestApp::new().await;
    let order = app
        .completed_order(order_request(cart(&[("Course", 10_000, 1)])))
        .await;
    let charge = order.transactions.last().unwrap();
    app.drain_events();

    app.gateway.fail_refunds(true);
    let err = app
        .orders
        .refund(charge.id, refund_request(Some(4_000)))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    // The reserved row is marked failed and stops holding the amount.
    let rows = RefundEntity::find()
        .filter(refund::Column::TransactionId.eq(charge.id))
        .all(app.db.as_ref())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, RefundStatus::Failed);

    let events = app.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::RefundFailed { .. })));

    // A retry can now take the full balance: the failed attempt holds nothing.
    app.gateway.fail_refunds(false);
    let retry = app
        .orders
        .refund(charge.id, refund_request(None))
        .await
        .expect("retry refund");
    assert_eq!(retry.amount, 10_000);
    assert_eq!(retry.order_status, OrderStatus::Refunded);
}

#[tokio::test]
async fn unknown_transactions_are_not_found() {
    let app = TestApp::new().await;
    let err = app
        .orders
        .refund(Uuid::new_v4(), refund_request(None))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}
