use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::errors::ServiceError;
use crate::services::orders::{CreateOrderRequest, OrderResponse, RefundRequest, RefundResponse};
use crate::{ApiResponse, ApiResult, AppState};

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:order_number", get(get_order))
        .route("/orders/:order_number/capture", post(capture_order))
        .route("/orders/:order_number/cancel", post(cancel_order))
        .route("/payments/:transaction_id/refunds", post(refund_transaction))
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CancelOrderRequest {
    pub reason: Option<String>,
}

/// Create an order and open its provider-side payment.
///
/// Returns 201 with the order in `awaiting_payment` and the client handle
/// the storefront needs to continue (client secret or approval URL).
pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OrderResponse>>), ServiceError> {
    if let Err(validation) = request.validate() {
        let errors: Vec<String> = validation
            .field_errors()
            .iter()
            .flat_map(|(field, errors)| {
                let field = field.clone();
                errors.iter().map(move |error| {
                    format!(
                        "{}: {}",
                        field,
                        error.message.as_ref().unwrap_or(&"Invalid value".into())
                    )
                })
            })
            .collect();
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::validation_errors(errors)),
        ));
    }

    let order = state.orders.create_order(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(order))))
}

/// Get an order by its public number, items and transactions included.
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
) -> ApiResult<OrderResponse> {
    let order = state.orders.get_order(&order_number).await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Confirm and capture the payment behind an order.
///
/// Responds 200 with the current state when the order is already
/// `completed` or `processing`; 402 when the provider declines; 409 when
/// the order cannot be captured at all.
pub async fn capture_order(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
) -> ApiResult<OrderResponse> {
    let order = state.orders.capture_order(&order_number).await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Cancel an order that has not completed. Idempotent: cancelling a
/// cancelled order returns 200 with the unchanged state.
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
    body: Option<Json<CancelOrderRequest>>,
) -> ApiResult<OrderResponse> {
    let reason = body.and_then(|Json(request)| request.reason);
    let order = state.orders.cancel_order(&order_number, reason).await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Refund a settled transaction. Omitting `amount` refunds whatever
/// remains; a full refund also moves the order to `refunded`.
pub async fn refund_transaction(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
    Json(request): Json<RefundRequest>,
) -> Result<(StatusCode, Json<ApiResponse<RefundResponse>>), ServiceError> {
    let refund = state.orders.refund(transaction_id, request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(refund))))
}
