use std::str::FromStr;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::post,
    Router,
};
use bytes::Bytes;

use crate::entities::order::PaymentProvider;
use crate::errors::ServiceError;
use crate::services::webhooks::WebhookOutcome;
use crate::{ApiResponse, ApiResult, AppState};

pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/webhooks/:provider", post(provider_webhook))
}

/// Receive a provider webhook.
///
/// The raw body bytes go straight to the adapter's signature check; the
/// JSON must not be re-parsed or re-serialized before verification.
/// Authentic deliveries always get 200, applied or not, so the provider's
/// retry queue drains; only signature failures get 401.
pub async fn provider_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<WebhookOutcome> {
    let provider = parse_provider(&provider)?;
    // A provider without registered credentials has no endpoint, same as
    // an unknown name.
    if state.gateways.get(provider).is_err() {
        return Err(ServiceError::NotFound(format!(
            "No webhook endpoint for provider {}",
            provider
        )));
    }
    let outcome = state.webhooks.process(provider, &body, &headers).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

fn parse_provider(raw: &str) -> Result<PaymentProvider, ServiceError> {
    PaymentProvider::from_str(raw)
        .map_err(|_| ServiceError::NotFound(format!("No webhook endpoint for provider {}", raw)))
}
