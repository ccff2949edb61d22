/*!
 * Payment gateway adapters.
 *
 * Each provider gets one adapter implementing [`PaymentGateway`]. The
 * adapter owns every provider quirk: authentication, wire formats, amount
 * representation, webhook signature schemes. Everything above this module
 * speaks only the normalized types defined here.
 */

pub mod paypal;
pub mod stripe;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::entities::order::PaymentProvider;
use crate::entities::refund::RefundStatus;
use crate::errors::ServiceError;

pub use paypal::PaypalGateway;
pub use stripe::StripeGateway;

/// Provider-side payment state, normalized across providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    /// Created; waiting on the customer to start paying
    Pending,
    /// Customer or merchant action outstanding (3DS challenge, wallet
    /// approval, capture)
    RequiresAction,
    /// Provider accepted the payment and is settling asynchronously
    Processing,
    Succeeded,
    /// Provider rejected the payment; retrying the same instrument will
    /// not succeed
    Declined,
    Cancelled,
}

/// Whatever the storefront needs to finish the payment in the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientHandle {
    /// Card flows: handed to the provider's browser SDK
    ClientSecret(String),
    /// Wallet flows: redirect target for buyer approval
    ApprovalUrl(String),
}

impl ClientHandle {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ClientSecret(value) | Self::ApprovalUrl(value) => value.as_str(),
        }
    }
}

/// Normalized view of a provider-side payment.
#[derive(Debug, Clone)]
pub struct PaymentIntent {
    pub provider_intent_id: String,
    pub status: IntentStatus,
    pub client_handle: Option<ClientHandle>,
    /// Provider's decline detail, set when status is [`IntentStatus::Declined`]
    pub failure_reason: Option<String>,
    /// Raw provider response, persisted on the transaction row
    pub raw: Value,
}

/// Charge request handed to an adapter.
#[derive(Debug, Clone)]
pub struct CreateIntent {
    pub order_id: Uuid,
    pub order_number: String,
    /// Minor units of `currency`
    pub amount: i64,
    pub currency: String,
    /// Forwarded as the provider-side idempotency key
    pub idempotency_key: String,
    pub metadata: HashMap<String, String>,
}

/// Outcome of a provider-side refund call.
#[derive(Debug, Clone)]
pub struct GatewayRefund {
    pub provider_refund_id: String,
    pub status: RefundStatus,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEventKind {
    PaymentSucceeded,
    PaymentFailed,
    /// Authentic but irrelevant to order state; carries the provider's
    /// event type for logging
    Ignored(String),
}

/// A verified, normalized webhook notification.
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub event_id: Option<String>,
    /// Provider payment identifier the event refers to, when it carries one
    pub provider_intent_id: Option<String>,
    pub kind: GatewayEventKind,
    pub raw: Value,
}

/// One payment provider integration.
///
/// Implementations must be stateless apart from connection pooling and
/// token caching, so a single instance can serve concurrent requests.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Which provider this adapter talks to.
    fn provider(&self) -> PaymentProvider;

    /// Create the provider-side payment for an order.
    async fn create_intent(&self, request: &CreateIntent) -> Result<PaymentIntent, ServiceError>;

    /// Fetch the current provider-side state of a payment.
    async fn retrieve(&self, provider_intent_id: &str) -> Result<PaymentIntent, ServiceError>;

    /// Confirm and capture a payment the customer has finished authorizing.
    async fn confirm(&self, provider_intent_id: &str) -> Result<PaymentIntent, ServiceError>;

    /// Refund a captured payment, fully or partially. `amount` is in minor
    /// units of `currency`.
    async fn refund(
        &self,
        provider_reference: &str,
        amount: i64,
        currency: &str,
    ) -> Result<GatewayRefund, ServiceError>;

    /// Authenticate a webhook delivery against the raw body and headers,
    /// then normalize it. The body must be exactly as received on the wire;
    /// re-serialized JSON will not verify.
    async fn verify_webhook(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
    ) -> Result<GatewayEvent, ServiceError>;
}

/// Adapters hold credentials, so they deliberately do not derive `Debug`;
/// the trait object formats as its provider tag only.
impl std::fmt::Debug for dyn PaymentGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PaymentGateway")
            .field(&self.provider())
            .finish()
    }
}

/// Adapter lookup by provider tag.
///
/// Built once at startup; only providers with credentials configured are
/// registered, so an order naming an unconfigured provider fails fast.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<PaymentProvider, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self {
            gateways: HashMap::new(),
        }
    }

    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) {
        self.gateways.insert(gateway.provider(), gateway);
    }

    pub fn get(&self, provider: PaymentProvider) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
        self.gateways.get(&provider).cloned().ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "payment provider {} is not configured",
                provider
            ))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }

    pub fn providers(&self) -> Vec<PaymentProvider> {
        self.gateways.keys().copied().collect()
    }
}

/// Builds the registry from whatever credentials the config carries.
pub fn build_registry(config: &AppConfig) -> GatewayRegistry {
    let mut registry = GatewayRegistry::new();
    let timeout = config.gateway_timeout();

    if let (Some(secret_key), Some(webhook_secret)) = (
        config.stripe.secret_key.clone(),
        config.stripe.webhook_secret.clone(),
    ) {
        registry.register(Arc::new(StripeGateway::new(
            secret_key,
            webhook_secret,
            config.stripe.api_base.clone(),
            timeout,
            config.gateway_max_retries,
            config.webhook_tolerance_secs,
        )));
    }

    if let (Some(client_id), Some(client_secret), Some(webhook_id)) = (
        config.paypal.client_id.clone(),
        config.paypal.client_secret.clone(),
        config.paypal.webhook_id.clone(),
    ) {
        registry.register(Arc::new(PaypalGateway::new(
            client_id,
            client_secret,
            webhook_id,
            config.paypal.api_base.clone(),
            timeout,
            config.gateway_max_retries,
        )));
    }

    registry
}

/// Sends a request, retrying transport failures and 5xx responses with
/// exponential backoff. Any response below 500 is returned to the caller:
/// a provider rejection reread a moment later is still a rejection.
pub(crate) async fn send_with_retry(
    request: reqwest::RequestBuilder,
    provider: PaymentProvider,
    max_retries: u32,
) -> Result<reqwest::Response, ServiceError> {
    let max_retries = max_retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_retries {
        let attempt_request = request.try_clone().ok_or_else(|| {
            ServiceError::InternalError("gateway request body is not retryable".to_string())
        })?;

        match attempt_request.send().await {
            Ok(response) if !response.status().is_server_error() => return Ok(response),
            Ok(response) => {
                last_error = format!("provider returned {}", response.status());
                warn!(
                    provider = %provider,
                    status = %response.status(),
                    attempt,
                    max_retries,
                    "Gateway server error"
                );
            }
            Err(e) => {
                last_error = e.to_string();
                warn!(
                    provider = %provider,
                    error = %e,
                    attempt,
                    max_retries,
                    "Gateway request failed"
                );
            }
        }

        if attempt < max_retries {
            tokio::time::sleep(Duration::from_secs(2_u64.pow(attempt - 1))).await;
        }
    }

    Err(ServiceError::GatewayError {
        provider: provider.to_string(),
        message: format!("exhausted {} attempts: {}", max_retries, last_error),
        retryable: true,
    })
}

/// Compares two signature strings without leaking where they diverge.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_unconfigured_provider() {
        let registry = GatewayRegistry::new();
        let err = registry.get(PaymentProvider::Stripe).unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
    }

    #[test]
    fn constant_time_eq_basic() {
        assert!(constant_time_eq("deadbeef", "deadbeef"));
        assert!(!constant_time_eq("deadbeef", "deadbeff"));
        assert!(!constant_time_eq("deadbeef", "deadbee"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn client_handle_exposes_inner_value() {
        let secret = ClientHandle::ClientSecret("pi_123_secret_456".to_string());
        assert_eq!(secret.as_str(), "pi_123_secret_456");
        let url = ClientHandle::ApprovalUrl("https://example.test/approve".to_string());
        assert_eq!(url.as_str(), "https://example.test/approve");
    }
}
