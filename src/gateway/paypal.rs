//! PayPal adapter: v2 Checkout Orders with buyer-approval redirects,
//! OAuth2 client-credentials tokens, and webhook authentication through
//! PayPal's verify-webhook-signature API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use super::{
    send_with_retry, ClientHandle, CreateIntent, GatewayEvent, GatewayEventKind, GatewayRefund,
    IntentStatus, PaymentGateway, PaymentIntent,
};
use crate::entities::order::PaymentProvider;
use crate::entities::refund::RefundStatus;
use crate::errors::ServiceError;

/// Decline issues PayPal reports inside error `details`. Anything else is a
/// gateway fault, not a buyer rejection.
const DECLINE_ISSUES: &[&str] = &[
    "INSTRUMENT_DECLINED",
    "PAYER_CANNOT_PAY",
    "TRANSACTION_REFUSED",
];

pub struct PaypalGateway {
    client_id: String,
    client_secret: String,
    webhook_id: String,
    api_base: String,
    client: reqwest::Client,
    max_retries: u32,
    token: RwLock<Option<CachedToken>>,
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct PaypalTokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct PaypalOrderResponse {
    id: String,
    status: String,
    #[serde(default)]
    links: Vec<PaypalLink>,
    #[serde(default)]
    purchase_units: Vec<PaypalPurchaseUnit>,
}

#[derive(Debug, Deserialize)]
struct PaypalLink {
    rel: String,
    href: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PaypalPurchaseUnit {
    payments: Option<PaypalPayments>,
}

#[derive(Debug, Default, Deserialize)]
struct PaypalPayments {
    #[serde(default)]
    captures: Vec<PaypalCapture>,
}

#[derive(Debug, Deserialize)]
struct PaypalCapture {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PaypalRefundResponse {
    id: String,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaypalErrorResponse {
    name: Option<String>,
    message: Option<String>,
    #[serde(default)]
    details: Vec<PaypalErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct PaypalErrorDetail {
    issue: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct PaypalVerifyRequest<'a> {
    transmission_id: &'a str,
    transmission_time: &'a str,
    cert_url: &'a str,
    transmission_sig: &'a str,
    auth_algo: &'a str,
    webhook_id: &'a str,
    webhook_event: Value,
}

#[derive(Debug, Deserialize)]
struct PaypalVerifyResponse {
    verification_status: String,
}

#[derive(Debug, Deserialize)]
struct PaypalWebhookEvent {
    id: Option<String>,
    event_type: String,
    #[serde(default)]
    resource: Value,
}

impl PaypalGateway {
    pub fn new(
        client_id: String,
        client_secret: String,
        webhook_id: String,
        api_base: String,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client_id,
            client_secret,
            webhook_id,
            api_base,
            client,
            max_retries,
            token: RwLock::new(None),
        }
    }

    /// Returns a cached OAuth token, refreshing it when it is within a
    /// minute of expiry. Double-checked so concurrent callers refresh once.
    async fn access_token(&self) -> Result<String, ServiceError> {
        {
            let guard = self.token.read().await;
            if let Some(token) = guard.as_ref() {
                if token.expires_at > Utc::now() {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let mut guard = self.token.write().await;
        if let Some(token) = guard.as_ref() {
            if token.expires_at > Utc::now() {
                return Ok(token.access_token.clone());
            }
        }

        let request = self
            .client
            .post(format!("{}/v1/oauth2/token", self.api_base))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")]);
        let response = send_with_retry(request, PaymentProvider::Paypal, self.max_retries).await?;
        if !response.status().is_success() {
            return Err(ServiceError::GatewayError {
                provider: "paypal".to_string(),
                message: format!("token endpoint returned {}", response.status()),
                retryable: false,
            });
        }
        let token: PaypalTokenResponse =
            response.json().await.map_err(|e| ServiceError::GatewayError {
                provider: "paypal".to_string(),
                message: format!("unexpected token payload: {}", e),
                retryable: false,
            })?;

        let expires_at =
            Utc::now() + chrono::Duration::seconds(token.expires_in.saturating_sub(60) as i64);
        *guard = Some(CachedToken {
            access_token: token.access_token.clone(),
            expires_at,
        });
        Ok(token.access_token)
    }

    async fn execute_order_request(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<PaymentIntent, ServiceError> {
        let response = send_with_retry(request, PaymentProvider::Paypal, self.max_retries).await?;
        let status = response.status();
        let raw: Value = response.json().await.unwrap_or_default();

        if status.is_success() {
            let order: PaypalOrderResponse =
                serde_json::from_value(raw.clone()).map_err(|e| ServiceError::GatewayError {
                    provider: "paypal".to_string(),
                    message: format!("unexpected order payload: {}", e),
                    retryable: false,
                })?;
            return Ok(normalize_order(order, raw));
        }

        Err(error_from_response(status, raw))
    }

    async fn fetch_order(&self, order_id: &str) -> Result<PaypalOrderResponse, ServiceError> {
        let token = self.access_token().await?;
        let request = self
            .client
            .get(format!("{}/v2/checkout/orders/{}", self.api_base, order_id))
            .bearer_auth(&token);
        let response = send_with_retry(request, PaymentProvider::Paypal, self.max_retries).await?;
        let status = response.status();
        let raw: Value = response.json().await.unwrap_or_default();
        if !status.is_success() {
            return Err(error_from_response(status, raw));
        }
        serde_json::from_value(raw).map_err(|e| ServiceError::GatewayError {
            provider: "paypal".to_string(),
            message: format!("unexpected order payload: {}", e),
            retryable: false,
        })
    }
}

#[async_trait]
impl PaymentGateway for PaypalGateway {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Paypal
    }

    #[instrument(skip(self, request), fields(order_number = %request.order_number))]
    async fn create_intent(&self, request: &CreateIntent) -> Result<PaymentIntent, ServiceError> {
        let token = self.access_token().await?;
        let body = serde_json::json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": request.order_number,
                "invoice_id": request.order_number,
                "custom_id": request.order_id,
                "amount": {
                    "currency_code": request.currency,
                    "value": to_major_units(request.amount, &request.currency),
                }
            }]
        });

        let builder = self
            .client
            .post(format!("{}/v2/checkout/orders", self.api_base))
            .bearer_auth(&token)
            .header("PayPal-Request-Id", &request.idempotency_key)
            .json(&body);

        let intent = self.execute_order_request(builder).await?;
        info!(
            order_id = %intent.provider_intent_id,
            status = ?intent.status,
            "Created PayPal order"
        );
        Ok(intent)
    }

    #[instrument(skip(self))]
    async fn retrieve(&self, provider_intent_id: &str) -> Result<PaymentIntent, ServiceError> {
        let token = self.access_token().await?;
        let builder = self
            .client
            .get(format!(
                "{}/v2/checkout/orders/{}",
                self.api_base, provider_intent_id
            ))
            .bearer_auth(&token);
        self.execute_order_request(builder).await
    }

    #[instrument(skip(self))]
    async fn confirm(&self, provider_intent_id: &str) -> Result<PaymentIntent, ServiceError> {
        let token = self.access_token().await?;
        let builder = self
            .client
            .post(format!(
                "{}/v2/checkout/orders/{}/capture",
                self.api_base, provider_intent_id
            ))
            .bearer_auth(&token)
            .json(&serde_json::json!({}));
        self.execute_order_request(builder).await
    }

    /// Refunds go against the capture, not the order, so this first looks
    /// the capture up on the order it was asked to refund.
    #[instrument(skip(self))]
    async fn refund(
        &self,
        provider_reference: &str,
        amount: i64,
        currency: &str,
    ) -> Result<GatewayRefund, ServiceError> {
        let order = self.fetch_order(provider_reference).await?;
        let capture_id = first_capture_id(&order).ok_or_else(|| ServiceError::GatewayError {
            provider: "paypal".to_string(),
            message: format!("order {} has no settled capture to refund", provider_reference),
            retryable: false,
        })?;

        let token = self.access_token().await?;
        let body = serde_json::json!({
            "amount": {
                "currency_code": currency,
                "value": to_major_units(amount, currency),
            }
        });
        let builder = self
            .client
            .post(format!(
                "{}/v2/payments/captures/{}/refund",
                self.api_base, capture_id
            ))
            .bearer_auth(&token)
            .json(&body);

        let response = send_with_retry(builder, PaymentProvider::Paypal, self.max_retries).await?;
        let status = response.status();
        let raw: Value = response.json().await.unwrap_or_default();
        if !status.is_success() {
            return Err(error_from_response(status, raw));
        }

        let refund: PaypalRefundResponse =
            serde_json::from_value(raw.clone()).map_err(|e| ServiceError::GatewayError {
                provider: "paypal".to_string(),
                message: format!("unexpected refund payload: {}", e),
                retryable: false,
            })?;

        Ok(GatewayRefund {
            provider_refund_id: refund.id,
            status: map_refund_status(refund.status.as_deref()),
            raw,
        })
    }

    async fn verify_webhook(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
    ) -> Result<GatewayEvent, ServiceError> {
        let header = |name: &str| -> Result<&str, ServiceError> {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| {
                    ServiceError::SignatureError(format!("missing {} header", name))
                })
        };
        let transmission_id = header("paypal-transmission-id")?;
        let transmission_time = header("paypal-transmission-time")?;
        let transmission_sig = header("paypal-transmission-sig")?;
        let cert_url = header("paypal-cert-url")?;
        let auth_algo = header("paypal-auth-algo")?;

        let webhook_event: Value = serde_json::from_slice(raw_body).map_err(|e| {
            ServiceError::ValidationError(format!("invalid webhook payload: {}", e))
        })?;

        let token = self.access_token().await?;
        let verify_body = PaypalVerifyRequest {
            transmission_id,
            transmission_time,
            cert_url,
            transmission_sig,
            auth_algo,
            webhook_id: &self.webhook_id,
            webhook_event: webhook_event.clone(),
        };
        let builder = self
            .client
            .post(format!(
                "{}/v1/notifications/verify-webhook-signature",
                self.api_base
            ))
            .bearer_auth(&token)
            .json(&verify_body);

        let response = send_with_retry(builder, PaymentProvider::Paypal, self.max_retries).await?;
        if !response.status().is_success() {
            return Err(ServiceError::SignatureError(format!(
                "verification endpoint returned {}",
                response.status()
            )));
        }
        let verification: PaypalVerifyResponse =
            response.json().await.map_err(|e| ServiceError::GatewayError {
                provider: "paypal".to_string(),
                message: format!("unexpected verification payload: {}", e),
                retryable: false,
            })?;
        if verification.verification_status != "SUCCESS" {
            return Err(ServiceError::SignatureError(
                "webhook signature verification failed".to_string(),
            ));
        }

        let event: PaypalWebhookEvent = serde_json::from_value(webhook_event.clone())
            .map_err(|e| {
                ServiceError::ValidationError(format!("unexpected webhook shape: {}", e))
            })?;
        let provider_intent_id = order_id_from_event(&event.event_type, &event.resource);
        let kind = match event.event_type.as_str() {
            "PAYMENT.CAPTURE.COMPLETED" | "CHECKOUT.ORDER.COMPLETED" => {
                GatewayEventKind::PaymentSucceeded
            }
            "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED" => {
                GatewayEventKind::PaymentFailed
            }
            other => GatewayEventKind::Ignored(other.to_string()),
        };

        Ok(GatewayEvent {
            event_id: event.id,
            provider_intent_id,
            kind,
            raw: webhook_event,
        })
    }
}

fn normalize_order(order: PaypalOrderResponse, raw: Value) -> PaymentIntent {
    let status = map_order_status(&order.status);
    let client_handle = order
        .links
        .iter()
        .find(|link| link.rel == "approve" || link.rel == "payer-action")
        .and_then(|link| link.href.clone())
        .map(ClientHandle::ApprovalUrl);

    PaymentIntent {
        provider_intent_id: order.id,
        status,
        client_handle,
        failure_reason: None,
        raw,
    }
}

/// APPROVED means the buyer signed off but the merchant capture is still
/// outstanding, so it stays on the action-required side of the fence.
fn map_order_status(status: &str) -> IntentStatus {
    match status {
        "CREATED" | "SAVED" | "PENDING" => IntentStatus::Pending,
        "PAYER_ACTION_REQUIRED" | "APPROVED" => IntentStatus::RequiresAction,
        "COMPLETED" => IntentStatus::Succeeded,
        "VOIDED" => IntentStatus::Cancelled,
        other => {
            warn!(status = other, "Unrecognized PayPal order status");
            IntentStatus::Pending
        }
    }
}

fn map_refund_status(status: Option<&str>) -> RefundStatus {
    match status {
        Some("COMPLETED") => RefundStatus::Succeeded,
        Some("CANCELLED") | Some("FAILED") => RefundStatus::Failed,
        _ => RefundStatus::Processing,
    }
}

fn first_capture_id(order: &PaypalOrderResponse) -> Option<&str> {
    order
        .purchase_units
        .iter()
        .filter_map(|unit| unit.payments.as_ref())
        .flat_map(|payments| payments.captures.iter())
        .map(|capture| capture.id.as_str())
        .next()
}

/// Capture events point back at the checkout order through
/// `supplementary_data.related_ids`; order events carry the id directly.
fn order_id_from_event(event_type: &str, resource: &Value) -> Option<String> {
    let path = if event_type.starts_with("CHECKOUT.ORDER.") {
        resource.get("id")
    } else {
        resource.pointer("/supplementary_data/related_ids/order_id")
    };
    path.and_then(Value::as_str).map(str::to_string)
}

fn error_from_response(status: reqwest::StatusCode, raw: Value) -> ServiceError {
    let error: Option<PaypalErrorResponse> = serde_json::from_value(raw).ok();
    if let Some(error) = error {
        let declined = error.details.iter().any(|detail| {
            detail
                .issue
                .as_deref()
                .is_some_and(|issue| DECLINE_ISSUES.contains(&issue))
        });
        let detail = error
            .details
            .first()
            .and_then(|d| d.description.clone().or_else(|| d.issue.clone()))
            .or(error.message)
            .or(error.name)
            .unwrap_or_else(|| format!("provider returned {}", status));
        if declined {
            return ServiceError::PaymentDeclined {
                provider: "paypal".to_string(),
                message: detail,
            };
        }
        return ServiceError::GatewayError {
            provider: "paypal".to_string(),
            message: format!("{}: {}", status, detail),
            retryable: false,
        };
    }
    ServiceError::GatewayError {
        provider: "paypal".to_string(),
        message: format!("provider returned {}", status),
        retryable: false,
    }
}

/// PayPal takes decimal strings in major units, e.g. 2599 minor USD as
/// "25.99". Zero-decimal currencies pass through unscaled.
fn to_major_units(amount: i64, currency: &str) -> String {
    match currency.to_uppercase().as_str() {
        "JPY" | "KRW" | "VND" | "CLP" | "ISK" | "UGX" => amount.to_string(),
        _ => format!("{}.{:02}", amount / 100, amount % 100),
    }
}
