//! Stripe adapter: two-step create-then-confirm against the PaymentIntents
//! API, webhook authentication via the `Stripe-Signature` HMAC scheme.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use http::HeaderMap;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{info, instrument, warn};

use super::{
    constant_time_eq, send_with_retry, ClientHandle, CreateIntent, GatewayEvent, GatewayEventKind,
    GatewayRefund, IntentStatus, PaymentGateway, PaymentIntent,
};
use crate::entities::order::PaymentProvider;
use crate::entities::refund::RefundStatus;
use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

pub struct StripeGateway {
    secret_key: String,
    webhook_secret: String,
    api_base: String,
    client: reqwest::Client,
    max_retries: u32,
    webhook_tolerance_secs: u64,
}

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    status: String,
    client_secret: Option<String>,
    last_payment_error: Option<StripeApiError>,
}

#[derive(Debug, Deserialize)]
struct StripeApiError {
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<String>,
    decline_code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeApiError,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: Value,
}

impl StripeGateway {
    pub fn new(
        secret_key: String,
        webhook_secret: String,
        api_base: String,
        timeout: Duration,
        max_retries: u32,
        webhook_tolerance_secs: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            secret_key,
            webhook_secret,
            api_base,
            client,
            max_retries,
            webhook_tolerance_secs,
        }
    }

    /// Sends a PaymentIntents request and normalizes the response, turning
    /// card errors into [`ServiceError::PaymentDeclined`].
    async fn execute_intent_request(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<PaymentIntent, ServiceError> {
        let response = send_with_retry(request, PaymentProvider::Stripe, self.max_retries).await?;
        let status = response.status();
        let raw: Value = response.json().await.unwrap_or_default();

        if status.is_success() {
            let intent: StripePaymentIntent =
                serde_json::from_value(raw.clone()).map_err(|e| ServiceError::GatewayError {
                    provider: "stripe".to_string(),
                    message: format!("unexpected payment_intent payload: {}", e),
                    retryable: false,
                })?;
            return Ok(normalize_intent(intent, raw));
        }

        Err(error_from_response(status, raw))
    }

    fn intents_url(&self, suffix: &str) -> String {
        format!("{}/v1/payment_intents{}", self.api_base, suffix)
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Stripe
    }

    #[instrument(skip(self, request), fields(order_number = %request.order_number))]
    async fn create_intent(&self, request: &CreateIntent) -> Result<PaymentIntent, ServiceError> {
        let mut params: HashMap<String, String> = HashMap::new();
        params.insert("amount".to_string(), request.amount.to_string());
        params.insert("currency".to_string(), request.currency.to_lowercase());
        params.insert(
            "automatic_payment_methods[enabled]".to_string(),
            "true".to_string(),
        );
        params.insert("metadata[order_id]".to_string(), request.order_id.to_string());
        params.insert(
            "metadata[order_number]".to_string(),
            request.order_number.clone(),
        );
        for (key, value) in &request.metadata {
            params.insert(format!("metadata[{}]", key), value.clone());
        }

        let builder = self
            .client
            .post(self.intents_url(""))
            .basic_auth(&self.secret_key, Some(""))
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&params);

        let intent = self.execute_intent_request(builder).await?;
        info!(
            intent_id = %intent.provider_intent_id,
            status = ?intent.status,
            "Created Stripe payment intent"
        );
        Ok(intent)
    }

    #[instrument(skip(self))]
    async fn retrieve(&self, provider_intent_id: &str) -> Result<PaymentIntent, ServiceError> {
        let builder = self
            .client
            .get(self.intents_url(&format!("/{}", provider_intent_id)))
            .basic_auth(&self.secret_key, Some(""));
        self.execute_intent_request(builder).await
    }

    #[instrument(skip(self))]
    async fn confirm(&self, provider_intent_id: &str) -> Result<PaymentIntent, ServiceError> {
        let params: HashMap<String, String> = HashMap::new();
        let builder = self
            .client
            .post(self.intents_url(&format!("/{}/confirm", provider_intent_id)))
            .basic_auth(&self.secret_key, Some(""))
            .form(&params);
        self.execute_intent_request(builder).await
    }

    #[instrument(skip(self))]
    async fn refund(
        &self,
        provider_reference: &str,
        amount: i64,
        _currency: &str,
    ) -> Result<GatewayRefund, ServiceError> {
        let mut params: HashMap<String, String> = HashMap::new();
        params.insert("payment_intent".to_string(), provider_reference.to_string());
        params.insert("amount".to_string(), amount.to_string());

        let builder = self
            .client
            .post(format!("{}/v1/refunds", self.api_base))
            .basic_auth(&self.secret_key, Some(""))
            .form(&params);

        let response = send_with_retry(builder, PaymentProvider::Stripe, self.max_retries).await?;
        let status = response.status();
        let raw: Value = response.json().await.unwrap_or_default();

        if !status.is_success() {
            return Err(error_from_response(status, raw));
        }

        let refund: StripeRefund =
            serde_json::from_value(raw.clone()).map_err(|e| ServiceError::GatewayError {
                provider: "stripe".to_string(),
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
        let signature_header = headers
            .get("Stripe-Signature")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                ServiceError::SignatureError("missing Stripe-Signature header".to_string())
            })?;

        let mut timestamp = "";
        let mut signature = "";
        for part in signature_header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value,
                Some(("v1", value)) => signature = value,
                _ => {}
            }
        }
        if timestamp.is_empty() || signature.is_empty() {
            return Err(ServiceError::SignatureError(
                "malformed Stripe-Signature header".to_string(),
            ));
        }

        let timestamp: i64 = timestamp.parse().map_err(|_| {
            ServiceError::SignatureError("non-numeric signature timestamp".to_string())
        })?;
        let age = (chrono::Utc::now().timestamp() - timestamp).unsigned_abs();
        if age > self.webhook_tolerance_secs {
            return Err(ServiceError::SignatureError(
                "signature timestamp outside tolerance".to_string(),
            ));
        }

        let payload = std::str::from_utf8(raw_body).map_err(|_| {
            ServiceError::SignatureError("webhook body is not valid UTF-8".to_string())
        })?;
        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(format!("webhook secret unusable: {}", e)))?;
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());
        if !constant_time_eq(&expected, signature) {
            return Err(ServiceError::SignatureError(
                "signature mismatch".to_string(),
            ));
        }

        let raw: Value = serde_json::from_slice(raw_body).map_err(|e| {
            ServiceError::ValidationError(format!("invalid webhook payload: {}", e))
        })?;
        let event: StripeEvent =
            serde_json::from_value(raw.clone()).map_err(|e| ServiceError::ValidationError(
                format!("unexpected webhook shape: {}", e),
            ))?;

        let provider_intent_id = event
            .data
            .object
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let kind = match event.event_type.as_str() {
            "payment_intent.succeeded" => GatewayEventKind::PaymentSucceeded,
            "payment_intent.payment_failed" | "payment_intent.canceled" => {
                GatewayEventKind::PaymentFailed
            }
            other => GatewayEventKind::Ignored(other.to_string()),
        };

        Ok(GatewayEvent {
            event_id: Some(event.id),
            provider_intent_id,
            kind,
            raw,
        })
    }
}

fn normalize_intent(intent: StripePaymentIntent, raw: Value) -> PaymentIntent {
    let declined = intent.status == "requires_payment_method" && intent.last_payment_error.is_some();
    let status = if declined {
        IntentStatus::Declined
    } else {
        map_intent_status(&intent.status)
    };
    let failure_reason = intent.last_payment_error.as_ref().map(decline_message);

    PaymentIntent {
        provider_intent_id: intent.id,
        status,
        client_handle: intent.client_secret.map(ClientHandle::ClientSecret),
        failure_reason,
        raw,
    }
}

fn map_intent_status(status: &str) -> IntentStatus {
    match status {
        "requires_payment_method" | "requires_confirmation" => IntentStatus::Pending,
        "requires_action" | "requires_capture" => IntentStatus::RequiresAction,
        "processing" => IntentStatus::Processing,
        "succeeded" => IntentStatus::Succeeded,
        "canceled" => IntentStatus::Cancelled,
        other => {
            warn!(status = other, "Unrecognized Stripe intent status");
            IntentStatus::Pending
        }
    }
}

fn map_refund_status(status: Option<&str>) -> RefundStatus {
    match status {
        Some("succeeded") => RefundStatus::Succeeded,
        Some("failed") | Some("canceled") => RefundStatus::Failed,
        _ => RefundStatus::Processing,
    }
}

fn decline_message(error: &StripeApiError) -> String {
    error
        .message
        .clone()
        .or_else(|| error.decline_code.clone())
        .or_else(|| error.code.clone())
        .unwrap_or_else(|| "payment declined".to_string())
}

fn error_from_response(status: reqwest::StatusCode, raw: Value) -> ServiceError {
    let envelope: Option<StripeErrorEnvelope> = serde_json::from_value(raw).ok();
    if let Some(envelope) = envelope {
        if envelope.error.error_type.as_deref() == Some("card_error") {
            return ServiceError::PaymentDeclined {
                provider: "stripe".to_string(),
                message: decline_message(&envelope.error),
            };
        }
        return ServiceError::GatewayError {
            provider: "stripe".to_string(),
            message: format!("{}: {}", status, decline_message(&envelope.error)),
            retryable: false,
        };
    }
    ServiceError::GatewayError {
        provider: "stripe".to_string(),
        message: format!("provider returned {}", status),
        retryable: false,
    }
}
