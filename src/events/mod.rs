use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

// Events emitted after a state change has been committed. Consumers must not
// assume ordering across orders, only within one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Order lifecycle
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    OrderCompleted(Uuid),
    OrderCancelled(Uuid),

    // Payment lifecycle
    PaymentIntentCreated {
        order_id: Uuid,
        transaction_id: Uuid,
        provider: String,
    },
    PaymentSucceeded {
        order_id: Uuid,
        transaction_id: Uuid,
    },
    PaymentRequiresAction {
        order_id: Uuid,
        transaction_id: Uuid,
    },
    PaymentFailed {
        order_id: Uuid,
        transaction_id: Uuid,
        reason: Option<String>,
    },

    // Coupons
    CouponRedeemed {
        order_id: Uuid,
        code: String,
    },

    // Refunds
    RefundRequested {
        transaction_id: Uuid,
        refund_id: Uuid,
        amount: i64,
    },
    RefundSucceeded {
        transaction_id: Uuid,
        refund_id: Uuid,
    },
    RefundFailed {
        transaction_id: Uuid,
        refund_id: Uuid,
    },

    // Webhooks: applied=false means the notification was a duplicate or stale
    WebhookProcessed {
        provider: String,
        provider_ref: String,
        applied: bool,
    },

    // Generic event for custom messages
    Generic {
        message: String,
        timestamp: DateTime<Utc>,
        metadata: serde_json::Value,
    },
}

impl Event {
    /// Create a generic event with string data
    pub fn with_data(data: String) -> Self {
        Event::Generic {
            message: data,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }
}

// Drains the event channel and logs every state change. Side effects that
// hang off events (receipt mail, analytics export) belong here, keyed by
// event type, so they never run inside a request transaction.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::PaymentFailed {
                order_id, reason, ..
            } => {
                warn!(
                    order_id = %order_id,
                    reason = reason.as_deref().unwrap_or("unknown"),
                    "Payment failed"
                );
            }
            Event::RefundFailed {
                transaction_id,
                refund_id,
            } => {
                warn!(
                    transaction_id = %transaction_id,
                    refund_id = %refund_id,
                    "Refund failed"
                );
            }
            Event::WebhookProcessed {
                provider,
                provider_ref,
                applied: false,
            } => {
                info!(
                    provider = %provider,
                    provider_ref = %provider_ref,
                    "Webhook ignored (duplicate or stale)"
                );
            }
            other => {
                info!("Event: {:?}", other);
            }
        }
    }

    warn!("Event processing loop has ended");
}
