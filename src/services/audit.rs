//! Append-only audit trail for order state transitions.

use sea_orm::ActiveValue::Set;
use sea_orm::{ActiveModelTrait, ConnectionTrait};
use serde_json::Value;
use uuid::Uuid;

use crate::entities::audit_log;
use crate::errors::ServiceError;

pub const ACTOR_API: &str = "api";
pub const ACTOR_WEBHOOK: &str = "webhook";
pub const ACTOR_SYSTEM: &str = "system";

/// Writes one audit row. Call inside the transaction that performs the
/// transition so the trail commits or rolls back with it.
pub async fn record<C>(
    conn: &C,
    order_id: Option<Uuid>,
    actor: &str,
    event_type: &str,
    payload: Value,
) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    let entry = audit_log::ActiveModel {
        order_id: Set(order_id),
        actor: Set(actor.to_string()),
        event_type: Set(event_type.to_string()),
        payload: Set(payload),
        ..Default::default()
    };
    entry.insert(conn).await?;
    Ok(())
}
