use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    /// Amount reserved locally, gateway not yet called
    #[sea_orm(string_value = "pending")]
    Pending,
    /// Accepted by the provider, settlement outstanding
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "succeeded")]
    Succeeded,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl RefundStatus {
    /// Failed refunds release their reservation; everything else counts
    /// against the refundable balance.
    pub fn holds_amount(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "refunds")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub transaction_id: Uuid,

    /// Externally facing identifier, e.g. "REF-9C07A1B4"
    #[sea_orm(unique)]
    pub refund_number: String,

    pub amount: i64,
    pub status: RefundStatus,

    /// Provider-side refund identifier, set once the provider accepts it
    pub provider_refund_id: Option<String>,

    pub reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::payment_transaction::Entity",
        from = "Column::TransactionId",
        to = "super::payment_transaction::Column::Id"
    )]
    PaymentTransaction,
}

impl Related<super::payment_transaction::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PaymentTransaction.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
