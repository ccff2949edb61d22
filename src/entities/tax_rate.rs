use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dated tax rate for a billing jurisdiction. Read-only from the
/// orchestrator's perspective. A region row beats a country-only row; rows
/// outside their effective window are skipped; `is_default` rows are the
/// fallback when no dated row matches.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tax_rates")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// ISO 3166 alpha-2, e.g. "US"
    pub country: String,
    /// Subdivision, e.g. "CA"; NULL applies country-wide
    pub region: Option<String>,

    /// Percentage, e.g. 8.5 for 8.5%
    pub percentage: Decimal,

    pub effective_from: DateTime<Utc>,
    /// NULL means open-ended
    pub effective_until: Option<DateTime<Utc>>,

    pub is_default: bool,

    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
