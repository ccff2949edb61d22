//! Tax rate resolution by billing jurisdiction and effective date.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use tracing::instrument;

use crate::db::DbPool;
use crate::entities::tax_rate::{self, Column, Entity as TaxRate};
use crate::errors::ServiceError;

#[derive(Clone)]
pub struct TaxService {
    db: Arc<DbPool>,
}

impl TaxService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// Resolves the tax rate for a billing address at a point in time.
    ///
    /// Candidates are the country's rows whose region matches the billing
    /// region or applies country-wide. A region match beats a country-wide
    /// row; a dated match (`effective_from <= as_of < effective_until`,
    /// open-ended when unset) beats the jurisdiction default. `None` means
    /// the order is simply untaxed.
    #[instrument(skip(self))]
    pub async fn resolve(
        &self,
        country: &str,
        region: Option<&str>,
        as_of: DateTime<Utc>,
    ) -> Result<Option<tax_rate::Model>, ServiceError> {
        let mut query = TaxRate::find().filter(Column::Country.eq(country));
        query = match region {
            Some(region) => {
                query.filter(Column::Region.eq(region).or(Column::Region.is_null()))
            }
            None => query.filter(Column::Region.is_null()),
        };
        let candidates = query.all(self.db.as_ref()).await?;
        Ok(pick_rate(candidates, as_of))
    }
}

/// Selection over pre-filtered candidates. Region-specific rows outrank
/// country-wide ones; within a rank the most recently effective row wins.
fn pick_rate(candidates: Vec<tax_rate::Model>, as_of: DateTime<Utc>) -> Option<tax_rate::Model> {
    let in_window = |rate: &tax_rate::Model| {
        rate.effective_from <= as_of
            && rate.effective_until.map_or(true, |until| as_of < until)
    };
    let specificity = |rate: &tax_rate::Model| i32::from(rate.region.is_some());

    let mut dated: Vec<&tax_rate::Model> =
        candidates.iter().filter(|rate| in_window(rate)).collect();
    dated.sort_by(|a, b| {
        specificity(b)
            .cmp(&specificity(a))
            .then(b.effective_from.cmp(&a.effective_from))
    });
    if let Some(best) = dated.first() {
        return Some((*best).clone());
    }

    let mut defaults: Vec<&tax_rate::Model> =
        candidates.iter().filter(|rate| rate.is_default).collect();
    defaults.sort_by(|a, b| specificity(b).cmp(&specificity(a)));
    defaults.first().map(|rate| (*rate).clone())
}
