//! Coupon validation and the shared redemption ledger.
//!
//! The ledger is a single counter column guarded by conditional updates.
//! Nothing else may touch `redemption_count`: every increment races every
//! other checkout for the same code, and the `WHERE` clause is what keeps
//! the counter inside `max_redemptions`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, Condition, ConnectionTrait, EntityTrait, QueryFilter};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::coupon::{self, Column, CouponKind, CouponStatus, Entity as Coupon};
use crate::errors::ServiceError;

#[derive(Clone)]
pub struct CouponService {
    db: Arc<DbPool>,
}

impl CouponService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// Looks a coupon up by code and checks that it currently applies.
    /// Read-only: the redemption counter is only claimed at completion
    /// time, through [`CouponService::redeem`].
    #[instrument(skip(self))]
    pub async fn validate(
        &self,
        code: &str,
        currency: &str,
        now: DateTime<Utc>,
    ) -> Result<coupon::Model, ServiceError> {
        let normalized = code.trim().to_uppercase();
        let coupon = Coupon::find()
            .filter(Column::Code.eq(normalized.clone()))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| {
                ServiceError::CouponNotApplicable(format!("unknown coupon code {}", normalized))
            })?;
        check_applicability(&coupon, currency, now)?;
        Ok(coupon)
    }

    /// Claims one redemption. The increment and the limit check are a
    /// single conditional UPDATE, so concurrent claims on the last slot
    /// leave exactly one winner; everyone else gets `CouponExhausted`.
    ///
    /// Takes any connection so it can run inside the caller's transaction.
    pub async fn redeem<C>(&self, conn: &C, coupon_id: Uuid) -> Result<(), ServiceError>
    where
        C: ConnectionTrait,
    {
        let result = Coupon::update_many()
            .col_expr(
                Column::RedemptionCount,
                Expr::col(Column::RedemptionCount).add(1),
            )
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::Id.eq(coupon_id))
            .filter(
                Condition::any()
                    .add(Column::MaxRedemptions.is_null())
                    .add(
                        Expr::col(Column::RedemptionCount)
                            .lt(Expr::col(Column::MaxRedemptions)),
                    ),
            )
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::CouponExhausted);
        }
        Ok(())
    }

    /// Returns one redemption to the pool, used when a fully refunded
    /// order gives its coupon back. Floored at zero: a counter that was
    /// never claimed is left alone rather than driven negative.
    pub async fn release<C>(&self, conn: &C, coupon_id: Uuid) -> Result<(), ServiceError>
    where
        C: ConnectionTrait,
    {
        let result = Coupon::update_many()
            .col_expr(
                Column::RedemptionCount,
                Expr::col(Column::RedemptionCount).sub(1),
            )
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::Id.eq(coupon_id))
            .filter(Expr::col(Column::RedemptionCount).gt(0))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            debug!(%coupon_id, "Coupon counter already at zero, nothing to release");
        }
        Ok(())
    }

    pub async fn get(&self, coupon_id: Uuid) -> Result<Option<coupon::Model>, ServiceError> {
        Coupon::find_by_id(coupon_id)
            .one(self.db.as_ref())
            .await
            .map_err(ServiceError::from)
    }
}

fn check_applicability(
    coupon: &coupon::Model,
    currency: &str,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    if coupon.status != CouponStatus::Active {
        return Err(ServiceError::CouponNotApplicable(format!(
            "coupon {} is {}",
            coupon.code,
            coupon.status.as_str()
        )));
    }
    if let Some(starts_at) = coupon.starts_at {
        if now < starts_at {
            return Err(ServiceError::CouponNotApplicable(format!(
                "coupon {} is not active yet",
                coupon.code
            )));
        }
    }
    if let Some(expires_at) = coupon.expires_at {
        if now >= expires_at {
            return Err(ServiceError::CouponNotApplicable(format!(
                "coupon {} has expired",
                coupon.code
            )));
        }
    }
    if let Some(max) = coupon.max_redemptions {
        // Fast-fail only; the ledger update at completion is authoritative.
        if coupon.redemption_count >= max {
            return Err(ServiceError::CouponExhausted);
        }
    }
    if coupon.kind == CouponKind::Fixed {
        let matches_currency = coupon
            .currency
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(currency));
        if !matches_currency {
            return Err(ServiceError::CouponNotApplicable(format!(
                "coupon {} does not apply to {} orders",
                coupon.code, currency
            )));
        }
    }
    Ok(())
}
