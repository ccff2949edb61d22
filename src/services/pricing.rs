//! Order pricing: subtotal, coupon discount, tax on the discounted base,
//! and per-item allocations, all in integer minor units.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::entities::coupon::{self, CouponKind};
use crate::entities::tax_rate;
use crate::errors::ServiceError;

/// One cart line as submitted by the client.
#[derive(Debug, Clone)]
pub struct PricingItem {
    pub name: String,
    /// Minor units of the order currency
    pub unit_amount: i64,
    pub quantity: i32,
}

/// A cart line with its share of the discount and tax attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricedItem {
    pub name: String,
    pub unit_amount: i64,
    pub quantity: i32,
    pub discount_amount: i64,
    pub tax_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingSummary {
    pub subtotal: i64,
    pub discount_total: i64,
    pub tax_total: i64,
    pub total: i64,
    pub items: Vec<PricedItem>,
}

/// Prices a cart in a fixed sequence: subtotal, then the coupon discount,
/// then tax on the discounted base. Rounding is half-up to the nearest
/// minor unit.
///
/// Per-item discount/tax figures are allocated proportionally to each
/// item's share of the subtotal and rounded independently; they are for
/// reporting and never feed back into the order totals.
pub fn price_order(
    items: &[PricingItem],
    coupon: Option<&coupon::Model>,
    tax_rate: Option<&tax_rate::Model>,
    currency: &str,
) -> Result<PricingSummary, ServiceError> {
    if items.is_empty() {
        return Err(ServiceError::ValidationError(
            "order must contain at least one item".to_string(),
        ));
    }
    for item in items {
        if item.unit_amount < 0 {
            return Err(ServiceError::ValidationError(format!(
                "item '{}' has a negative unit amount",
                item.name
            )));
        }
        if item.quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "item '{}' must have a positive quantity",
                item.name
            )));
        }
    }

    let subtotal: i64 = items
        .iter()
        .map(|item| item.unit_amount * i64::from(item.quantity))
        .sum();

    let discount_total = match coupon {
        Some(coupon) => calculate_discount(coupon, subtotal, currency)?,
        None => 0,
    };

    let taxable_base = subtotal - discount_total;
    let tax_total = match tax_rate {
        Some(rate) => round_half_up(
            Decimal::from(taxable_base) * rate.percentage / Decimal::from(100),
        )?,
        None => 0,
    };
    let total = taxable_base + tax_total;

    let items = allocate_per_item(items, subtotal, discount_total, tax_total)?;

    Ok(PricingSummary {
        subtotal,
        discount_total,
        tax_total,
        total,
        items,
    })
}

fn calculate_discount(
    coupon: &coupon::Model,
    subtotal: i64,
    currency: &str,
) -> Result<i64, ServiceError> {
    match coupon.kind {
        CouponKind::Percentage => {
            let discount = round_half_up(
                Decimal::from(subtotal) * coupon.discount_value / Decimal::from(100),
            )?;
            Ok(discount.min(subtotal))
        }
        CouponKind::Fixed => {
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
            let value = round_half_up(coupon.discount_value)?;
            Ok(value.min(subtotal))
        }
    }
}

fn allocate_per_item(
    items: &[PricingItem],
    subtotal: i64,
    discount_total: i64,
    tax_total: i64,
) -> Result<Vec<PricedItem>, ServiceError> {
    let mut priced = Vec::with_capacity(items.len());
    for item in items {
        let line_amount = item.unit_amount * i64::from(item.quantity);
        let (discount_amount, tax_amount) = if subtotal == 0 {
            (0, 0)
        } else {
            let share = Decimal::from(line_amount) / Decimal::from(subtotal);
            (
                round_half_up(Decimal::from(discount_total) * share)?,
                round_half_up(Decimal::from(tax_total) * share)?,
            )
        };
        priced.push(PricedItem {
            name: item.name.clone(),
            unit_amount: item.unit_amount,
            quantity: item.quantity,
            discount_amount,
            tax_amount,
        });
    }
    Ok(priced)
}

fn round_half_up(value: Decimal) -> Result<i64, ServiceError> {
    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| {
            ServiceError::InternalError("amount exceeds representable range".to_string())
        })
}
