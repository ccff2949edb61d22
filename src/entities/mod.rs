pub mod audit_log;
pub mod coupon;
pub mod order;
pub mod order_item;
pub mod payment_transaction;
pub mod refund;
pub mod tax_rate;
