pub mod audit;
pub mod coupons;
pub mod orders;
pub mod pricing;
pub mod taxes;
pub mod webhooks;

pub use coupons::CouponService;
pub use orders::OrderService;
pub use taxes::TaxService;
pub use webhooks::WebhookService;
