pub mod orders;
pub mod webhooks;

pub use orders::order_routes;
pub use webhooks::webhook_routes;
