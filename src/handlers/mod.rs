mod admin;
mod health;
mod notifications;
mod reports;
mod session;

pub use admin::{close_breaker, stats};
pub use health::{health_check, readiness_check};
pub use notifications::send_notification;
pub use reports::get_report;
pub use session::me;
