mod api;
mod report;

pub use api::{
    BreakerClosedResponse, HealthResponse, NotificationAccepted, NotificationRequest,
    SessionResponse, StatsResponse,
};
pub use report::Report;
