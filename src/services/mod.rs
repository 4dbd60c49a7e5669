//! Demo dependencies guarded by the pipeline.

mod notifier;
mod reports;

pub use notifier::{LogNotifier, Notification, NotificationService, Notifier, WebhookNotifier};
pub use reports::ReportStore;
