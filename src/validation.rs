use crate::failure::Failure;
use crate::models::NotificationRequest;

// =============================================================================
// Validation Constants
// =============================================================================

/// Channels the notifier knows how to deliver to.
pub const ALLOWED_CHANNELS: [&str; 3] = ["email", "sms", "webhook"];

/// Maximum length for a recipient address.
pub const MAX_RECIPIENT_LENGTH: usize = 254;

/// Maximum length for a message body, in characters.
pub const MAX_MESSAGE_LENGTH: usize = 2000;

/// Validate a notification request, collecting every problem.
///
/// Rules:
/// - `channel` must be one of [`ALLOWED_CHANNELS`]
/// - `recipient` must be non-blank, at most 254 bytes, without whitespace
/// - `message` must be non-blank, at most 2000 characters, and contain no
///   control characters other than newline
///
/// # Errors
///
/// Returns a `ValidationFailed` failure listing each violated rule.
pub fn validate_notification(request: &NotificationRequest) -> Result<(), Failure> {
    let mut errors = Vec::new();

    if !ALLOWED_CHANNELS.contains(&request.channel.as_str()) {
        errors.push(format!(
            "channel '{}' is not supported; expected one of: {}",
            request.channel,
            ALLOWED_CHANNELS.join(", ")
        ));
    }

    let recipient = request.recipient.trim();
    if recipient.is_empty() {
        errors.push("recipient cannot be empty".to_string());
    } else if recipient.len() > MAX_RECIPIENT_LENGTH {
        errors.push(format!(
            "recipient cannot exceed {MAX_RECIPIENT_LENGTH} bytes"
        ));
    } else if recipient.chars().any(char::is_whitespace) {
        errors.push("recipient cannot contain whitespace".to_string());
    }

    if request.message.trim().is_empty() {
        errors.push("message cannot be empty".to_string());
    } else {
        let length = request.message.chars().count();
        if length > MAX_MESSAGE_LENGTH {
            errors.push(format!(
                "message cannot exceed {MAX_MESSAGE_LENGTH} characters (got {length})"
            ));
        }
        if let Some((i, c)) = request
            .message
            .chars()
            .enumerate()
            .find(|(_, c)| c.is_control() && *c != '\n')
        {
            errors.push(format!(
                "message contains control character {:?} at position {i}",
                c
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Failure::validation(errors))
    }
}
