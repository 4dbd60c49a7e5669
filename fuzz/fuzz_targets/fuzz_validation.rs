//! Fuzz testing for notification validation.
//!
//! Builds notification requests from arbitrary input and checks that
//! validation never panics and that any accepted request respects the
//! channel allow-list and length limits.
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_validation
//! ```

#![no_main]

use arbitrary::Arbitrary;
use gatehouse::models::NotificationRequest;
use gatehouse::validation::{
    ALLOWED_CHANNELS, MAX_MESSAGE_LENGTH, MAX_RECIPIENT_LENGTH, validate_notification,
};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    channel: String,
    recipient: String,
    message: String,
}

fuzz_target!(|input: Input| {
    let request = NotificationRequest {
        channel: input.channel,
        recipient: input.recipient,
        message: input.message,
    };

    if validate_notification(&request).is_ok() {
        assert!(ALLOWED_CHANNELS.contains(&request.channel.as_str()));
        assert!(request.recipient.trim().len() <= MAX_RECIPIENT_LENGTH);
        assert!(request.message.chars().count() <= MAX_MESSAGE_LENGTH);
    }
});
