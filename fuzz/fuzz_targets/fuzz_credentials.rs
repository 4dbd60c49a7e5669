//! Fuzz testing for credential parsing.
//!
//! Feeds arbitrary `Authorization` header values through bearer extraction
//! and credential verification. Neither may panic, and nothing built from
//! random bytes should ever verify.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_credentials
//! cargo +nightly fuzz run fuzz_credentials -- -max_total_time=60
//! ```

#![no_main]

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use gatehouse::auth::{CredentialVerifier, VerifierConfig, bearer_token};
use gatehouse::clock::ManualClock;
use libfuzzer_sys::fuzz_target;

static VERIFIER: LazyLock<CredentialVerifier> = LazyLock::new(|| {
    let config = VerifierConfig {
        secret: "fuzzing-secret-that-is-long-enough-for-hs256".to_string(),
        issuer: Some("gatehouse".to_string()),
        audience: None,
        leeway: Duration::from_secs(30),
    };
    CredentialVerifier::new(&config, Arc::new(ManualClock::from_millis(1_705_315_800_000)))
});

fuzz_target!(|data: &[u8]| {
    let Ok(header) = std::str::from_utf8(data) else {
        return;
    };

    if let Some(token) = bearer_token(header) {
        assert!(!token.is_empty());
        assert!(VERIFIER.verify(token).is_err());
    }

    assert!(VERIFIER.verify(header).is_err());
});
