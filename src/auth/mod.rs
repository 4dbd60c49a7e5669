//! Caller authentication and role-based authorization.
//!
//! - [`CredentialVerifier`] turns a bearer credential into an [`Identity`]
//! - [`authorize`] checks an identity against a route's role allow-list
//! - [`UserDirectory`] optionally re-resolves roles from an authoritative source
//! - [`TokenIssuer`] signs credentials for development and tests

mod directory;
mod identity;
mod issuer;
mod role_gate;
mod verifier;

pub use directory::{StaticUserDirectory, UserDirectory};
pub use identity::{Audience, Claims, Identity};
pub use issuer::TokenIssuer;
pub use role_gate::authorize;
pub use verifier::{BEARER_SCHEME, CredentialVerifier, Rejection, VerifierConfig, bearer_token};
