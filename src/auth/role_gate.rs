use std::collections::BTreeSet;

use tracing::info;

use super::identity::Identity;
use crate::failure::Failure;

/// Check that the caller holds at least one of the `required` roles.
///
/// An empty `required` set admits any authenticated caller. A missing
/// identity always fails closed with `Unauthenticated`.
pub fn authorize(identity: Option<&Identity>, required: &BTreeSet<String>) -> Result<(), Failure> {
    let Some(identity) = identity else {
        return Err(Failure::unauthenticated("Bearer credential required"));
    };

    if required.is_empty() || !identity.roles().is_disjoint(required) {
        return Ok(());
    }

    info!(
        subject = %identity.subject(),
        required = ?required,
        "Role check denied"
    );
    Err(Failure::forbidden(
        "Insufficient permissions for this resource",
    ))
}
