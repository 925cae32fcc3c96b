//! Small shared helpers.

use uuid::Uuid;

/// Generate a unique id with the given prefix, e.g. `msg_3f2a...`.
#[must_use]
pub fn generate_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

/// Generate a bare random 128-bit id in lowercase hex.
#[must_use]
pub fn random_hex() -> String {
    Uuid::new_v4().simple().to_string()
}
