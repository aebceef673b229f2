//! Deterministic session identifiers.
//!
//! Thread ids are mapped to session ids with a name-based UUID (v5) over a
//! fixed namespace, so the same thread always yields the same session id
//! without any stored state. A reset perturbs the derivation with a salt,
//! which forces a fresh id while keeping the thread id stable.

use uuid::Uuid;

/// Fixed namespace for thread → session derivation. Changing this would
/// orphan every existing worker session.
const SESSION_NAMESPACE: Uuid = Uuid::from_u128(0xa3f1_b2c4_d5e6_7890_abcd_ef12_3456_7890);

/// Derives the session id for a thread.
///
/// Pure and deterministic: identical `(thread_id, salt)` always yields the
/// identical id. An empty salt is the normal case; resets pass a fresh salt
/// (see [`reset_salt`]).
pub fn derive(thread_id: &str, salt: &str) -> String {
    let name = if salt.is_empty() {
        thread_id.to_string()
    } else {
        format!("{thread_id}#{salt}")
    };
    Uuid::new_v5(&SESSION_NAMESPACE, name.as_bytes()).to_string()
}

/// Returns a fresh salt for a session reset.
///
/// Uses the current epoch nanos: unique enough that two resets of the same
/// thread get distinct session ids.
pub fn reset_salt() -> String {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0).to_string()
}
