//! Time-ordered identifiers.
//!
//! Every entity in the engine is keyed by a 128-bit UUIDv7: a 48-bit
//! millisecond timestamp prefix followed by random bits. Outbox polling,
//! saga audit ordering and index locality all rely on the timestamp prefix,
//! so the hyphenated string form of two ids compares in creation order.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Generate a new time-ordered identifier.
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

/// Extract the embedded creation timestamp from a v7 identifier.
///
/// Returns `None` for non-v7 ids or timestamps outside the chrono range.
pub fn id_timestamp(id: &Uuid) -> Option<DateTime<Utc>> {
    let (secs, nanos) = id.get_timestamp()?.to_unix();
    DateTime::from_timestamp(secs as i64, nanos)
}
