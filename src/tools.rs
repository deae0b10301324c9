//! Data-generation helpers behind `bookit-admin`.

use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::store::{SlotStore, StoreError};

const HOUR_MS: Ms = 60 * MINUTE_MS;
const DAY_MS: Ms = 24 * HOUR_MS;

/// Start of the UTC day containing `now`.
fn day_start(now: Ms) -> Ms {
    now.div_euclid(DAY_MS) * DAY_MS
}

/// Insert `count` one-hour slots for `host_email` at 09:00 UTC on consecutive
/// days starting tomorrow. Days that are already taken are skipped.
pub async fn seed_slots(
    store: &dyn SlotStore,
    host_email: &str,
    count: u32,
    now: Ms,
) -> Result<Vec<BookedSlot>, StoreError> {
    let first = day_start(now) + DAY_MS + 9 * HOUR_MS;
    let mut seeded = Vec::with_capacity(count as usize);
    for day in 0..Ms::from(count) {
        let start = first + day * DAY_MS;
        match store.insert_if_free(host_email, Span::new(start, start + HOUR_MS)).await {
            Ok(slot) => seeded.push(slot),
            Err(StoreError::Conflict(id)) => debug!("day {day} already taken by slot {id}"),
            Err(e) => return Err(e),
        }
    }
    Ok(seeded)
}

/// A hold request for one hour at 10:00 UTC, `day_offset` days after `now`.
pub fn hold_message(host_email: &str, day_offset: i64, now: Ms) -> HoldRequest {
    let start = day_start(now) + day_offset * DAY_MS + 10 * HOUR_MS;
    HoldRequest {
        host_email: host_email.to_string(),
        start_time: format_instant(start),
        end_time: format_instant(start + HOUR_MS),
        expiration: DEFAULT_HOLD_MINUTES,
    }
}

pub fn offset_time(now: Ms, days: i64, minutes: i64) -> String {
    format_instant(now + days * DAY_MS + minutes * MINUTE_MS)
}

/// Opaque token value. Unique, not a cryptographic secret.
pub fn generate_token() -> String {
    Ulid::new().to_string().to_lowercase()
}
