//! Hard caps on request sizes and per-host state.

use crate::model::Ms;

pub const MAX_HOST_EMAIL_LEN: usize = 320;
pub const MAX_TOKEN_LEN: usize = 512;

/// Holds live for at least one minute and at most a day.
pub const MIN_HOLD_MINUTES: u32 = 1;
pub const MAX_HOLD_MINUTES: u32 = 24 * 60;

pub const MAX_HOLDS_PER_HOST: usize = 10_000;
pub const MAX_SLOTS_PER_HOST: usize = 100_000;

/// Slots returned by one listing when the caller names no limit, and the
/// most it may ask for.
pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_LIMIT: usize = 1_000;

/// 1970-01-01T00:00:00Z .. 9999-12-31T23:59:59.999Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

/// How long an expired hold id keeps answering `Expired` instead of `NotFound`.
pub const EXPIRED_TOMBSTONE_RETENTION_MS: Ms = 3_600_000;

/// Longest accepted request line on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;
