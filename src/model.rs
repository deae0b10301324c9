use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type inside the engine.
pub type Ms = i64;

/// Identifier of a confirmed slot. Allocated from a per-store sequence.
pub type SlotId = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Default hold lifetime in minutes when a request omits `expiration`.
pub const DEFAULT_HOLD_MINUTES: u32 = 10;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Like `new`, but returns `None` for an empty or inverted interval.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A confirmed, durable booking. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookedSlot {
    pub id: SlotId,
    pub host_email: String,
    pub span: Span,
}

/// A provisional claim on an interval that lapses at `deadline`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hold {
    pub id: Ulid,
    pub host_email: String,
    pub span: Span,
    pub deadline: Ms,
    pub consumed: bool,
}

impl Hold {
    pub fn is_expired(&self, now: Ms) -> bool {
        self.deadline <= now
    }

    /// Live holds block new holds and confirms on overlapping intervals.
    pub fn is_live(&self, now: Ms) -> bool {
        !self.consumed && !self.is_expired(now)
    }
}

/// Confirmed slots of one host, sorted by `span.start`.
///
/// Confirmed slots never overlap, so ends are sorted too; that is what lets
/// `overlapping` bound the scan with binary search on both sides.
#[derive(Debug, Clone, Default)]
pub struct HostSlots {
    pub slots: Vec<BookedSlot>,
}

impl HostSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert slot maintaining sort order by span.start.
    pub fn insert(&mut self, slot: BookedSlot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    /// Remove slot by id.
    pub fn remove(&mut self, id: SlotId) -> Option<BookedSlot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(pos))
    }

    pub fn get(&self, id: SlotId) -> Option<&BookedSlot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Return only slots whose span overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &BookedSlot> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        // Everything before left_bound ends at or before query.start.
        let left_bound = self.slots[..right_bound].partition_point(|s| s.span.end <= query.start);
        self.slots[left_bound..right_bound].iter()
    }
}

/// The WAL record format. Flat, one variant per durable mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotBooked {
        id: SlotId,
        host_email: String,
        span: Span,
    },
    SlotCancelled {
        id: SlotId,
        host_email: String,
    },
    ScheduleTokenIssued {
        host_email: String,
        token: String,
    },
    ApiTokenIssued {
        token: String,
    },
    /// Written by compaction so ids of cancelled slots are never reused.
    SequenceFloor {
        next_slot_id: SlotId,
    },
}

// ── Wire shapes ──────────────────────────────────────────────────

/// Hold-request message as produced by clients and the admin tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldRequest {
    pub host_email: String,
    pub start_time: String,
    pub end_time: String,
    /// Hold lifetime in minutes.
    #[serde(default = "default_expiration")]
    pub expiration: u32,
}

fn default_expiration() -> u32 {
    DEFAULT_HOLD_MINUTES
}

/// Confirmed-slot record in its external persisted shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub id: SlotId,
    pub start_time: String,
    pub end_time: String,
    pub host_email: String,
}

impl From<&BookedSlot> for SlotRecord {
    fn from(slot: &BookedSlot) -> Self {
        Self {
            id: slot.id,
            start_time: format_instant(slot.span.start),
            end_time: format_instant(slot.span.end),
            host_email: slot.host_email.clone(),
        }
    }
}

// ── ISO-8601 at the edges ────────────────────────────────────────

/// Accepted non-RFC 3339 layouts. `%#z` takes `+00` as well as `+00:00`.
const INSTANT_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f%#z",
    "%Y-%m-%d %H:%M:%S%.f%#z",
    "%Y-%m-%dT%H:%M%#z",
    "%Y-%m-%d %H:%M%#z",
];

/// Parse an ISO-8601 timestamp carrying a UTC offset into Unix milliseconds.
pub fn parse_instant(s: &str) -> Option<Ms> {
    let s = s.trim();
    let parsed: DateTime<FixedOffset> = DateTime::parse_from_rfc3339(s).ok().or_else(|| {
        INSTANT_FORMATS
            .iter()
            .find_map(|fmt| DateTime::parse_from_str(s, fmt).ok())
    })?;
    Some(parsed.timestamp_millis())
}

/// Format Unix milliseconds as `YYYY-MM-DDTHH:MM:SS+00:00`.
pub fn format_instant(ms: Ms) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S%:z").to_string(),
        None => ms.to_string(),
    }
}

pub fn minutes_to_ms(minutes: u32) -> Ms {
    Ms::from(minutes) * MINUTE_MS
}
