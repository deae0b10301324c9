use ulid::Ulid;

use crate::model::{Ms, SlotId};
use crate::store::StoreError;

/// What a rejected interval collided with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupant {
    Slot(SlotId),
    Hold(Ulid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    InvalidInterval { start: Ms, end: Ms },
    Conflict(Occupant),
    HoldNotFound(Ulid),
    SlotNotFound(SlotId),
    /// No such registered host, i.e. no schedule token was ever issued for it.
    HostNotFound(String),
    Expired(Ulid),
    Unauthorized(&'static str),
    StorageUnavailable(String),
    LimitExceeded(&'static str),
    Malformed(String),
}

impl BookingError {
    /// Stable label used on the wire and in metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BookingError::InvalidInterval { .. } => "InvalidInterval",
            BookingError::Conflict(_) => "Conflict",
            BookingError::HoldNotFound(_)
            | BookingError::SlotNotFound(_)
            | BookingError::HostNotFound(_) => "NotFound",
            BookingError::Expired(_) => "Expired",
            BookingError::Unauthorized(_) => "Unauthorized",
            BookingError::StorageUnavailable(_) => "StorageUnavailable",
            BookingError::LimitExceeded(_) => "LimitExceeded",
            BookingError::Malformed(_) => "Malformed",
        }
    }
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::InvalidInterval { start, end } => {
                write!(f, "invalid interval: end {end} is not after start {start}")
            }
            BookingError::Conflict(Occupant::Slot(id)) => {
                write!(f, "conflict with confirmed slot {id}")
            }
            BookingError::Conflict(Occupant::Hold(id)) => write!(f, "conflict with hold {id}"),
            BookingError::HoldNotFound(id) => write!(f, "hold not found: {id}"),
            BookingError::SlotNotFound(id) => write!(f, "slot not found: {id}"),
            BookingError::HostNotFound(host) => write!(f, "host not found: {host}"),
            BookingError::Expired(id) => write!(f, "hold expired: {id}"),
            BookingError::Unauthorized(what) => write!(f, "unauthorized: invalid {what}"),
            BookingError::StorageUnavailable(e) => write!(f, "storage unavailable: {e}"),
            BookingError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            BookingError::Malformed(msg) => write!(f, "malformed request: {msg}"),
        }
    }
}

impl std::error::Error for BookingError {}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(id) => BookingError::Conflict(Occupant::Slot(id)),
            StoreError::LimitExceeded(msg) => BookingError::LimitExceeded(msg),
            StoreError::Unavailable(msg) => BookingError::StorageUnavailable(msg),
        }
    }
}
