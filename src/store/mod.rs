//! Durable state behind the engine: confirmed slots and token values.
//!
//! The engine only talks to the [`SlotStore`] and [`TokenSource`] traits, and
//! always through a [`StoreGateway`] so every call is time-bounded.

mod gateway;
mod wal_store;

pub use gateway::{RetryPolicy, StoreGateway};
pub use wal_store::WalStore;

use async_trait::async_trait;

use crate::model::{BookedSlot, SlotId, Span};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The interval overlaps this confirmed slot.
    Conflict(SlotId),
    LimitExceeded(&'static str),
    /// Timeout or transport/IO failure. The outcome of a write is unknown.
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict(id) => write!(f, "conflict with confirmed slot {id}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::Unavailable(msg) => write!(f, "storage unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Confirmed slots, per host, with half-open overlap semantics.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Confirmed slots of `host_email` intersecting `span`, ordered by start.
    async fn query_overlap(
        &self,
        host_email: &str,
        span: Span,
    ) -> Result<Vec<BookedSlot>, StoreError>;

    /// Check and insert as one atomic unit. Losers of a race get `Conflict`.
    async fn insert_if_free(&self, host_email: &str, span: Span) -> Result<BookedSlot, StoreError>;

    /// Delete a confirmed slot. `Ok(None)` if no such slot exists.
    async fn remove(&self, id: SlotId) -> Result<Option<BookedSlot>, StoreError>;

    async fn get(&self, id: SlotId) -> Result<Option<BookedSlot>, StoreError>;

    /// All slots of a host ordered by start, optionally only those overlapping `window`.
    async fn slots_for_host(
        &self,
        host_email: &str,
        window: Option<Span>,
    ) -> Result<Vec<BookedSlot>, StoreError>;
}

/// Read-only lookup of credential values.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// The most recently issued schedule token of a host.
    async fn schedule_token(&self, host_email: &str) -> Result<Option<String>, StoreError>;

    async fn api_tokens(&self) -> Result<Vec<String>, StoreError>;
}
