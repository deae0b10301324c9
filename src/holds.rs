//! Transient registry of provisional holds, partitioned by host.
//!
//! Every operation on a host's holds runs under that host's mutex, which is
//! also held across the overlap check against confirmed slots and the commit.
//! Expiry is decided by comparing `deadline` with the clock at the moment of
//! use; the reaper only reclaims memory earlier.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use ulid::Ulid;

use crate::clock::Clock;
use crate::engine::{BookingError, Occupant};
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::store::StoreGateway;

/// Holds of one host, sorted by `span.start`. Unlike confirmed slots, holds
/// of a host may overlap once one of them has expired, so scans are linear
/// over the prefix that starts before the query end.
#[derive(Debug, Default)]
pub struct HostHolds {
    holds: Vec<Hold>,
    /// Expired hold id -> deadline. Kept for `EXPIRED_TOMBSTONE_RETENTION_MS`
    /// past the deadline.
    tombstones: HashMap<Ulid, Ms>,
}

impl HostHolds {
    /// Move expired holds to tombstones and forget tombstones past retention.
    /// Returns (expired now, tombstones dropped).
    fn evict_expired(&mut self, now: Ms) -> (Vec<Ulid>, Vec<Ulid>) {
        let mut expired = Vec::new();
        let tombstones = &mut self.tombstones;
        self.holds.retain(|h| {
            if h.is_expired(now) {
                expired.push(h.id);
                tombstones.insert(h.id, h.deadline);
                false
            } else {
                true
            }
        });
        let mut dropped = Vec::new();
        self.tombstones.retain(|id, at| {
            if *at + EXPIRED_TOMBSTONE_RETENTION_MS <= now {
                dropped.push(*id);
                false
            } else {
                true
            }
        });
        (expired, dropped)
    }

    fn live_conflict(&self, span: &Span, now: Ms) -> Option<Ulid> {
        let right = self.holds.partition_point(|h| h.span.start < span.end);
        self.holds[..right]
            .iter()
            .find(|h| h.is_live(now) && h.span.overlaps(span))
            .map(|h| h.id)
    }

    fn insert(&mut self, hold: Hold) {
        let pos = self.holds.partition_point(|h| h.span.start <= hold.span.start);
        self.holds.insert(pos, hold);
    }

    fn take(&mut self, id: Ulid) -> Option<Hold> {
        let pos = self.holds.iter().position(|h| h.id == id)?;
        Some(self.holds.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.holds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holds.is_empty() && self.tombstones.is_empty()
    }
}

/// Exclusive access to one host's holds.
pub struct HostLock {
    host_email: String,
    guard: OwnedMutexGuard<HostHolds>,
}

pub struct HoldRegistry {
    hosts: DashMap<String, Arc<Mutex<HostHolds>>>,
    hold_to_host: DashMap<Ulid, String>,
    clock: Arc<dyn Clock>,
}

impl HoldRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            hosts: DashMap::new(),
            hold_to_host: DashMap::new(),
            clock,
        }
    }

    pub async fn lock_host(&self, host_email: &str) -> HostLock {
        let slot = self
            .hosts
            .entry(host_email.to_string())
            .or_default()
            .clone();
        HostLock {
            host_email: host_email.to_string(),
            guard: slot.lock_owned().await,
        }
    }

    /// Evict expired holds of the locked host as of `now`.
    fn expire_locked(&self, lock: &mut HostLock, now: Ms) {
        let (expired, dropped) = lock.guard.evict_expired(now);
        if !expired.is_empty() {
            debug!("expired {} hold(s) of {}", expired.len(), lock.host_email);
            metrics::counter!(observability::HOLDS_EXPIRED_TOTAL).increment(expired.len() as u64);
            metrics::gauge!(observability::HOLDS_LIVE).decrement(expired.len() as f64);
        }
        for id in dropped {
            self.hold_to_host.remove(&id);
        }
    }

    /// Register a hold on `span` unless it overlaps a live hold or a
    /// confirmed slot of the same host.
    pub async fn place(
        &self,
        store: &StoreGateway,
        host_email: &str,
        span: Span,
        ttl: Ms,
    ) -> Result<Hold, BookingError> {
        let mut lock = self.lock_host(host_email).await;
        let now = self.clock.now_ms();
        self.expire_locked(&mut lock, now);

        if let Some(id) = lock.guard.live_conflict(&span, now) {
            metrics::counter!(observability::HOLDS_REJECTED_TOTAL, "reason" => "hold").increment(1);
            return Err(BookingError::Conflict(Occupant::Hold(id)));
        }
        if lock.guard.len() >= MAX_HOLDS_PER_HOST {
            return Err(BookingError::LimitExceeded("too many holds for host"));
        }
        let booked = store.query_overlap(host_email, span).await?;
        if let Some(slot) = booked.first() {
            metrics::counter!(observability::HOLDS_REJECTED_TOTAL, "reason" => "slot").increment(1);
            return Err(BookingError::Conflict(Occupant::Slot(slot.id)));
        }

        let hold = Hold {
            id: Ulid::new(),
            host_email: host_email.to_string(),
            span,
            deadline: now + ttl,
            consumed: false,
        };
        lock.guard.insert(hold.clone());
        self.hold_to_host.insert(hold.id, host_email.to_string());
        metrics::counter!(observability::HOLDS_PLACED_TOTAL).increment(1);
        metrics::gauge!(observability::HOLDS_LIVE).increment(1.0);
        Ok(hold)
    }

    /// Take a live hold out of the locked host and return it marked consumed.
    pub fn consume_locked(&self, lock: &mut HostLock, id: Ulid) -> Result<Hold, BookingError> {
        let now = self.clock.now_ms();
        self.expire_locked(lock, now);
        match lock.guard.take(id) {
            Some(mut hold) => {
                hold.consumed = true;
                self.hold_to_host.remove(&id);
                metrics::gauge!(observability::HOLDS_LIVE).decrement(1.0);
                Ok(hold)
            }
            None if lock.guard.tombstones.contains_key(&id) => Err(BookingError::Expired(id)),
            None => Err(BookingError::HoldNotFound(id)),
        }
    }

    pub async fn consume(&self, id: Ulid, host_email: &str) -> Result<Hold, BookingError> {
        let mut lock = self.lock_host(host_email).await;
        self.consume_locked(&mut lock, id)
    }

    /// Drop a hold. Unknown, expired and already consumed ids succeed too.
    /// Returns whether a live hold was removed.
    pub async fn release(&self, id: Ulid) -> bool {
        let Some(host) = self.hold_to_host.get(&id).map(|h| h.value().clone()) else {
            return false;
        };
        let mut lock = self.lock_host(&host).await;
        self.hold_to_host.remove(&id);
        lock.guard.tombstones.remove(&id);
        let now = self.clock.now_ms();
        match lock.guard.take(id) {
            Some(hold) if hold.is_expired(now) => {
                metrics::counter!(observability::HOLDS_EXPIRED_TOTAL).increment(1);
                metrics::gauge!(observability::HOLDS_LIVE).decrement(1.0);
                false
            }
            Some(_) => {
                metrics::counter!(observability::HOLDS_RELEASED_TOTAL).increment(1);
                metrics::gauge!(observability::HOLDS_LIVE).decrement(1.0);
                true
            }
            None => false,
        }
    }

    /// Live holds of a host, ordered by start.
    pub async fn holds_for_host(&self, host_email: &str) -> Vec<Hold> {
        let Some(slot) = self.hosts.get(host_email).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let now = self.clock.now_ms();
        let guard = slot.lock().await;
        guard.holds.iter().filter(|h| h.is_live(now)).cloned().collect()
    }

    /// Evict expired holds across all hosts. Hosts whose lock is busy are
    /// skipped; their next operation expires them lazily anyway.
    /// Returns the number of holds expired by this sweep.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut total = 0;
        let entries: Vec<(String, Arc<Mutex<HostHolds>>)> = self
            .hosts
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (host_email, slot) in entries {
            let Ok(guard) = slot.clone().try_lock_owned() else {
                continue;
            };
            let mut lock = HostLock { host_email, guard };
            let before = lock.guard.len();
            self.expire_locked(&mut lock, now);
            total += before - lock.guard.len();
        }
        // An entry whose Arc is only held by the map has no waiter and no holder.
        self.hosts.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || slot.try_lock().map_or(true, |g| !g.is_empty())
        });
        total
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}
