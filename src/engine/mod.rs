mod error;
#[cfg(test)]
mod tests;
mod validate;

pub use error::{BookingError, Occupant};

use std::sync::Arc;

use tracing::{debug, info};
use ulid::Ulid;

use crate::auth::TokenAuthority;
use crate::clock::Clock;
use crate::config::EngineSettings;
use crate::holds::HoldRegistry;
use crate::limits::{DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT, MAX_TOKEN_LEN};
use crate::model::*;
use crate::observability;
use crate::store::{SlotStore, StoreGateway, TokenSource};

pub(crate) use validate::parse_timestamp;
use validate::{validate_host, validate_span, validate_ttl};

/// The public booking protocol: hold, confirm, release, and the slot
/// maintenance calls around them.
///
/// Every call verifies the api token first; calls that touch a host's
/// confirmed slots also verify that host's schedule token.
pub struct BookingService {
    store: Arc<StoreGateway>,
    holds: Arc<HoldRegistry>,
    auth: TokenAuthority,
}

impl BookingService {
    pub fn new(
        slots: Arc<dyn SlotStore>,
        tokens: Arc<dyn TokenSource>,
        clock: Arc<dyn Clock>,
        settings: &EngineSettings,
    ) -> Self {
        let store = Arc::new(StoreGateway::new(slots, tokens, settings.retry_policy()));
        let holds = Arc::new(HoldRegistry::new(clock.clone()));
        let auth = TokenAuthority::new(store.clone(), clock, settings.token_cache_ttl);
        Self { store, holds, auth }
    }

    /// Shared with the reaper.
    pub fn holds(&self) -> Arc<HoldRegistry> {
        self.holds.clone()
    }

    async fn authorize_api(&self, api_token: &str) -> Result<(), BookingError> {
        if api_token.len() > MAX_TOKEN_LEN {
            return Err(BookingError::LimitExceeded("token too long"));
        }
        match self.auth.verify_api_token(api_token).await? {
            true => Ok(()),
            false => Err(BookingError::Unauthorized("api token")),
        }
    }

    async fn authorize_schedule(
        &self,
        host_email: &str,
        schedule_token: &str,
    ) -> Result<(), BookingError> {
        if schedule_token.len() > MAX_TOKEN_LEN {
            return Err(BookingError::LimitExceeded("token too long"));
        }
        match self.auth.verify_schedule_token(host_email, schedule_token).await? {
            true => Ok(()),
            false => Err(BookingError::Unauthorized("schedule token")),
        }
    }

    /// Place a hold on `[start, end)` for `ttl` milliseconds. The host must
    /// be registered.
    pub async fn request_hold(
        &self,
        host_email: &str,
        start: Ms,
        end: Ms,
        ttl: Ms,
        api_token: &str,
    ) -> Result<Hold, BookingError> {
        self.authorize_api(api_token).await?;
        validate_host(host_email)?;
        let span = validate_span(start, end)?;
        validate_ttl(ttl)?;
        if !self.auth.host_registered(host_email).await? {
            return Err(BookingError::HostNotFound(host_email.to_string()));
        }

        let hold = self.holds.place(&self.store, host_email, span, ttl).await?;
        debug!("hold {} placed for {host_email} until {}", hold.id, hold.deadline);
        Ok(hold)
    }

    /// Same as [`request_hold`](Self::request_hold), from the message form
    /// with ISO-8601 instants and a TTL in minutes.
    pub async fn request_hold_message(
        &self,
        msg: &HoldRequest,
        api_token: &str,
    ) -> Result<Hold, BookingError> {
        let start = parse_timestamp("startTime", &msg.start_time)?;
        let end = parse_timestamp("endTime", &msg.end_time)?;
        let ttl = minutes_to_ms(msg.expiration);
        self.request_hold(&msg.host_email, start, end, ttl, api_token).await
    }

    /// Promote a live hold into a confirmed slot.
    ///
    /// The host's hold lock is held across consume and the store write, so no
    /// other hold on the host can be placed between the two. If the store
    /// still reports a conflict the hold stays consumed.
    pub async fn confirm(
        &self,
        hold_id: Ulid,
        host_email: &str,
        schedule_token: &str,
        api_token: &str,
    ) -> Result<BookedSlot, BookingError> {
        self.authorize_api(api_token).await?;
        validate_host(host_email)?;
        self.authorize_schedule(host_email, schedule_token).await?;

        let mut lock = self.holds.lock_host(host_email).await;
        let hold = self.holds.consume_locked(&mut lock, hold_id)?;
        let slot = self.store.insert_if_free(host_email, hold.span).await?;
        drop(lock);

        metrics::counter!(observability::BOOKINGS_CONFIRMED_TOTAL).increment(1);
        info!("hold {hold_id} confirmed as slot {} for {host_email}", slot.id);
        Ok(slot)
    }

    /// Drop a hold before confirm or expiry. Succeeds for unknown, expired
    /// and consumed holds alike.
    pub async fn release(&self, hold_id: Ulid, api_token: &str) -> Result<(), BookingError> {
        self.authorize_api(api_token).await?;
        if self.holds.release(hold_id).await {
            debug!("hold {hold_id} released");
        }
        Ok(())
    }

    pub async fn cancel(&self, hold_id: Ulid, api_token: &str) -> Result<(), BookingError> {
        self.release(hold_id, api_token).await
    }

    /// Remove a confirmed slot of `host_email`. A slot owned by another host
    /// is reported as not found.
    pub async fn cancel_slot(
        &self,
        slot_id: SlotId,
        host_email: &str,
        schedule_token: &str,
        api_token: &str,
    ) -> Result<BookedSlot, BookingError> {
        self.authorize_api(api_token).await?;
        validate_host(host_email)?;
        self.authorize_schedule(host_email, schedule_token).await?;

        let lock = self.holds.lock_host(host_email).await;
        match self.store.get_slot(slot_id).await? {
            Some(slot) if slot.host_email == host_email => {}
            _ => return Err(BookingError::SlotNotFound(slot_id)),
        }
        let removed = self
            .store
            .remove(slot_id)
            .await?
            .ok_or(BookingError::SlotNotFound(slot_id))?;
        drop(lock);

        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!("slot {slot_id} of {host_email} cancelled");
        Ok(removed)
    }

    /// Earliest confirmed slots of a host ordered by start, optionally only
    /// those overlapping `window`. At most `limit` slots are returned,
    /// `DEFAULT_LIST_LIMIT` if unset, capped at `MAX_LIST_LIMIT`.
    pub async fn list_slots(
        &self,
        host_email: &str,
        schedule_token: &str,
        api_token: &str,
        window: Option<(Ms, Ms)>,
        limit: Option<usize>,
    ) -> Result<Vec<BookedSlot>, BookingError> {
        self.authorize_api(api_token).await?;
        validate_host(host_email)?;
        self.authorize_schedule(host_email, schedule_token).await?;
        // windows are not subject to the hold width limit
        let window = window
            .map(|(start, end)| {
                Span::checked(start, end).ok_or(BookingError::InvalidInterval { start, end })
            })
            .transpose()?;
        let mut slots = self.store.slots_for_host(host_email, window).await?;
        slots.truncate(limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT));
        Ok(slots)
    }

    /// Live holds of a host. Unauthenticated; for diagnostics and tests.
    pub async fn live_holds(&self, host_email: &str) -> Vec<Hold> {
        self.holds.holds_for_host(host_email).await
    }
}
