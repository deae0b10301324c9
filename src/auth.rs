//! Token verification for api calls and per-host schedule access.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use constant_time_eq::constant_time_eq;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::warn;

use crate::clock::Clock;
use crate::limits::MAX_TOKEN_LEN;
use crate::model::Ms;
use crate::observability;
use crate::store::{StoreError, StoreGateway};

struct Cached<T> {
    value: T,
    fetched_at: Ms,
}

/// Verifies credentials against the token store.
///
/// Positive lookups are cached for `cache_ttl`. A candidate that does not
/// match the cached value triggers a fresh lookup before it is denied, so a
/// newly issued token is accepted at once and a denial is never cached.
pub struct TokenAuthority {
    store: Arc<StoreGateway>,
    clock: Arc<dyn Clock>,
    cache_ttl: Ms,
    api_tokens: RwLock<Option<Cached<Vec<String>>>>,
    schedule_tokens: DashMap<String, Cached<String>>,
}

impl TokenAuthority {
    pub fn new(store: Arc<StoreGateway>, clock: Arc<dyn Clock>, cache_ttl: Duration) -> Self {
        Self {
            store,
            clock,
            cache_ttl: cache_ttl.as_millis() as Ms,
            api_tokens: RwLock::new(None),
            schedule_tokens: DashMap::new(),
        }
    }

    fn fresh(&self, fetched_at: Ms) -> bool {
        self.clock.now_ms() - fetched_at < self.cache_ttl
    }

    pub async fn verify_api_token(&self, candidate: &str) -> Result<bool, StoreError> {
        if !plausible(candidate) {
            return Ok(deny("api"));
        }
        {
            let cached = self.api_tokens.read().await;
            if let Some(c) = (*cached).as_ref().filter(|c| self.fresh(c.fetched_at)) {
                if matches_any(candidate, &c.value) {
                    return Ok(true);
                }
            }
        }
        let tokens = self.store.api_tokens().await?;
        let ok = matches_any(candidate, &tokens);
        *self.api_tokens.write().await = Some(Cached {
            value: tokens,
            fetched_at: self.clock.now_ms(),
        });
        Ok(ok || deny("api"))
    }

    pub async fn verify_schedule_token(
        &self,
        host_email: &str,
        candidate: &str,
    ) -> Result<bool, StoreError> {
        if !plausible(candidate) {
            return Ok(deny("schedule"));
        }
        if let Some(c) = self.schedule_tokens.get(host_email) {
            if self.fresh(c.fetched_at)
                && constant_time_eq(candidate.as_bytes(), c.value.as_bytes())
            {
                return Ok(true);
            }
        }
        let Some(token) = self.store.schedule_token(host_email).await? else {
            self.schedule_tokens.remove(host_email);
            return Ok(deny("schedule"));
        };
        let ok = constant_time_eq(candidate.as_bytes(), token.as_bytes());
        self.schedule_tokens.insert(
            host_email.to_string(),
            Cached {
                value: token,
                fetched_at: self.clock.now_ms(),
            },
        );
        Ok(ok || deny("schedule"))
    }

    /// Whether `host_email` is a registered host, i.e. has a schedule token.
    pub async fn host_registered(&self, host_email: &str) -> Result<bool, StoreError> {
        let cached = self
            .schedule_tokens
            .get(host_email)
            .is_some_and(|c| self.fresh(c.fetched_at));
        if cached {
            return Ok(true);
        }
        Ok(self.store.schedule_token(host_email).await?.is_some())
    }
}

fn plausible(candidate: &str) -> bool {
    !candidate.is_empty() && candidate.len() <= MAX_TOKEN_LEN
}

/// Compares against every token without stopping at the first match.
fn matches_any(candidate: &str, tokens: &[String]) -> bool {
    tokens
        .iter()
        .fold(false, |acc, t| constant_time_eq(candidate.as_bytes(), t.as_bytes()) | acc)
}

fn deny(kind: &'static str) -> bool {
    warn!("{kind} token rejected");
    metrics::counter!(observability::AUTH_FAILURES_TOTAL, "token" => kind).increment(1);
    false
}

/// Decode the base64 transport form of an api token.
pub fn decode_api_token(encoded: &str) -> Option<String> {
    let bytes = STANDARD.decode(encoded.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

pub fn encode_api_token(token: &str) -> String {
    STANDARD.encode(token)
}
