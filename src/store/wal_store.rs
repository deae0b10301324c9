use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::info;

use crate::limits::MAX_SLOTS_PER_HOST;
use crate::model::*;
use crate::wal::Wal;

use super::{SlotStore, StoreError, TokenSource};

pub type SharedHostSlots = Arc<RwLock<HostSlots>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &[(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so buffered bytes don't leak into the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Apply a slot event to one host's index (caller holds the host's write lock).
fn apply_slot_event(hs: &mut HostSlots, event: &Event, slot_to_host: &DashMap<SlotId, String>) {
    match event {
        Event::SlotBooked { id, host_email, span } => {
            hs.insert(BookedSlot {
                id: *id,
                host_email: host_email.clone(),
                span: *span,
            });
            slot_to_host.insert(*id, host_email.clone());
        }
        Event::SlotCancelled { id, .. } => {
            hs.remove(*id);
            slot_to_host.remove(id);
        }
        Event::ScheduleTokenIssued { .. }
        | Event::ApiTokenIssued { .. }
        | Event::SequenceFloor { .. } => {}
    }
}

struct Inner {
    hosts: DashMap<String, SharedHostSlots>,
    slot_to_host: DashMap<SlotId, String>,
    /// Latest schedule token per host. Issuing a new one supersedes the old.
    schedule_tokens: DashMap<String, String>,
    api_tokens: RwLock<Vec<String>>,
    next_slot_id: AtomicI64,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared across append + apply; compaction holds it exclusively.
    commit_gate: RwLock<()>,
}

/// Durable `SlotStore`/`TokenSource`: in-memory per-host index rebuilt from a WAL.
#[derive(Clone)]
pub struct WalStore {
    inner: Arc<Inner>,
}

impl WalStore {
    /// Replay the WAL at `path` and start its writer task. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, events) = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let slot_to_host = DashMap::new();
        let schedule_tokens = DashMap::new();
        let mut api_tokens: Vec<String> = Vec::new();
        let mut next_slot_id: SlotId = 1;
        let mut hosts: HashMap<String, HostSlots> = HashMap::new();

        for event in &events {
            match event {
                Event::SlotBooked { id, host_email, .. } => {
                    next_slot_id = next_slot_id.max(id + 1);
                    let hs = hosts.entry(host_email.clone()).or_default();
                    apply_slot_event(hs, event, &slot_to_host);
                }
                Event::SlotCancelled { host_email, .. } => {
                    if let Some(hs) = hosts.get_mut(host_email) {
                        apply_slot_event(hs, event, &slot_to_host);
                    }
                }
                Event::ScheduleTokenIssued { host_email, token } => {
                    schedule_tokens.insert(host_email.clone(), token.clone());
                }
                Event::ApiTokenIssued { token } => {
                    if !api_tokens.contains(token) {
                        api_tokens.push(token.clone());
                    }
                }
                Event::SequenceFloor { next_slot_id: floor } => {
                    next_slot_id = next_slot_id.max(*floor);
                }
            }
        }

        info!(
            "opened slot store {}: {} events, {} hosts, next slot id {next_slot_id}",
            path.display(),
            events.len(),
            hosts.len()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                hosts: hosts
                    .into_iter()
                    .map(|(host, hs)| (host, Arc::new(RwLock::new(hs))))
                    .collect(),
                slot_to_host,
                schedule_tokens,
                api_tokens: RwLock::new(api_tokens),
                next_slot_id: AtomicI64::new(next_slot_id),
                wal_tx,
                commit_gate: RwLock::new(()),
            }),
        })
    }

    /// Make `token` the current schedule token of `host_email`.
    pub async fn issue_schedule_token(
        &self,
        host_email: &str,
        token: &str,
    ) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        let host_email = host_email.to_string();
        let token = token.to_string();
        detached(async move {
            let _gate = inner.commit_gate.read().await;
            let event = Event::ScheduleTokenIssued {
                host_email: host_email.clone(),
                token: token.clone(),
            };
            inner.wal_append(&event).await?;
            inner.schedule_tokens.insert(host_email, token);
            Ok(())
        })
        .await
    }

    /// Add `token` to the accepted api tokens. Re-issuing an existing token is a no-op.
    pub async fn issue_api_token(&self, token: &str) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        let token = token.to_string();
        detached(async move {
            let _gate = inner.commit_gate.read().await;
            let mut tokens = inner.api_tokens.write().await;
            if tokens.contains(&token) {
                return Ok(());
            }
            inner.wal_append(&Event::ApiTokenIssued { token: token.clone() }).await?;
            tokens.push(token);
            Ok(())
        })
        .await
    }

    /// Rewrite the WAL with the minimal event set that recreates the current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.inner.commit_gate.write().await;
        let mut events = vec![Event::SequenceFloor {
            next_slot_id: self.inner.next_slot_id.load(Ordering::SeqCst),
        }];
        for token in self.inner.api_tokens.read().await.iter() {
            events.push(Event::ApiTokenIssued { token: token.clone() });
        }
        for entry in self.inner.schedule_tokens.iter() {
            events.push(Event::ScheduleTokenIssued {
                host_email: entry.key().clone(),
                token: entry.value().clone(),
            });
        }
        let hosts: Vec<SharedHostSlots> =
            self.inner.hosts.iter().map(|e| e.value().clone()).collect();
        for shared in hosts {
            let guard = shared.read().await;
            for slot in &guard.slots {
                events.push(Event::SlotBooked {
                    id: slot.id,
                    host_email: slot.host_email.clone(),
                    span: slot.span,
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Run a mutation on its own task. A caller that stops waiting (timeout) can no
/// longer cancel it between the WAL append and the in-memory apply.
async fn detached<T, F>(fut: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: std::future::Future<Output = Result<T, StoreError>> + Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
}

impl Inner {
    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL error: {e}")))
    }

    fn host(&self, host_email: &str) -> Option<SharedHostSlots> {
        self.hosts.get(host_email).map(|e| e.value().clone())
    }

    fn host_or_create(&self, host_email: &str) -> SharedHostSlots {
        self.hosts
            .entry(host_email.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(HostSlots::new())))
            .clone()
    }

    async fn insert_if_free(
        &self,
        host_email: String,
        span: Span,
    ) -> Result<BookedSlot, StoreError> {
        let _gate = self.commit_gate.read().await;
        let shared = self.host_or_create(&host_email);
        let mut guard = shared.write().await;

        if let Some(existing) = guard.overlapping(&span).next() {
            return Err(StoreError::Conflict(existing.id));
        }
        if guard.len() >= MAX_SLOTS_PER_HOST {
            return Err(StoreError::LimitExceeded("too many slots for host"));
        }

        let id = self.next_slot_id.fetch_add(1, Ordering::SeqCst);
        let event = Event::SlotBooked {
            id,
            host_email: host_email.clone(),
            span,
        };
        self.wal_append(&event).await?;
        apply_slot_event(&mut guard, &event, &self.slot_to_host);
        Ok(BookedSlot { id, host_email, span })
    }

    async fn remove(&self, id: SlotId) -> Result<Option<BookedSlot>, StoreError> {
        let _gate = self.commit_gate.read().await;
        let Some(host_email) = self.slot_to_host.get(&id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let Some(shared) = self.host(&host_email) else {
            return Ok(None);
        };
        let mut guard = shared.write().await;
        let Some(slot) = guard.get(id).cloned() else {
            return Ok(None);
        };
        let event = Event::SlotCancelled { id, host_email };
        self.wal_append(&event).await?;
        apply_slot_event(&mut guard, &event, &self.slot_to_host);
        Ok(Some(slot))
    }
}

#[async_trait]
impl SlotStore for WalStore {
    async fn query_overlap(
        &self,
        host_email: &str,
        span: Span,
    ) -> Result<Vec<BookedSlot>, StoreError> {
        let Some(shared) = self.inner.host(host_email) else {
            return Ok(Vec::new());
        };
        let guard = shared.read().await;
        Ok(guard.overlapping(&span).cloned().collect())
    }

    async fn insert_if_free(&self, host_email: &str, span: Span) -> Result<BookedSlot, StoreError> {
        let inner = self.inner.clone();
        let host_email = host_email.to_string();
        detached(async move { inner.insert_if_free(host_email, span).await }).await
    }

    async fn remove(&self, id: SlotId) -> Result<Option<BookedSlot>, StoreError> {
        let inner = self.inner.clone();
        detached(async move { inner.remove(id).await }).await
    }

    async fn get(&self, id: SlotId) -> Result<Option<BookedSlot>, StoreError> {
        let Some(host_email) = self.inner.slot_to_host.get(&id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let Some(shared) = self.inner.host(&host_email) else {
            return Ok(None);
        };
        let guard = shared.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn slots_for_host(
        &self,
        host_email: &str,
        window: Option<Span>,
    ) -> Result<Vec<BookedSlot>, StoreError> {
        let Some(shared) = self.inner.host(host_email) else {
            return Ok(Vec::new());
        };
        let guard = shared.read().await;
        Ok(match window {
            Some(w) => guard.overlapping(&w).cloned().collect(),
            None => guard.slots.clone(),
        })
    }
}

#[async_trait]
impl TokenSource for WalStore {
    async fn schedule_token(&self, host_email: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .inner
            .schedule_tokens
            .get(host_email)
            .map(|e| e.value().clone()))
    }

    async fn api_tokens(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.api_tokens.read().await.clone())
    }
}
