use super::*;
use crate::clock::ManualClock;
use crate::limits::*;
use crate::store::WalStore;
use std::path::PathBuf;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

/// 2024-01-02T00:00:00Z
const DAY: Ms = 1_704_153_600_000;

const HOST: &str = "a@b.com";
const API: &str = "api-secret";
const SCHED: &str = "sched-secret";

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("bookit_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

struct Harness {
    service: Arc<BookingService>,
    store: WalStore,
    clock: Arc<ManualClock>,
}

async fn harness(name: &str) -> Harness {
    let store = WalStore::open(&test_wal_path(name)).unwrap();
    store.issue_api_token(API).await.unwrap();
    store.issue_schedule_token(HOST, SCHED).await.unwrap();
    let clock = Arc::new(ManualClock::new(DAY - 24 * H));
    let shared = Arc::new(store.clone());
    let settings = EngineSettings::default();
    let service = BookingService::new(shared.clone(), shared, clock.clone(), &settings);
    Harness {
        service: Arc::new(service),
        store,
        clock,
    }
}

async fn hold(h: &Harness, start: Ms, end: Ms) -> Result<Hold, BookingError> {
    h.service.request_hold(HOST, start, end, 10 * M, API).await
}

// ── Hold placement ───────────────────────────────────────

#[tokio::test]
async fn hold_then_confirm_succeeds() {
    let h = harness("hold_confirm.wal").await;
    let held = hold(&h, DAY + 10 * H, DAY + 11 * H).await.unwrap();
    assert_eq!(held.deadline, h.clock.now_ms() + 10 * M);
    assert!(!held.consumed);

    let slot = h.service.confirm(held.id, HOST, SCHED, API).await.unwrap();
    assert_eq!(slot.host_email, HOST);
    assert_eq!(slot.span, Span::new(DAY + 10 * H, DAY + 11 * H));
    assert!(h.service.live_holds(HOST).await.is_empty());
}

#[tokio::test]
async fn invalid_interval_rejected() {
    let h = harness("invalid.wal").await;
    let err = hold(&h, DAY + H, DAY + H).await.unwrap_err();
    assert_eq!(err, BookingError::InvalidInterval { start: DAY + H, end: DAY + H });
    assert_eq!(err.kind(), "InvalidInterval");
    assert!(matches!(
        hold(&h, DAY + 2 * H, DAY + H).await,
        Err(BookingError::InvalidInterval { .. })
    ));
}

#[tokio::test]
async fn overlapping_confirmed_scenario() {
    let h = harness("scenario.wal").await;
    let msg = HoldRequest {
        host_email: HOST.into(),
        start_time: "2024-01-02T10:00+00".into(),
        end_time: "2024-01-02T11:00+00".into(),
        expiration: 10,
    };
    let x = h.service.request_hold_message(&msg, API).await.unwrap();
    let slot = h.service.confirm(x.id, HOST, SCHED, API).await.unwrap();
    assert_eq!(SlotRecord::from(&slot).start_time, "2024-01-02T10:00:00+00:00");
    assert_eq!(SlotRecord::from(&slot).end_time, "2024-01-02T11:00:00+00:00");

    let overlapping = HoldRequest {
        start_time: "2024-01-02T10:30+00".into(),
        end_time: "2024-01-02T11:30+00".into(),
        ..msg
    };
    let err = h.service.request_hold_message(&overlapping, API).await.unwrap_err();
    assert_eq!(err, BookingError::Conflict(Occupant::Slot(slot.id)));
}

#[tokio::test]
async fn touching_intervals_do_not_conflict() {
    let h = harness("touching.wal").await;
    let a = hold(&h, DAY + 10 * H, DAY + 11 * H).await.unwrap();
    let b = hold(&h, DAY + 11 * H, DAY + 12 * H).await.unwrap();
    h.service.confirm(a.id, HOST, SCHED, API).await.unwrap();
    h.service.confirm(b.id, HOST, SCHED, API).await.unwrap();
    let slots = h.service.list_slots(HOST, SCHED, API, None, None).await.unwrap();
    assert_eq!(slots.len(), 2);
    assert!(!slots[0].span.overlaps(&slots[1].span));
}

#[tokio::test]
async fn live_hold_blocks_other_hold() {
    let h = harness("live_block.wal").await;
    let a = hold(&h, DAY, DAY + H).await.unwrap();
    let err = hold(&h, DAY + 30 * M, DAY + 90 * M).await.unwrap_err();
    assert_eq!(err, BookingError::Conflict(Occupant::Hold(a.id)));
    assert_eq!(err.kind(), "Conflict");
}

#[tokio::test]
async fn hosts_are_independent() {
    let h = harness("hosts.wal").await;
    h.store.issue_schedule_token("other@b.com", "other-secret").await.unwrap();
    hold(&h, DAY, DAY + H).await.unwrap();
    h.service
        .request_hold("other@b.com", DAY, DAY + H, 10 * M, API)
        .await
        .unwrap();
}

#[tokio::test]
async fn unknown_host_is_not_found() {
    let h = harness("unknown_host.wal").await;
    let err = h
        .service
        .request_hold("ghost@nowhere.test", DAY, DAY + H, 10 * M, API)
        .await
        .unwrap_err();
    assert_eq!(err, BookingError::HostNotFound("ghost@nowhere.test".into()));
    assert_eq!(err.kind(), "NotFound");
    assert!(h.service.live_holds("ghost@nowhere.test").await.is_empty());

    // registering the host makes it bookable at once
    h.store.issue_schedule_token("ghost@nowhere.test", "g").await.unwrap();
    h.service
        .request_hold("ghost@nowhere.test", DAY, DAY + H, 10 * M, API)
        .await
        .unwrap();
}

// ── Expiry ───────────────────────────────────────────────

#[tokio::test]
async fn one_minute_hold_expires_before_confirm() {
    let h = harness("expire.wal").await;
    let held = h
        .service
        .request_hold(HOST, DAY, DAY + H, M, API)
        .await
        .unwrap();
    h.clock.advance(2 * M);
    let err = h.service.confirm(held.id, HOST, SCHED, API).await.unwrap_err();
    assert_eq!(err, BookingError::Expired(held.id));
    assert!(h.service.list_slots(HOST, SCHED, API, None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn deadline_is_exclusive() {
    let h = harness("deadline.wal").await;
    let held = h.service.request_hold(HOST, DAY, DAY + H, M, API).await.unwrap();
    h.clock.advance(M - 1);
    assert!(h.service.live_holds(HOST).await.len() == 1);
    h.clock.advance(1);
    // deadline <= now counts as expired, even before any sweep
    assert!(matches!(
        h.service.confirm(held.id, HOST, SCHED, API).await,
        Err(BookingError::Expired(_))
    ));
}

#[tokio::test]
async fn expired_hold_stops_blocking() {
    let h = harness("expired_block.wal").await;
    hold(&h, DAY, DAY + H).await.unwrap();
    h.clock.advance(10 * M);
    hold(&h, DAY, DAY + H).await.unwrap();
}

#[tokio::test]
async fn reaped_hold_still_reports_expired() {
    let h = harness("reaped.wal").await;
    let held = hold(&h, DAY, DAY + H).await.unwrap();
    h.clock.advance(11 * M);
    assert_eq!(h.service.holds().sweep_expired(), 1);
    assert_eq!(
        h.service.confirm(held.id, HOST, SCHED, API).await,
        Err(BookingError::Expired(held.id))
    );
}

#[tokio::test]
async fn store_conflict_on_confirm_leaves_hold_consumed() {
    let h = harness("store_conflict.wal").await;
    let held = hold(&h, DAY, DAY + H).await.unwrap();
    // a slot written behind the registry's back
    let taken = SlotStore::insert_if_free(&h.store, HOST, Span::new(DAY + 30 * M, DAY + 2 * H))
        .await
        .unwrap();

    assert_eq!(
        h.service.confirm(held.id, HOST, SCHED, API).await,
        Err(BookingError::Conflict(Occupant::Slot(taken.id)))
    );
    assert_eq!(
        h.service.confirm(held.id, HOST, SCHED, API).await,
        Err(BookingError::HoldNotFound(held.id))
    );
    assert!(h.service.live_holds(HOST).await.is_empty());
    let slots = h.service.list_slots(HOST, SCHED, API, None, None).await.unwrap();
    assert_eq!(slots, vec![taken]);
}

// ── Release ──────────────────────────────────────────────

#[tokio::test]
async fn release_is_idempotent() {
    let h = harness("release.wal").await;
    let a = hold(&h, DAY, DAY + H).await.unwrap();
    h.service.release(a.id, API).await.unwrap();
    h.service.release(a.id, API).await.unwrap();
    h.service.cancel(a.id, API).await.unwrap();
    let err = h.service.confirm(a.id, HOST, SCHED, API).await.unwrap_err();
    assert_eq!(err, BookingError::HoldNotFound(a.id));
    assert_eq!(err.kind(), "NotFound");

    // released interval is free again
    hold(&h, DAY, DAY + H).await.unwrap();
}

#[tokio::test]
async fn release_after_consume_or_expiry_succeeds() {
    let h = harness("release_late.wal").await;
    let a = hold(&h, DAY, DAY + H).await.unwrap();
    h.service.confirm(a.id, HOST, SCHED, API).await.unwrap();
    h.service.release(a.id, API).await.unwrap();

    let b = hold(&h, DAY + H, DAY + 2 * H).await.unwrap();
    h.clock.advance(11 * M);
    h.service.release(b.id, API).await.unwrap();
    assert_eq!(
        h.service.confirm(b.id, HOST, SCHED, API).await,
        Err(BookingError::HoldNotFound(b.id))
    );
}

#[tokio::test]
async fn release_requires_api_token() {
    let h = harness("release_auth.wal").await;
    let a = hold(&h, DAY, DAY + H).await.unwrap();
    assert_eq!(
        h.service.release(a.id, "nope").await,
        Err(BookingError::Unauthorized("api token"))
    );
    assert_eq!(h.service.live_holds(HOST).await.len(), 1);
}

// ── Authorization ────────────────────────────────────────

#[tokio::test]
async fn bad_tokens_rejected() {
    let h = harness("tokens.wal").await;
    h.store.issue_schedule_token("other@b.com", "other-secret").await.unwrap();

    assert_eq!(
        h.service.request_hold(HOST, DAY, DAY + H, M, "").await,
        Err(BookingError::Unauthorized("api token"))
    );
    let a = hold(&h, DAY, DAY + H).await.unwrap();
    for bad in ["", "wrong", "other-secret"] {
        let err = h.service.confirm(a.id, HOST, bad, API).await.unwrap_err();
        assert_eq!(err, BookingError::Unauthorized("schedule token"));
        assert_eq!(err.kind(), "Unauthorized");
    }
    // a rejected confirm does not consume the hold
    h.service.confirm(a.id, HOST, SCHED, API).await.unwrap();
}

#[tokio::test]
async fn confirm_for_other_host_is_not_found() {
    let h = harness("other_host.wal").await;
    h.store.issue_schedule_token("other@b.com", "other-secret").await.unwrap();
    let a = hold(&h, DAY, DAY + H).await.unwrap();
    assert_eq!(
        h.service.confirm(a.id, "other@b.com", "other-secret", API).await,
        Err(BookingError::HoldNotFound(a.id))
    );
    h.service.confirm(a.id, HOST, SCHED, API).await.unwrap();
}

#[tokio::test]
async fn oversized_token_is_limit_exceeded() {
    let h = harness("long_token.wal").await;
    let long = "x".repeat(MAX_TOKEN_LEN + 1);
    assert!(matches!(
        h.service.request_hold(HOST, DAY, DAY + H, M, &long).await,
        Err(BookingError::LimitExceeded(_))
    ));
}

// ── Limits & parsing ─────────────────────────────────────

#[tokio::test]
async fn ttl_and_span_limits() {
    let h = harness("limits.wal").await;
    assert!(matches!(
        h.service.request_hold(HOST, DAY, DAY + H, 0, API).await,
        Err(BookingError::LimitExceeded(_))
    ));
    assert!(matches!(
        h.service.request_hold(HOST, DAY, DAY + MAX_SPAN_DURATION_MS + 1, M, API).await,
        Err(BookingError::LimitExceeded(_))
    ));
    assert!(matches!(
        h.service.request_hold("", DAY, DAY + H, M, API).await,
        Err(BookingError::Malformed(_))
    ));
}

#[tokio::test]
async fn unparseable_message_is_malformed() {
    let h = harness("malformed.wal").await;
    let msg = HoldRequest {
        host_email: HOST.into(),
        start_time: "tomorrow".into(),
        end_time: "2024-01-02T11:00:00+00".into(),
        expiration: 10,
    };
    let err = h.service.request_hold_message(&msg, API).await.unwrap_err();
    assert_eq!(err.kind(), "Malformed");
}

// ── Slot maintenance ─────────────────────────────────────

#[tokio::test]
async fn cancel_slot_frees_interval() {
    let h = harness("cancel_slot.wal").await;
    let a = hold(&h, DAY, DAY + H).await.unwrap();
    let slot = h.service.confirm(a.id, HOST, SCHED, API).await.unwrap();

    h.store.issue_schedule_token("other@b.com", "other-secret").await.unwrap();
    assert_eq!(
        h.service.cancel_slot(slot.id, "other@b.com", "other-secret", API).await,
        Err(BookingError::SlotNotFound(slot.id))
    );

    let removed = h.service.cancel_slot(slot.id, HOST, SCHED, API).await.unwrap();
    assert_eq!(removed, slot);
    assert_eq!(
        h.service.cancel_slot(slot.id, HOST, SCHED, API).await,
        Err(BookingError::SlotNotFound(slot.id))
    );
    hold(&h, DAY, DAY + H).await.unwrap();
}

#[tokio::test]
async fn list_slots_window() {
    let h = harness("list_window.wal").await;
    for day in 0..3 {
        let start = DAY + day * 24 * H + 9 * H;
        let held = hold(&h, start, start + H).await.unwrap();
        h.service.confirm(held.id, HOST, SCHED, API).await.unwrap();
    }
    let all = h.service.list_slots(HOST, SCHED, API, None, None).await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|w| w[0].span.start < w[1].span.start));

    let window = Some((DAY + 24 * H, DAY + 48 * H));
    let day_two = h.service.list_slots(HOST, SCHED, API, window, None).await.unwrap();
    assert_eq!(day_two.len(), 1);
    assert_eq!(day_two[0].span.start, DAY + 33 * H);

    assert_eq!(
        h.service.list_slots(HOST, "wrong", API, None, None).await,
        Err(BookingError::Unauthorized("schedule token"))
    );
}

#[tokio::test]
async fn list_slots_limit() {
    let h = harness("list_limit.wal").await;
    for day in 0..(DEFAULT_LIST_LIMIT as i64 + 5) {
        let start = DAY + day * 24 * H;
        SlotStore::insert_if_free(&h.store, HOST, Span::new(start, start + H))
            .await
            .unwrap();
    }
    let page = h.service.list_slots(HOST, SCHED, API, None, None).await.unwrap();
    assert_eq!(page.len(), DEFAULT_LIST_LIMIT);
    assert_eq!(page[0].span.start, DAY);

    let two = h.service.list_slots(HOST, SCHED, API, None, Some(2)).await.unwrap();
    assert_eq!(two.len(), 2);
    assert_eq!(two[1].span.start, DAY + 24 * H);

    let all = h.service.list_slots(HOST, SCHED, API, None, Some(usize::MAX)).await.unwrap();
    assert_eq!(all.len(), DEFAULT_LIST_LIMIT + 5);
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test]
async fn concurrent_identical_holds_one_winner() {
    let h = harness("race_hold.wal").await;
    let mut handles = Vec::new();
    for _ in 0..2 {
        let service = h.service.clone();
        handles.push(tokio::spawn(async move {
            service.request_hold(HOST, DAY, DAY + H, 10 * M, API).await
        }));
    }
    let mut ok = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(BookingError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((ok, conflicts), (1, 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_overlapping_holds_never_double_book() {
    let h = harness("race_many.wal").await;
    let mut handles = Vec::new();
    for i in 0..32 {
        let service = h.service.clone();
        // every request overlaps its neighbours by half an hour
        let start = DAY + i * 30 * M;
        handles.push(tokio::spawn(async move {
            let held = service.request_hold(HOST, start, start + H, 10 * M, API).await?;
            service.confirm(held.id, HOST, SCHED, API).await
        }));
    }
    for handle in handles {
        let _ = handle.await.unwrap();
    }
    let slots = h.service.list_slots(HOST, SCHED, API, None, None).await.unwrap();
    assert!(!slots.is_empty());
    for pair in slots.windows(2) {
        assert!(pair[0].span.end <= pair[1].span.start, "{pair:?}");
    }
}

#[tokio::test]
async fn release_and_confirm_race_has_single_outcome() {
    let h = harness("race_release.wal").await;
    for _ in 0..20 {
        let held = hold(&h, DAY, DAY + H).await.unwrap();
        let (s1, s2) = (h.service.clone(), h.service.clone());
        let confirm = tokio::spawn(async move { s1.confirm(held.id, HOST, SCHED, API).await });
        let release = tokio::spawn(async move { s2.release(held.id, API).await });
        release.await.unwrap().unwrap();
        match confirm.await.unwrap() {
            Ok(slot) => {
                h.service.cancel_slot(slot.id, HOST, SCHED, API).await.unwrap();
            }
            Err(e) => assert_eq!(e, BookingError::HoldNotFound(held.id)),
        }
        assert!(h.service.live_holds(HOST).await.is_empty());
    }
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn confirmed_slots_survive_restart_holds_do_not() {
    let path = test_wal_path("restart.wal");
    {
        let store = WalStore::open(&path).unwrap();
        store.issue_api_token(API).await.unwrap();
        store.issue_schedule_token(HOST, SCHED).await.unwrap();
        let shared = Arc::new(store);
        let clock = Arc::new(ManualClock::new(DAY - H));
        let settings = EngineSettings::default();
        let service = BookingService::new(shared.clone(), shared, clock, &settings);
        let a = service.request_hold(HOST, DAY, DAY + H, M, API).await.unwrap();
        service.confirm(a.id, HOST, SCHED, API).await.unwrap();
        service.request_hold(HOST, DAY + H, DAY + 2 * H, M, API).await.unwrap();
    }

    let store = Arc::new(WalStore::open(&path).unwrap());
    let clock = Arc::new(ManualClock::new(DAY - H));
    let service = BookingService::new(store.clone(), store, clock, &EngineSettings::default());
    let slots = service.list_slots(HOST, SCHED, API, None, None).await.unwrap();
    assert_eq!(slots.len(), 1);
    assert!(service.live_holds(HOST).await.is_empty());
    service.request_hold(HOST, DAY + H, DAY + 2 * H, M, API).await.unwrap();
}
