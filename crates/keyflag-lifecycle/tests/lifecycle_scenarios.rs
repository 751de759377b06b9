//! Lifecycle scenario tests.
//!
//! End-to-end flows through the engine: proposal exclusivity (including
//! concurrent proposers), promotion ordering, cache mirroring, canary
//! overlay scoping, rejection and retire. Everything runs against an
//! in-memory store, except the restart test which uses a file on disk.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use keyflag_core::{Decision, KeyRecord, KeyStatus};
use keyflag_lifecycle::{EngineError, KeyLifecycle};
use keyflag_state::{CacheError, MemoryCache, StateStore, StoreRegistry, ValueCache};

fn test_engine() -> KeyLifecycle {
    KeyLifecycle::with_defaults(StateStore::open_in_memory().unwrap())
}

fn hosts(list: &[&str]) -> Vec<String> {
    list.iter().map(|h| h.to_string()).collect()
}

fn count(engine: &KeyLifecycle, key: &str, status: KeyStatus) -> usize {
    engine
        .store()
        .records_for_key(key, Some(status))
        .unwrap()
        .len()
}

fn activate(engine: &KeyLifecycle, key: &str, value: &str) -> KeyRecord {
    engine.propose_update(key, value, "int", 7).unwrap();
    engine.approve(key, 9, Decision::Accept).unwrap().record
}

/// Fails every write; reads hit an in-memory map that stays empty.
#[derive(Default)]
struct FailingCache {
    inner: MemoryCache,
}

impl ValueCache for FailingCache {
    fn set(&self, _: &KeyRecord) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("cache down".to_string()))
    }
    fn get(&self, key: &str) -> Result<Option<KeyRecord>, CacheError> {
        self.inner.get(key)
    }
    fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyRecord>, CacheError> {
        self.inner.get_prefix(prefix)
    }
    fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.inner.invalidate(key)
    }
}

/// In-memory cache whose next write, once armed, parks until the test
/// releases it. Lets a test commit other changes while a write is in flight.
struct GatedCache {
    inner: MemoryCache,
    armed: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

impl GatedCache {
    fn new() -> Self {
        Self {
            inner: MemoryCache::new(),
            armed: AtomicBool::new(false),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Block until the armed write has started, run `f`, then let it finish.
    fn while_parked(&self, f: impl FnOnce()) {
        self.entered.wait();
        f();
        self.release.wait();
    }
}

impl ValueCache for GatedCache {
    fn set(&self, record: &KeyRecord) -> Result<(), CacheError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.wait();
            self.release.wait();
        }
        self.inner.set(record)
    }
    fn get(&self, key: &str) -> Result<Option<KeyRecord>, CacheError> {
        self.inner.get(key)
    }
    fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyRecord>, CacheError> {
        self.inner.get_prefix(prefix)
    }
    fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.inner.invalidate(key)
    }
}

fn gated_engine() -> (KeyLifecycle, Arc<GatedCache>) {
    let store = StateStore::open_in_memory().unwrap();
    let cache = Arc::new(GatedCache::new());
    let engine = KeyLifecycle::new(
        store.clone(),
        cache.clone(),
        Arc::new(StoreRegistry::new(store)),
    );
    (engine, cache)
}

// ── Single pending invariant ────────────────────────────────────

#[test]
fn single_pending_per_key() {
    let engine = test_engine();
    let mut accepted = 0;
    for (i, delete) in [false, true, false, true, false].into_iter().enumerate() {
        let value = i.to_string();
        let result = if delete {
            engine.propose_delete("cfg/a", &value, "int", 7)
        } else {
            engine.propose_update("cfg/a", &value, "int", 7)
        };
        match result {
            Ok(_) => accepted += 1,
            Err(EngineError::Conflict(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(count(&engine, "cfg/a", KeyStatus::PendingUpdate), 1);
    assert_eq!(count(&engine, "cfg/a", KeyStatus::PendingDelete), 0);
}

#[test]
fn concurrent_proposals_yield_one_winner() {
    const WRITERS: usize = 8;

    let engine = test_engine();
    let barrier = Arc::new(Barrier::new(WRITERS));
    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let engine = engine.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.propose_update("cfg/race", &i.to_string(), "int", i as u64)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, EngineError::Conflict(_))));
    assert_eq!(count(&engine, "cfg/race", KeyStatus::PendingUpdate), 1);
}

// ── Single active invariant / promotion ordering ────────────────

#[test]
fn repeated_promotions_keep_one_active() {
    let engine = test_engine();
    let mut previous: Option<KeyRecord> = None;
    for value in ["1", "2", "3", "4"] {
        let active = activate(&engine, "cfg/a", value);
        assert_eq!(count(&engine, "cfg/a", KeyStatus::Active), 1);
        if let Some(prev) = previous {
            assert_eq!(
                engine.record(prev.id).unwrap().status,
                KeyStatus::ExpiredActive
            );
        }
        previous = Some(active);
    }
    assert_eq!(count(&engine, "cfg/a", KeyStatus::ExpiredActive), 3);
    assert_eq!(count(&engine, "cfg/a", KeyStatus::Approved), 4);
}

#[test]
fn readers_never_observe_two_active_rows() {
    const ROUNDS: usize = 50;

    let engine = test_engine();
    activate(&engine, "cfg/a", "0");

    let reader = {
        let store = engine.store().clone();
        thread::spawn(move || {
            for _ in 0..ROUNDS * 4 {
                let active = store
                    .records_for_key("cfg/a", Some(KeyStatus::Active))
                    .unwrap();
                assert_eq!(active.len(), 1);
            }
        })
    };

    for round in 1..=ROUNDS {
        activate(&engine, "cfg/a", &round.to_string());
    }
    reader.join().unwrap();
    assert_eq!(engine.get_active_value("cfg/a").unwrap().value, ROUNDS.to_string());
}

// ── Cache mirrors active ────────────────────────────────────────

#[test]
fn approve_then_read_scenario() {
    let engine = test_engine();
    engine.propose_update("cfg/a", "1", "int", 7).unwrap();

    let outcome = engine.approve("cfg/a", 9, Decision::Accept).unwrap();
    assert!(outcome.cache_synced);

    let served = engine.get_active_value("cfg/a").unwrap();
    assert_eq!(served.value, "1");
    assert_eq!(served.approved_by, Some(9));

    engine.propose_update("cfg/a", "2", "int", 7).unwrap();
    assert!(matches!(
        engine.propose_update("cfg/a", "3", "int", 8),
        Err(EngineError::Conflict(_))
    ));
    // The served value does not move until approval.
    assert_eq!(engine.get_active_value("cfg/a").unwrap().value, "1");
}

// ── Cache write ordering ────────────────────────────────────────

#[test]
fn slow_cold_read_does_not_cache_superseded_value() {
    let (engine, cache) = gated_engine();
    activate(&engine, "cfg/a", "1");
    cache.invalidate("cfg/a").unwrap();
    cache.arm();

    let reader = {
        let engine = engine.clone();
        thread::spawn(move || engine.get_active_value("cfg/a").unwrap())
    };
    let mut newer = None;
    cache.while_parked(|| newer = Some(activate(&engine, "cfg/a", "2")));
    let read = reader.join().unwrap();
    assert_eq!(read.value, "1");

    let newer = newer.unwrap();
    assert_eq!(cache.inner.get("cfg/a").unwrap().unwrap().id, newer.id);
    assert_eq!(engine.get_active_value("cfg/a").unwrap().value, "2");
    assert_eq!(engine.get_active_values("cfg", "").unwrap()[0].value, "2");
}

#[test]
fn slow_cold_read_does_not_resurrect_retired_value() {
    let (engine, cache) = gated_engine();
    let active = activate(&engine, "cfg/a", "1");
    cache.invalidate("cfg/a").unwrap();
    cache.arm();

    let reader = {
        let engine = engine.clone();
        thread::spawn(move || engine.get_active_value("cfg/a").unwrap())
    };
    cache.while_parked(|| {
        engine.retire_key(active.id, 1).unwrap();
    });
    reader.join().unwrap();

    assert!(cache.inner.get("cfg/a").unwrap().is_none());
    assert!(matches!(
        engine.get_active_value("cfg/a"),
        Err(EngineError::NotFound(_))
    ));
    assert!(engine.get_active_values("cfg", "").unwrap().is_empty());
}

#[test]
fn late_approval_write_does_not_replace_newer_value() {
    let (engine, cache) = gated_engine();
    engine.propose_update("cfg/a", "1", "int", 7).unwrap();
    cache.arm();

    let approver = {
        let engine = engine.clone();
        thread::spawn(move || engine.approve("cfg/a", 9, Decision::Accept).unwrap())
    };
    let mut newer = None;
    cache.while_parked(|| newer = Some(activate(&engine, "cfg/a", "2")));
    let first = approver.join().unwrap();
    assert!(first.cache_synced);

    let newer = newer.unwrap();
    assert!(newer.id > first.record.id);
    assert_eq!(cache.inner.get("cfg/a").unwrap().unwrap().id, newer.id);
    assert_eq!(engine.get_active_value("cfg/a").unwrap().value, "2");
}

#[test]
fn cache_failure_keeps_commit() {
    let store = StateStore::open_in_memory().unwrap();
    let engine = KeyLifecycle::new(
        store.clone(),
        Arc::new(FailingCache::default()),
        Arc::new(StoreRegistry::new(store)),
    );

    engine.propose_update("cfg/a", "1", "int", 7).unwrap();
    let outcome = engine.approve("cfg/a", 9, Decision::Accept).unwrap();
    assert!(!outcome.cache_synced);
    assert_eq!(outcome.record.status, KeyStatus::Active);

    // Storage holds the change; reads fall back to it.
    assert_eq!(count(&engine, "cfg/a", KeyStatus::Active), 1);
    assert_eq!(engine.get_active_value("cfg/a").unwrap().value, "1");
    // Bulk reads list it even though the cache never saw it.
    let listed = engine.get_active_values("cfg", "").unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].key, "cfg/a");
    assert_eq!(listed[0].value, "1");
}

// ── Canary overlay scoping ──────────────────────────────────────

#[test]
fn canary_overlay_is_host_scoped() {
    let engine = test_engine();
    activate(&engine, "cfg/a", "1");
    activate(&engine, "cfg/b", "10");

    engine.propose_update("cfg/a", "2", "int", 7).unwrap();
    engine
        .start_or_extend_canary("cfg/a", 9, Decision::Accept, &hosts(&["10.0.0.1"]))
        .unwrap();

    let on_canary = engine.get_active_values("cfg", "10.0.0.1").unwrap();
    let values: Vec<_> = on_canary
        .iter()
        .map(|r| (r.key.as_str(), r.value.as_str()))
        .collect();
    assert_eq!(values, [("cfg/a", "2"), ("cfg/b", "10")]);

    let elsewhere = engine.get_active_values("cfg", "10.0.0.2").unwrap();
    let values: Vec<_> = elsewhere
        .iter()
        .map(|r| (r.key.as_str(), r.value.as_str()))
        .collect();
    assert_eq!(values, [("cfg/a", "1"), ("cfg/b", "10")]);

    // No host means no overlay, and the global read is untouched.
    assert_eq!(engine.get_active_values("cfg", "").unwrap(), elsewhere);
    assert_eq!(engine.get_active_value("cfg/a").unwrap().value, "1");
}

#[test]
fn canary_promotion_ends_overlay() {
    let engine = test_engine();
    activate(&engine, "cfg/a", "1");
    engine.propose_update("cfg/a", "2", "int", 7).unwrap();
    engine
        .start_or_extend_canary("cfg/a", 9, Decision::Accept, &hosts(&["10.0.0.1"]))
        .unwrap();
    engine
        .start_or_extend_canary("cfg/a", 9, Decision::Accept, &hosts(&["10.0.0.2"]))
        .unwrap();

    engine.approve("cfg/a", 9, Decision::Accept).unwrap();
    for host in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
        let values = engine.get_active_values("cfg", host).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, "2");
        assert_eq!(values[0].status, KeyStatus::Active);
    }
    assert_eq!(count(&engine, "cfg/a", KeyStatus::Canary), 0);
}

// ── Reject is terminal ──────────────────────────────────────────

#[test]
fn reject_has_no_side_effects() {
    let engine = test_engine();
    let active = activate(&engine, "cfg/a", "1");

    engine.propose_update("cfg/a", "2", "int", 7).unwrap();
    engine
        .start_or_extend_canary("cfg/a", 9, Decision::Accept, &hosts(&["10.0.0.1"]))
        .unwrap();
    let outcome = engine.approve("cfg/a", 9, Decision::Reject).unwrap();
    assert_eq!(outcome.record.status, KeyStatus::Rejected);

    assert_eq!(engine.record(active.id).unwrap(), active);
    assert_eq!(count(&engine, "cfg/a", KeyStatus::Active), 1);
    assert_eq!(count(&engine, "cfg/a", KeyStatus::Canary), 0);
    assert_eq!(
        engine.get_active_values("cfg", "10.0.0.1").unwrap()[0].value,
        "1"
    );
    assert!(matches!(
        engine.approve("cfg/a", 9, Decision::Accept),
        Err(EngineError::NotFound(_))
    ));
}

// ── Retire ──────────────────────────────────────────────────────

#[test]
fn retire_scenario() {
    let engine = test_engine();
    let active = activate(&engine, "cfg/a", "1");
    assert!(engine.get_active_value("cfg/a").is_ok());

    let outcome = engine.retire_key(active.id, 1).unwrap();
    assert!(outcome.cache_synced);
    assert!(matches!(
        engine.get_active_value("cfg/a"),
        Err(EngineError::NotFound(_))
    ));
    assert!(engine.get_active_values("cfg", "").unwrap().is_empty());
    // History is kept.
    assert_eq!(engine.history("cfg/a", false, None).unwrap().len(), 2);
}

#[test]
fn retire_canary_disables_targets() {
    let engine = test_engine();
    activate(&engine, "cfg/a", "1");
    let placed = engine.propose_update("cfg/a", "2", "int", 7).unwrap();
    engine
        .start_or_extend_canary("cfg/a", 9, Decision::Accept, &hosts(&["10.0.0.1"]))
        .unwrap();

    engine.retire_key(placed.id, 1).unwrap();
    assert!(engine.canary_status(placed.id).unwrap().enabled_hosts.is_empty());
    assert_eq!(
        engine.get_active_values("cfg", "10.0.0.1").unwrap()[0].value,
        "1"
    );
    engine.propose_update("cfg/a", "3", "int", 7).unwrap();
}

// ── Deletes ─────────────────────────────────────────────────────

#[test]
fn delete_then_recreate() {
    let engine = test_engine();
    activate(&engine, "cfg/a", "1");
    engine.propose_delete("cfg/a", "", "int", 7).unwrap();
    engine.approve_delete("cfg/a", 9, Decision::Accept).unwrap();
    assert!(matches!(
        engine.get_active_value("cfg/a"),
        Err(EngineError::NotFound(_))
    ));

    activate(&engine, "cfg/a", "5");
    assert_eq!(engine.get_active_value("cfg/a").unwrap().value, "5");
    // The tombstone stays as history.
    assert_eq!(count(&engine, "cfg/a", KeyStatus::Deleted), 1);
    assert_eq!(count(&engine, "cfg/a", KeyStatus::ExpiredActive), 1);
}

// ── Restart ─────────────────────────────────────────────────────

#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keyflag.redb");

    let pending_id = {
        let engine = KeyLifecycle::with_defaults(StateStore::open(&path).unwrap());
        activate(&engine, "cfg/a", "1");
        engine.propose_update("cfg/a", "2", "int", 7).unwrap().id
    };

    let engine = KeyLifecycle::with_defaults(StateStore::open(&path).unwrap());
    assert_eq!(engine.warm_cache().unwrap(), 1);
    assert_eq!(engine.get_active_value("cfg/a").unwrap().value, "1");
    assert!(matches!(
        engine.propose_update("cfg/a", "3", "int", 7),
        Err(EngineError::Conflict(_))
    ));

    let outcome = engine.approve("cfg/a", 9, Decision::Accept).unwrap();
    assert_eq!(outcome.record.source_id, Some(pending_id));
    assert_eq!(engine.get_active_value("cfg/a").unwrap().value, "2");
}
