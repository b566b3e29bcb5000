//! Behaviour shared by every persistence implementation.

use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;
use rstest::rstest;
use serde_json::json;
use tempfile::TempDir;

use super::{FilePersistence, MemoryPersistence, Persistence};
use crate::error::PersistenceError;
use crate::log_record::{Log, PersistedLog};

const GROUP: &str = "group_test";

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(secs)
}

fn numbered(n: i64) -> Log {
    Log::with_timestamp("event", at(n), json!({ "n": n }))
}

fn numbers(logs: &[PersistedLog]) -> Vec<i64> {
    logs.iter()
        .map(|p| p.log.payload["n"].as_i64().expect("numbered payload"))
        .collect()
}

/// Either store kind, keeping the temporary directory alive for file stores.
struct Store {
    persistence: Box<dyn Persistence>,
    _dir: Option<TempDir>,
}

fn memory(capacity: usize) -> Store {
    Store {
        persistence: Box::new(MemoryPersistence::new(capacity)),
        _dir: None,
    }
}

fn file(capacity: usize) -> Store {
    let dir = TempDir::new().expect("create temp dir");
    let persistence =
        FilePersistence::with_capacity(dir.path(), capacity).expect("open file persistence");
    Store {
        persistence: Box::new(persistence),
        _dir: Some(dir),
    }
}

fn store_factory(on_disk: bool) -> fn(usize) -> Store {
    if on_disk { file as fn(usize) -> Store } else { memory }
}

#[rstest]
#[case::memory(false)]
#[case::file(true)]
fn round_trip_returns_logs_in_fifo_order(#[case] on_disk: bool) {
    let mut store = store_factory(on_disk)(300);
    let p = store.persistence.as_mut();
    for n in 0..5 {
        p.put_log(GROUP, numbered(n)).expect("put log");
    }
    let mut out = Vec::new();
    let token = p.get_logs(GROUP, 5, &mut out).expect("token");
    assert_eq!(numbers(&out), vec![0, 1, 2, 3, 4]);
    assert!(out.iter().all(|l| l.group == GROUP));

    p.delete_batch(GROUP, &token);
    assert_eq!(p.count_logs(GROUP), 0);
}

#[rstest]
#[case::memory(false)]
#[case::file(true)]
fn claimed_logs_are_excluded_until_released(#[case] on_disk: bool) {
    let mut store = store_factory(on_disk)(300);
    let p = store.persistence.as_mut();
    for n in 0..4 {
        p.put_log(GROUP, numbered(n)).expect("put log");
    }
    let mut first = Vec::new();
    let token = p.get_logs(GROUP, 2, &mut first).expect("first claim");
    let mut second = Vec::new();
    p.get_logs(GROUP, 10, &mut second).expect("second claim");
    assert_eq!(numbers(&first), vec![0, 1]);
    assert_eq!(numbers(&second), vec![2, 3]);

    let mut none = Vec::new();
    assert!(p.get_logs(GROUP, 10, &mut none).is_none());
    assert!(none.is_empty());
    assert_eq!(p.count_logs(GROUP), 4);

    p.release_logs(GROUP, &token);
    let mut again = Vec::new();
    p.get_logs(GROUP, 10, &mut again).expect("released logs claimable");
    assert_eq!(numbers(&again), vec![0, 1]);
}

#[rstest]
#[case::memory(false)]
#[case::file(true)]
fn clear_pending_log_state_releases_every_claim(#[case] on_disk: bool) {
    let mut store = store_factory(on_disk)(300);
    let p = store.persistence.as_mut();
    for n in 0..3 {
        p.put_log(GROUP, numbered(n)).expect("put log");
    }
    let mut out = Vec::new();
    p.get_logs(GROUP, 3, &mut out).expect("claim");
    p.clear_pending_log_state();
    let mut again = Vec::new();
    p.get_logs(GROUP, 3, &mut again).expect("claim after clear");
    assert_eq!(numbers(&again), vec![0, 1, 2]);
}

#[rstest]
#[case::memory(false)]
#[case::file(true)]
fn capacity_evicts_single_oldest_log(#[case] on_disk: bool) {
    let capacity = 5;
    let mut store = store_factory(on_disk)(capacity);
    let p = store.persistence.as_mut();
    for n in 0..=capacity as i64 {
        p.put_log(GROUP, numbered(n)).expect("put log");
    }
    assert_eq!(p.count_logs(GROUP), capacity);
    let mut out = Vec::new();
    p.get_logs(GROUP, 100, &mut out).expect("claim");
    assert_eq!(numbers(&out), vec![1, 2, 3, 4, 5]);
}

#[rstest]
#[case::memory(false)]
#[case::file(true)]
fn pending_count_ignores_evicted_claims(#[case] on_disk: bool) {
    let mut store = store_factory(on_disk)(3);
    let p = store.persistence.as_mut();
    for n in 0..3 {
        p.put_log(GROUP, numbered(n)).expect("put log");
    }
    let mut out = Vec::new();
    let token = p.get_logs(GROUP, 3, &mut out).expect("claim");
    assert_eq!(p.count_pending_logs(GROUP), 0);

    for n in 3..6 {
        p.put_log(GROUP, numbered(n)).expect("put log");
    }
    assert_eq!(p.count_logs(GROUP), 3);
    assert_eq!(p.count_pending_logs(GROUP), 3);

    p.delete_batch(GROUP, &token);
    assert_eq!(p.count_logs(GROUP), 3);
    assert_eq!(p.count_pending_logs(GROUP), 3);
}

#[rstest]
#[case::memory(false)]
#[case::file(true)]
fn delete_logs_clears_group_only(#[case] on_disk: bool) {
    let mut store = store_factory(on_disk)(300);
    let p = store.persistence.as_mut();
    p.put_log(GROUP, numbered(1)).expect("put log");
    p.put_log("other", numbered(2)).expect("put log");
    p.delete_logs(GROUP);
    assert_eq!(p.count_logs(GROUP), 0);
    assert_eq!(p.count_logs("other"), 1);
}

#[rstest]
#[case::memory(false)]
#[case::file(true)]
fn zero_limit_claims_nothing(#[case] on_disk: bool) {
    let mut store = store_factory(on_disk)(300);
    let p = store.persistence.as_mut();
    p.put_log(GROUP, numbered(1)).expect("put log");
    let mut out = Vec::new();
    assert!(p.get_logs(GROUP, 0, &mut out).is_none());
}

#[rstest]
#[case::memory(false)]
#[case::file(true)]
fn rejects_writes_after_close(#[case] on_disk: bool) {
    let mut store = store_factory(on_disk)(300);
    let p = store.persistence.as_mut();
    p.close().expect("close");
    let err = p.put_log(GROUP, numbered(1)).expect_err("closed store");
    assert!(matches!(err, PersistenceError::Closed));
}

#[rstest]
#[case("")]
#[case("../escape")]
#[case(".hidden")]
#[case("a/b")]
fn rejects_unsafe_group_names(#[case] group: &str) {
    let mut p = MemoryPersistence::default();
    let err = p.put_log(group, numbered(1)).expect_err("invalid group");
    assert!(matches!(err, PersistenceError::InvalidGroup(_)));
}

#[rstest]
fn file_store_survives_reopen() {
    let dir = TempDir::new().expect("create temp dir");
    {
        let mut p = FilePersistence::open(dir.path()).expect("open");
        for n in 0..3 {
            p.put_log(GROUP, numbered(n)).expect("put log");
        }
        // claim state is volatile and must not hide logs after a restart
        let mut out = Vec::new();
        p.get_logs(GROUP, 2, &mut out).expect("claim");
    }
    let mut reopened = FilePersistence::open(dir.path()).expect("reopen");
    assert_eq!(reopened.count_logs(GROUP), 3);
    let id = reopened.put_log(GROUP, numbered(3)).expect("put after reopen");
    assert!(id.0 > 3, "ids continue above recovered ones");
    let mut out = Vec::new();
    reopened.get_logs(GROUP, 10, &mut out).expect("claim");
    assert_eq!(numbers(&out), vec![0, 1, 2, 3]);
}

#[rstest]
fn file_store_discards_corrupt_files_on_open() {
    let dir = TempDir::new().expect("create temp dir");
    {
        let mut p = FilePersistence::open(dir.path()).expect("open");
        p.put_log(GROUP, numbered(1)).expect("put log");
    }
    let corrupt = dir.path().join(GROUP).join(format!("{:020}.log", 99));
    std::fs::write(&corrupt, b"not msgpack").expect("write corrupt file");

    let p = FilePersistence::open(dir.path()).expect("reopen");
    assert_eq!(p.count_logs(GROUP), 1);
    assert!(!corrupt.exists());
}

proptest! {
    #[test]
    fn claims_never_overlap(batch in 1usize..8, total in 0usize..40) {
        let mut p = MemoryPersistence::new(300);
        for n in 0..total as i64 {
            p.put_log(GROUP, numbered(n)).expect("put log");
        }
        let mut seen = std::collections::HashSet::new();
        loop {
            let mut out = Vec::new();
            if p.get_logs(GROUP, batch, &mut out).is_none() {
                break;
            }
            prop_assert!(out.len() <= batch);
            for log in out {
                prop_assert!(seen.insert(log.id));
            }
        }
        prop_assert_eq!(seen.len(), total);
    }

    #[test]
    fn count_never_exceeds_capacity(capacity in 1usize..20, total in 0usize..60) {
        let mut p = MemoryPersistence::new(capacity);
        for n in 0..total as i64 {
            p.put_log(GROUP, numbered(n)).expect("put log");
            prop_assert!(p.count_logs(GROUP) <= capacity);
        }
        prop_assert_eq!(p.count_logs(GROUP), total.min(capacity));
    }
}
