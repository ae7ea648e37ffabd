//! Parsed-statement cache behavior observed through the live runtime:
//! hit accounting, version-tag invalidation and the disabled boundary.

mod common;

use std::time::Duration;

use shunt_core::AssignPolicy;
use shunt_protocol::{SqlDialect, VersionTag};

use common::{wait_until, Harness, HarnessOpts};

#[test]
fn test_cache_hit_path() {
    let h = Harness::start(HarnessOpts {
        workers: 4,
        cache_max_bytes: 4 << 20,
        assign: AssignPolicy::Pinned(0),
        ..Default::default()
    });
    let mut client = h.client();

    client.query("SELECT 1").unwrap();
    let stats = h.runtime.cache_stats();
    assert_eq!(stats.len(), 4);
    assert_eq!(stats[0].inserts, 1);
    assert_eq!(stats[0].misses, 1);
    assert_eq!(stats[0].hits, 0);
    assert!(stats[0].size > 0);
    let size_after_insert = stats[0].size;

    for _ in 0..20 {
        client.query("SELECT 1").unwrap();
    }
    let stats = h.runtime.cache_stats();
    assert_eq!(stats[0].hits, 20);
    assert_eq!(stats[0].inserts, 1);
    assert_eq!(stats[0].size, size_after_insert, "hits must not grow the cache");

    // The other workers never saw the statement.
    for s in &stats[1..] {
        assert_eq!(s.inserts, 0);
        assert_eq!(s.size, 0);
    }
}

#[test]
fn test_version_tag_invalidation() {
    let h = Harness::start(HarnessOpts {
        cache_max_bytes: 1 << 20,
        ..Default::default()
    });
    let mut client = h.client();
    client.query("SELECT 42").unwrap();
    let before = h.runtime.cache_stats()[0];
    assert_eq!(before.inserts, 1);

    h.runtime
        .set_parser_version(VersionTag::new(SqlDialect::Oracle, 0));

    client.query("SELECT 42").unwrap();
    let after = h.runtime.cache_stats()[0];
    assert_eq!(after.misses, before.misses + 1, "stale tag is a miss");
    assert_eq!(after.evictions, before.evictions + 1, "stale entry evicted");
    assert_eq!(after.inserts, 2, "fresh result re-inserted under new tag");
}

#[test]
fn test_cache_disabled_runs_producer_every_time() {
    let h = Harness::start(HarnessOpts {
        cache_max_bytes: 0,
        ..Default::default()
    });
    let mut client = h.client();
    for _ in 0..5 {
        client.query("SELECT 7").unwrap();
    }
    let stats = h.runtime.cache_stats()[0];
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.inserts, 0);
    assert_eq!(stats.misses, 5);
    assert_eq!(stats.size, 0);
}

#[test]
fn test_session_state_statements_are_not_cached() {
    let h = Harness::start(HarnessOpts {
        cache_max_bytes: 1 << 20,
        ..Default::default()
    });
    let mut client = h.client();
    client.query("SET mode=fast").unwrap();
    client.query("SET mode=fast").unwrap();
    let stats = h.runtime.cache_stats()[0];
    assert_eq!(stats.inserts, 0, "exclusion class must never be cached");
    assert_eq!(stats.misses, 2);
}

#[test]
fn test_cache_state_snapshot_lists_entries() {
    let h = Harness::start(HarnessOpts {
        cache_max_bytes: 1 << 20,
        ..Default::default()
    });
    let mut client = h.client();
    client.query("SELECT 1").unwrap();
    client.query("SELECT 1").unwrap();
    client.query("INSERT x").unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        let state = h.runtime.cache_state();
        let entries = &state[0];
        entries.len() == 2
            && entries
                .iter()
                .any(|e| e.canonical == "select ?" && e.hits == 1)
    }));
}

#[test]
fn test_runtime_cache_shrink_evicts() {
    let h = Harness::start(HarnessOpts {
        cache_max_bytes: 1 << 20,
        ..Default::default()
    });
    let mut client = h.client();
    client.query("SELECT a").unwrap();
    client.query("SELECT b b").unwrap();
    assert!(h.runtime.cache_stats()[0].size > 0);
    h.runtime.set_cache_max_bytes(0);
    let stats = h.runtime.cache_stats()[0];
    assert_eq!(stats.size, 0, "shrink to zero must evict everything");
    assert_eq!(stats.entries, 0);
}
