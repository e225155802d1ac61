//! Cache coordinator: build-once, invalidation, transactions and eviction

use crawl_coord::cache::{
    BasicCacheDescription, CacheDescription, CacheExecutor, CachedObject, cache_keys,
};
use crawl_coord::{Cache, CoordinationConfig, CoordinationError, CoordinationResult, LockSystem, StringSet};
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

mod common;

fn keys(members: &[&str]) -> StringSet {
    members.iter().copied().collect()
}

fn description(id: &str, members: &[&str]) -> Arc<dyn CacheDescription> {
    Arc::new(BasicCacheDescription::new(id, keys(members)))
}

/// Executor that only invalidates
struct Invalidate;

impl CacheExecutor for Invalidate {
    fn create(&mut self, missing: &[&dyn CacheDescription]) -> CoordinationResult<Vec<CachedObject>> {
        Ok(missing
            .iter()
            .map(|_| Arc::new(()) as CachedObject)
            .collect())
    }

    fn exists(&mut self, _: &dyn CacheDescription, _: &CachedObject) -> CoordinationResult<()> {
        Ok(())
    }

    fn execute(&mut self) -> CoordinationResult<()> {
        Ok(())
    }
}

/// Executor that builds numbered strings and records what it saw
#[derive(Default)]
struct Recorder {
    built: usize,
    seen: Vec<String>,
}

impl CacheExecutor for Recorder {
    fn create(&mut self, missing: &[&dyn CacheDescription]) -> CoordinationResult<Vec<CachedObject>> {
        Ok(missing
            .iter()
            .map(|d| {
                self.built += 1;
                Arc::new(format!("{}#{}", d.object_id(), self.built)) as CachedObject
            })
            .collect())
    }

    fn exists(&mut self, _: &dyn CacheDescription, object: &CachedObject) -> CoordinationResult<()> {
        if let Some(value) = object.downcast_ref::<String>() {
            self.seen.push(value.clone());
        }
        Ok(())
    }

    fn execute(&mut self) -> CoordinationResult<()> {
        Ok(())
    }
}

#[test]
fn test_lookup_or_build_builds_once() {
    let system = common::in_process_system();
    let cache = Cache::new(&system);
    let mut manager = cache.manager(system.session());
    let builds = AtomicUsize::new(0);
    let desc = description("jobs", &[cache_keys::jobs_key().as_str()]);

    for _ in 0..3 {
        let value: Arc<String> = manager
            .lookup_or_build(Arc::clone(&desc), || {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok("job list".to_string())
            })
            .expect("lookup");
        assert_eq!(value.as_str(), "job list");
    }
    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(manager.cache_size(), 1);
    assert_eq!(manager.lock_manager().held_lock_count(), 0);
}

#[test]
fn test_invalidating_any_key_drops_the_object() {
    let system = common::in_process_system();
    let cache = Cache::new(&system);
    let mut manager = cache.manager(system.session());
    let desc = description("row", &["table-a", "table-b"]);
    let builds = AtomicUsize::new(0);
    let build = || -> CoordinationResult<u32> {
        builds.fetch_add(1, Ordering::SeqCst);
        Ok(7)
    };

    manager.lookup_or_build(Arc::clone(&desc), build).expect("first");
    manager
        .find_objects_and_execute(&[], Some(&keys(&["table-b"])), &mut Invalidate, None)
        .expect("invalidate");
    assert_eq!(manager.cache_size(), 0);
    manager.lookup_or_build(Arc::clone(&desc), build).expect("rebuild");
    assert_eq!(builds.load(Ordering::SeqCst), 2);

    manager
        .find_objects_and_execute(&[], Some(&keys(&["unrelated"])), &mut Invalidate, None)
        .expect("invalidate");
    manager.lookup_or_build(desc, build).expect("hit");
    assert_eq!(builds.load(Ordering::SeqCst), 2);
}

#[test]
fn test_concurrent_misses_build_at_most_once() {
    let system = common::in_process_system();
    let cache = Cache::new(&system);
    let builds = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let system = Arc::clone(&system);
            let cache = Arc::clone(&cache);
            let builds = Arc::clone(&builds);
            thread::spawn(move || {
                let mut manager = cache.manager(system.session());
                let value: Arc<u64> = manager
                    .lookup_or_build(description("expensive", &["k"]), || {
                        builds.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        Ok(42u64)
                    })
                    .expect("lookup");
                *value
            })
        })
        .collect();
    for worker in workers {
        assert_eq!(worker.join().expect("worker panicked"), 42);
    }
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[test]
fn test_uncacheable_descriptions_are_always_built() {
    let system = common::in_process_system();
    let cache = Cache::new(&system);
    let mut manager = cache.manager(system.session());
    let desc: Arc<dyn CacheDescription> = Arc::new(BasicCacheDescription::uncacheable("live"));

    let mut recorder = Recorder::default();
    manager
        .find_objects_and_execute(&[Arc::clone(&desc)], None, &mut recorder, None)
        .expect("first");
    manager
        .find_objects_and_execute(&[desc], None, &mut recorder, None)
        .expect("second");
    assert_eq!(recorder.built, 2);
    assert_eq!(recorder.seen, vec!["live#1", "live#2"]);
    assert_eq!(manager.cache_size(), 0);
}

#[test]
fn test_build_failure_caches_nothing() {
    let system = common::in_process_system();
    let cache = Cache::new(&system);
    let mut manager = cache.manager(system.session());
    let result: CoordinationResult<Arc<u8>> = manager
        .lookup_or_build(description("flaky", &["k"]), || {
            Err(CoordinationError::Setup("backend down".into()))
        });
    assert!(matches!(result, Err(CoordinationError::Setup(_))));
    assert_eq!(manager.cache_size(), 0);
    assert_eq!(manager.lock_manager().held_lock_count(), 0);
}

#[test]
fn test_invalidation_reaches_other_processes() {
    let dir = common::create_synch_dir();
    let first = common::file_system(dir.path());
    let second = common::file_system(dir.path());
    let first_cache = Cache::new(&first);
    let second_cache = Cache::new(&second);
    let mut reader = first_cache.manager(first.session());
    let mut writer = second_cache.manager(second.session());

    let table = cache_keys::table_key("crawl", "jobqueue");
    let desc = description("queue-depth", &[table.as_str()]);
    let builds = AtomicUsize::new(0);
    let build = || -> CoordinationResult<usize> { Ok(builds.fetch_add(1, Ordering::SeqCst)) };

    reader.lookup_or_build(Arc::clone(&desc), build).expect("build");
    reader.lookup_or_build(Arc::clone(&desc), build).expect("hit");
    assert_eq!(builds.load(Ordering::SeqCst), 1);

    let handle = writer
        .enter_cache(&[], Some(&keys(&[table.as_str()])), None)
        .expect("enter");
    writer.invalidate_keys(&handle).expect("invalidate");
    writer.leave_cache(handle).expect("leave");

    reader.lookup_or_build(desc, build).expect("rebuild");
    assert_eq!(builds.load(Ordering::SeqCst), 2);
}

#[test]
fn test_transaction_defers_invalidation_until_commit() {
    let system = common::in_process_system();
    let cache = Cache::new(&system);
    let mut manager = cache.manager(system.session());
    let desc = description("doc", &["k"]);
    manager
        .lookup_or_build(Arc::clone(&desc), || Ok("v1".to_string()))
        .expect("seed");

    manager.start_transaction("t1", None).expect("start");
    let handle = manager
        .enter_cache(&[], Some(&keys(&["k"])), Some("t1"))
        .expect("enter");
    manager.invalidate_keys(&handle).expect("record");
    manager.leave_cache(handle).expect("leave");

    // Shared cache untouched until commit; the transaction no longer sees it
    assert_eq!(manager.cache_size(), 1);
    let mut recorder = Recorder::default();
    manager
        .find_objects_and_execute(&[Arc::clone(&desc)], None, &mut recorder, Some("t1"))
        .expect("lookup in transaction");
    assert_eq!(recorder.built, 1);
    assert_eq!(recorder.seen, vec!["doc#1"]);

    manager.commit_transaction("t1").expect("commit");
    let value: Arc<String> = manager
        .lookup_or_build(desc, || Ok("unused".to_string()))
        .expect("after commit");
    assert_eq!(value.as_str(), "doc#1");
    assert_eq!(manager.lock_manager().held_lock_count(), 0);
}

#[test]
fn test_rollback_discards_pending_invalidations() {
    let system = common::in_process_system();
    let cache = Cache::new(&system);
    let mut manager = cache.manager(system.session());
    let desc = description("doc", &["k"]);
    manager
        .lookup_or_build(Arc::clone(&desc), || Ok(1u32))
        .expect("seed");

    manager.start_transaction("outer", None).expect("outer");
    manager.start_transaction("inner", Some("outer")).expect("inner");
    let handle = manager
        .enter_cache(&[], Some(&keys(&["k"])), Some("inner"))
        .expect("enter");
    manager.invalidate_keys(&handle).expect("record");
    manager.leave_cache(handle).expect("leave");
    manager.commit_transaction("inner").expect("fold into outer");
    manager.rollback_transaction("outer").expect("rollback");

    assert_eq!(manager.cache_size(), 1);
    assert_eq!(manager.lock_manager().held_lock_count(), 0);
}

#[test]
fn test_invalidating_a_key_read_in_the_transaction_is_illegal() {
    let system = common::in_process_system();
    let cache = Cache::new(&system);
    let mut manager = cache.manager(system.session());
    manager.start_transaction("t", None).expect("start");

    let handle = manager
        .enter_cache(&[description("doc", &["k"])], None, Some("t"))
        .expect("read");
    manager.leave_cache(handle).expect("leave");

    let err = manager
        .enter_cache(&[], Some(&keys(&["k"])), Some("t"))
        .expect_err("upgrade");
    assert!(matches!(err, CoordinationError::IllegalSequence { .. }));
    manager.rollback_transaction("t").expect("rollback");
}

#[test]
fn test_lru_class_budget_from_config() {
    let config = CoordinationConfig::builder()
        .in_process()
        .cache_class_limit("rows", 2)
        .build()
        .expect("config");
    let system = LockSystem::open(&config).expect("system");
    let cache = Cache::new(&system);
    let mut manager = cache.manager(system.session());

    for id in ["r1", "r2", "r3"] {
        let desc: Arc<dyn CacheDescription> =
            Arc::new(BasicCacheDescription::new(id, keys(&[id])).with_class("rows", 100));
        manager.lookup_or_build(desc, || Ok(id.len())).expect("build");
    }
    assert_eq!(manager.cache_size(), 2);

    // r1 was least recently used
    let builds = AtomicUsize::new(0);
    let r1: Arc<dyn CacheDescription> =
        Arc::new(BasicCacheDescription::new("r1", keys(&["r1"])).with_class("rows", 100));
    manager
        .lookup_or_build(r1, || {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok(0usize)
        })
        .expect("rebuild");
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[test]
fn test_expire_objects_sweeps_stale_entries() {
    let system = common::in_process_system();
    let cache = Cache::new(&system);
    let mut manager = cache.manager(system.session());
    let desc: Arc<dyn CacheDescription> = Arc::new(
        BasicCacheDescription::new("ttl", keys(&["k"])).with_time_to_live(Duration::from_secs(60)),
    );
    manager.lookup_or_build(desc, || Ok(())).expect("build");
    manager
        .lookup_or_build(description("forever", &["k2"]), || Ok(()))
        .expect("build");

    let now = crawl_coord::utils::now_ms();
    assert_eq!(manager.expire_objects(now), 0);
    assert_eq!(manager.expire_objects(now + 120_000), 1);
    assert_eq!(manager.cache_size(), 1);
}

proptest! {
    /// Key sets are equal regardless of the order members were added
    #[test]
    fn prop_string_set_order_independent(mut members in proptest::collection::vec("[a-z:\\\\]{0,6}", 0..8)) {
        let forward: StringSet = members.iter().cloned().collect();
        members.reverse();
        let backward: StringSet = members.iter().cloned().collect();
        prop_assert_eq!(forward.descriptive_string(), backward.descriptive_string());
        prop_assert_eq!(forward, backward);
    }
}
