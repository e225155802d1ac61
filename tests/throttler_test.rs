//! Connection, fetch-interval and byte-rate throttling

use crawl_coord::throttler::{FixedThrottleSpec, RegexThrottleSpec, ThrottleLimits};
use crawl_coord::{CancelToken, CoordinationError, Throttler};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

mod common;

const GROUP_TYPE: &str = "web";

fn throttler_with(limits: ThrottleLimits) -> Arc<Throttler> {
    let system = common::in_process_system();
    let throttler = Arc::new(Throttler::new(&system));
    throttler
        .update_throttle_specification(GROUP_TYPE, "default", Arc::new(FixedThrottleSpec::new(limits)))
        .expect("create group");
    throttler
}

#[test]
fn test_connection_cap_is_never_exceeded() {
    let throttler = throttler_with(ThrottleLimits::unlimited().max_connections(2));
    let open = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..6)
        .map(|_| {
            let throttler = Arc::clone(&throttler);
            let open = Arc::clone(&open);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                let cancel = CancelToken::new();
                for _ in 0..3 {
                    let fetch = throttler
                        .obtain_connection_permission(GROUP_TYPE, "default", &["example.com"], &cancel)
                        .expect("permission");
                    let now_open = open.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now_open, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    open.fetch_sub(1, Ordering::SeqCst);
                    throttler.release_connection_permission(fetch);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_fetch_interval_spaces_connections() {
    // One connection, 60 fetches per minute: successive grants are >= 1000ms apart
    let throttler = throttler_with(
        ThrottleLimits::unlimited()
            .max_connections(1)
            .max_fetches_per_min(60),
    );
    let cancel = CancelToken::new();

    let first = throttler
        .obtain_connection_permission(GROUP_TYPE, "default", &["slow.org"], &cancel)
        .expect("first");
    let granted_first = Instant::now();

    let waiter = {
        let throttler = Arc::clone(&throttler);
        thread::spawn(move || {
            let cancel = CancelToken::new();
            let fetch = throttler
                .obtain_connection_permission(GROUP_TYPE, "default", &["slow.org"], &cancel)
                .expect("second");
            let granted = Instant::now();
            throttler.release_connection_permission(fetch);
            granted
        })
    };

    // Releasing early frees the connection but not the fetch slot
    thread::sleep(Duration::from_millis(100));
    throttler.release_connection_permission(first);
    let granted_second = waiter.join().expect("waiter panicked");
    assert!(granted_second.duration_since(granted_first) >= Duration::from_millis(990));
}

#[test]
fn test_later_fetches_on_a_connection_are_spaced() {
    let throttler = throttler_with(ThrottleLimits::unlimited().min_ms_per_fetch(200));
    let cancel = CancelToken::new();
    let mut fetch = throttler
        .obtain_connection_permission(GROUP_TYPE, "default", &["a.com"], &cancel)
        .expect("permission");

    let start = Instant::now();
    fetch.obtain_fetch_document_permission().expect("pre-granted");
    assert!(start.elapsed() < Duration::from_millis(100));
    fetch.obtain_fetch_document_permission().expect("second fetch");
    fetch.obtain_fetch_document_permission().expect("third fetch");
    assert!(start.elapsed() >= Duration::from_millis(390));
}

#[test]
fn test_byte_rate_is_enforced_after_calibration() {
    // 10 KB/s: five 1000-byte reads cannot finish in much under 500ms
    let throttler = throttler_with(ThrottleLimits::unlimited().max_bytes_per_sec(10_000));
    let cancel = CancelToken::new();
    let fetch = throttler
        .obtain_connection_permission(GROUP_TYPE, "default", &["big.net"], &cancel)
        .expect("permission");
    let mut stream = fetch.create_fetch_stream();

    let start = Instant::now();
    stream.begin_read(1000).expect("calibrating read");
    assert!(start.elapsed() < Duration::from_millis(50), "first read is not delayed");
    stream.end_read(1000, 1000);
    for _ in 0..4 {
        stream.begin_read(1000).expect("read");
        stream.end_read(1000, 1000);
    }
    assert!(start.elapsed() >= Duration::from_millis(450));
    stream.close();
    fetch.release();
}

#[test]
fn test_zero_byte_calibration_does_not_stall() {
    let throttler = throttler_with(ThrottleLimits::unlimited().max_bytes_per_sec(1_000_000));
    let cancel = CancelToken::new();
    let fetch = throttler
        .obtain_connection_permission(GROUP_TYPE, "default", &["empty.net"], &cancel)
        .expect("permission");
    let mut stream = fetch.create_fetch_stream();
    stream.begin_read(4096).expect("calibrate");
    stream.end_read(4096, 0);
    let start = Instant::now();
    stream.begin_read(100).expect("read");
    stream.end_read(100, 100);
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[test]
fn test_unknown_group_is_setup_error() {
    let throttler = throttler_with(ThrottleLimits::unlimited());
    let err = throttler
        .obtain_connection_permission(GROUP_TYPE, "missing", &["x"], &CancelToken::new())
        .expect_err("unknown group");
    assert!(matches!(err, CoordinationError::Setup(_)));
}

#[test]
fn test_zero_connections_is_resource_exhausted() {
    let throttler = throttler_with(ThrottleLimits::unlimited().max_connections(0));
    let err = throttler
        .obtain_connection_permission(GROUP_TYPE, "default", &["x"], &CancelToken::new())
        .expect_err("no connections allowed");
    assert!(matches!(err, CoordinationError::ResourceExhausted(_)));
}

#[test]
fn test_waiter_is_interrupted_and_leaves_no_reservation() {
    let throttler = throttler_with(ThrottleLimits::unlimited().max_connections(1));
    let held = throttler
        .obtain_connection_permission(GROUP_TYPE, "default", &["h"], &CancelToken::new())
        .expect("first");

    let cancel = CancelToken::new();
    let waiter = {
        let throttler = Arc::clone(&throttler);
        let cancel = cancel.clone();
        thread::spawn(move || {
            throttler
                .obtain_connection_permission(GROUP_TYPE, "default", &["h"], &cancel)
                .map(|_| ())
        })
    };
    thread::sleep(Duration::from_millis(50));
    cancel.cancel();
    assert!(matches!(
        waiter.join().expect("waiter panicked"),
        Err(CoordinationError::Interrupted)
    ));

    held.release();
    let again = throttler
        .obtain_connection_permission(GROUP_TYPE, "default", &["h"], &CancelToken::new())
        .expect("slot is free again");
    again.release();
}

#[test]
fn test_removing_group_wakes_waiters() {
    let throttler = throttler_with(ThrottleLimits::unlimited().max_connections(1));
    let held = throttler
        .obtain_connection_permission(GROUP_TYPE, "default", &["h"], &CancelToken::new())
        .expect("first");

    let waiter = {
        let throttler = Arc::clone(&throttler);
        thread::spawn(move || {
            throttler
                .obtain_connection_permission(GROUP_TYPE, "default", &["h"], &CancelToken::new())
                .map(|_| ())
        })
    };
    thread::sleep(Duration::from_millis(50));
    throttler
        .remove_throttle_group(GROUP_TYPE, "default")
        .expect("remove");
    assert!(matches!(
        waiter.join().expect("waiter panicked"),
        Err(CoordinationError::Setup(_))
    ));
    assert!(throttler.get_throttle_groups(GROUP_TYPE).is_empty());
    drop(held);
}

#[test]
fn test_multi_bin_permission_respects_every_bin() {
    let spec = RegexThrottleSpec::new()
        .with_rule(r"^host-a$", ThrottleLimits::unlimited().max_connections(1))
        .expect("pattern");
    let system = common::in_process_system();
    let throttler = Throttler::new(&system);
    throttler
        .update_throttle_specification(GROUP_TYPE, "regex", Arc::new(spec))
        .expect("create group");

    let cancel = CancelToken::new();
    let both = throttler
        .obtain_connection_permission(GROUP_TYPE, "regex", &["host-b", "host-a"], &cancel)
        .expect("both bins");
    assert_eq!(both.bin_names(), vec!["host-a", "host-b"]);

    // host-b alone is unlimited
    let b_only = throttler
        .obtain_connection_permission(GROUP_TYPE, "regex", &["host-b"], &cancel)
        .expect("unlimited bin");
    b_only.release();
    both.release();

    assert_eq!(throttler.bin_count(), 2);
    assert_eq!(throttler.free_unused_resources().expect("free"), 2);
    assert_eq!(throttler.bin_count(), 0);
}

#[test]
fn test_processes_split_connection_limit() {
    // Two throttlers on one lock system behave like two processes
    let system = common::in_process_system();
    let first = Throttler::new(&system);
    let second = Arc::new(Throttler::new(&system));
    let spec = Arc::new(FixedThrottleSpec::new(ThrottleLimits::unlimited().max_connections(4)));
    first
        .update_throttle_specification(GROUP_TYPE, "shared", spec.clone())
        .expect("first group");
    second
        .update_throttle_specification(GROUP_TYPE, "shared", spec)
        .expect("second group");

    let cancel = CancelToken::new();
    let held: Vec<_> = (0..3)
        .map(|_| {
            first
                .obtain_connection_permission(GROUP_TYPE, "shared", &["bin"], &cancel)
                .expect("first process")
        })
        .collect();

    let waiter = {
        let second = Arc::clone(&second);
        thread::spawn(move || {
            second
                .obtain_connection_permission(GROUP_TYPE, "shared", &["bin"], &CancelToken::new())
                .map(|fetch| fetch.release())
        })
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while !waiter.is_finished() && Instant::now() < deadline {
        first.poll(GROUP_TYPE).expect("poll first");
        second.poll(GROUP_TYPE).expect("poll second");
        thread::sleep(Duration::from_millis(20));
    }
    waiter
        .join()
        .expect("waiter panicked")
        .expect("second process got a share");

    // The first process now holds more than its fair half
    first.poll(GROUP_TYPE).expect("poll first");
    assert_eq!(
        first
            .over_connection_quota_count(GROUP_TYPE, "shared", &["bin", "other"])
            .expect("quota"),
        1
    );
    drop(held);
}

#[test]
fn test_interrupted_read_does_not_charge_the_series() {
    // Two connections share one bin and therefore one series
    let throttler = throttler_with(ThrottleLimits::unlimited().max_bytes_per_sec(10_000));
    let cancel_a = CancelToken::new();
    let fetch_a = throttler
        .obtain_connection_permission(GROUP_TYPE, "default", &["h"], &cancel_a)
        .expect("connection a");
    let fetch_b = throttler
        .obtain_connection_permission(GROUP_TYPE, "default", &["h"], &CancelToken::new())
        .expect("connection b");
    let mut stream_a = fetch_a.create_fetch_stream();
    let mut stream_b = fetch_b.create_fetch_stream();

    stream_a.begin_read(1000).expect("calibrate");
    stream_a.end_read(1000, 1000);

    let big_read = thread::spawn(move || {
        let result = stream_a.begin_read(100_000);
        (stream_a, result)
    });
    thread::sleep(Duration::from_millis(100));
    cancel_a.cancel();
    let (stream_a, result) = big_read.join().expect("reader panicked");
    assert!(matches!(result, Err(CoordinationError::Interrupted)));

    // Only 2000 bytes are due: roughly 200ms from the series start
    let start = Instant::now();
    stream_b.begin_read(1000).expect("read b");
    assert!(start.elapsed() < Duration::from_millis(500));
    stream_b.end_read(1000, 1000);

    stream_b.close();
    stream_a.close();
    fetch_b.release();
    fetch_a.release();
}

#[test]
fn test_waiting_reader_sees_raised_rate() {
    let throttler = throttler_with(ThrottleLimits::unlimited().max_bytes_per_sec(1_000));
    let fetch = throttler
        .obtain_connection_permission(GROUP_TYPE, "default", &["h"], &CancelToken::new())
        .expect("permission");
    let mut stream = fetch.create_fetch_stream();
    stream.begin_read(10).expect("calibrate");
    stream.end_read(10, 10);

    // At 1 KB/s this read would wait about three seconds
    let start = Instant::now();
    let reader = thread::spawn(move || {
        let result = stream.begin_read(3_000);
        (stream, result)
    });
    thread::sleep(Duration::from_millis(100));
    throttler
        .update_throttle_specification(
            GROUP_TYPE,
            "default",
            Arc::new(FixedThrottleSpec::new(ThrottleLimits::unlimited())),
        )
        .expect("lift limit");
    let (stream, result) = reader.join().expect("reader panicked");
    result.expect("read proceeds");
    assert!(start.elapsed() < Duration::from_millis(1_500));
    stream.close();
    fetch.release();
}
