//! Service registration, liveness and cleanup

use crawl_coord::{CoordinationError, CoordinationResult, ServiceCleanup};
use parking_lot::Mutex;

mod common;

#[derive(Default)]
struct RecordingCleanup {
    calls: Mutex<Vec<String>>,
}

impl RecordingCleanup {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl ServiceCleanup for RecordingCleanup {
    fn clean_up_service(&self, service_name: &str) -> CoordinationResult<()> {
        self.calls.lock().push(format!("service:{service_name}"));
        Ok(())
    }

    fn clean_up_all_services(&self) -> CoordinationResult<()> {
        self.calls.lock().push("all".to_string());
        Ok(())
    }

    fn cluster_init(&self) -> CoordinationResult<()> {
        self.calls.lock().push("init".to_string());
        Ok(())
    }
}

#[test]
fn test_register_and_end_activity() {
    let system = common::in_process_system();
    let mut lm = system.session();

    let name = lm
        .register_service_begin_service_activity("AGENT", Some("agent-1"), Some(b"v1"), None)
        .expect("register");
    assert_eq!(name, "agent-1");
    assert!(lm.check_service_active("AGENT", "agent-1").expect("check"));
    assert_eq!(
        lm.retrieve_service_data("AGENT", "agent-1").expect("data"),
        Some(b"v1".to_vec())
    );
    assert_eq!(lm.count_active_services("AGENT").expect("count"), 1);

    lm.end_service_activity("AGENT", "agent-1").expect("end");
    assert!(!lm.check_service_active("AGENT", "agent-1").expect("check"));
    assert_eq!(lm.retrieve_service_data("AGENT", "agent-1").expect("data"), None);
    assert_eq!(
        lm.list_registered_services("AGENT").expect("list"),
        vec!["agent-1".to_string()]
    );
}

#[test]
fn test_double_activation_is_setup_error() {
    let system = common::in_process_system();
    let mut lm = system.session();
    lm.register_service_begin_service_activity("AGENT", Some("a"), None, None)
        .expect("register");
    let err = lm
        .register_service_begin_service_activity("AGENT", Some("a"), None, None)
        .expect_err("already active");
    assert!(matches!(err, CoordinationError::Setup(_)));
}

#[test]
fn test_anonymous_names_are_unique() {
    let system = common::in_process_system();
    let mut lm = system.session();
    let first = lm
        .register_service_begin_service_activity("POOL", None, None, None)
        .expect("first");
    let second = lm
        .register_service_begin_service_activity("POOL", None, None, None)
        .expect("second");
    assert_ne!(first, second);
    assert!(first.starts_with("_ANON_"));
    assert_eq!(lm.count_active_services("POOL").expect("count"), 2);
}

#[test]
fn test_scan_visits_active_services_only() {
    let system = common::in_process_system();
    let mut lm = system.session();
    for name in ["a", "b", "c"] {
        lm.register_service_begin_service_activity("T", Some(name), Some(name.as_bytes()), None)
            .expect("register");
    }
    lm.end_service_activity("T", "b").expect("end");
    lm.update_service_data("T", "c", Some(b"updated")).expect("update");

    let mut seen = Vec::new();
    lm.scan_service_data("T", |name, data| {
        seen.push((name.to_string(), data.map(<[u8]>::to_vec)));
        Ok(false)
    })
    .expect("scan");
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("a".to_string(), Some(b"a".to_vec())),
            ("c".to_string(), Some(b"updated".to_vec())),
        ]
    );

    let mut visited = 0;
    lm.scan_service_data("T", |_, _| {
        visited += 1;
        Ok(true)
    })
    .expect("scan");
    assert_eq!(visited, 1);
}

#[test]
fn test_first_registration_initialises_cluster() {
    let system = common::in_process_system();
    let mut lm = system.session();
    let cleanup = RecordingCleanup::default();
    lm.register_service_begin_service_activity("AGENT", Some("a"), None, Some(&cleanup))
        .expect("register");
    assert_eq!(cleanup.calls(), vec!["all", "init"]);
}

#[test]
fn test_restart_with_others_active_cleans_only_itself() {
    let system = common::in_process_system();
    let mut lm = system.session();
    lm.register_service_begin_service_activity("AGENT", Some("a"), None, None)
        .expect("a");
    lm.register_service_begin_service_activity("AGENT", Some("b"), None, None)
        .expect("b");
    lm.end_service_activity("AGENT", "a").expect("a stops");

    let cleanup = RecordingCleanup::default();
    lm.register_service_begin_service_activity("AGENT", Some("a"), None, Some(&cleanup))
        .expect("a restarts");
    assert_eq!(cleanup.calls(), vec!["service:a"]);
}

#[test]
fn test_cleanup_inactive_service_unregisters() {
    let system = common::in_process_system();
    let mut lm = system.session();
    for name in ["a", "b", "c"] {
        lm.register_service_begin_service_activity("AGENT", Some(name), None, None)
            .expect("register");
    }
    lm.end_service_activity("AGENT", "a").expect("end a");
    lm.end_service_activity("AGENT", "c").expect("end c");

    let cleanup = RecordingCleanup::default();
    let mut rounds = 0;
    while !lm
        .cleanup_inactive_service("AGENT", &cleanup)
        .expect("cleanup")
    {
        rounds += 1;
    }
    assert_eq!(rounds, 2);
    assert_eq!(
        lm.list_registered_services("AGENT").expect("list"),
        vec!["b".to_string()]
    );
    let mut calls = cleanup.calls();
    calls.sort();
    assert_eq!(calls, vec!["service:a", "service:c"]);
}

#[test]
fn test_crashed_process_services_lapse_with_lease() {
    let dir = common::create_synch_dir();
    let crashed = common::file_system(dir.path());
    let survivor = common::file_system(dir.path());

    let mut lm = crashed.session();
    lm.register_service_begin_service_activity("AGENT", Some("crashed"), None, None)
        .expect("register");
    drop(lm);

    let mut other = survivor.session();
    assert!(other.check_service_active("AGENT", "crashed").expect("check"));

    // No heartbeat renews the crashed holder's lease
    std::thread::sleep(std::time::Duration::from_millis(2_500));
    assert!(!other.check_service_active("AGENT", "crashed").expect("check"));
    assert!(!other
        .cleanup_inactive_service("AGENT", &RecordingCleanup::default())
        .expect("cleanup"));
    assert!(other
        .list_registered_services("AGENT")
        .expect("list")
        .is_empty());
}
