//! Test utilities shared by the integration tests

use crawl_coord::{CoordinationConfig, LockSystem};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Route `log` output through env_logger; honours `RUST_LOG`
#[allow(dead_code)]
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// In-process configuration with short retry and cancellation slices
#[allow(dead_code)]
pub fn in_process_config() -> CoordinationConfig {
    CoordinationConfig::builder()
        .in_process()
        .lock_retry_interval_ms(2)
        .cancel_check_interval_ms(10)
        .build()
        .expect("valid in-process config")
}

/// A fresh lock system of its own; tests never share coordination state
#[allow(dead_code)]
pub fn in_process_system() -> Arc<LockSystem> {
    init_logging();
    LockSystem::open(&in_process_config()).expect("in-process backend")
}

/// File-backend configuration over `dir`
#[allow(dead_code)]
pub fn file_config(dir: &Path) -> CoordinationConfig {
    CoordinationConfig::builder()
        .synch_directory(dir)
        .lock_retry_interval_ms(2)
        .cancel_check_interval_ms(10)
        .lease_duration_ms(2_000)
        .heartbeat_interval_ms(500)
        .build()
        .expect("valid file config")
}

/// One simulated process sharing the synch directory `dir`
///
/// Each call yields a distinct holder, so two systems over the same
/// directory behave like two processes.
#[allow(dead_code)]
pub fn file_system(dir: &Path) -> Arc<LockSystem> {
    init_logging();
    LockSystem::open(&file_config(dir)).expect("file backend")
}

/// Creates a temporary synch directory
#[allow(dead_code)]
pub fn create_synch_dir() -> TempDir {
    TempDir::new().expect("temp dir")
}
