//! Background upkeep for a coordinating process
//!
//! Renews the backend leases that keep this process's locks and active
//! services alive, and re-apportions throttle limits with the peers.

use crossbeam_channel::{Sender, bounded, select, tick};
use log::{debug, error, trace, warn};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::lock_manager::LockSystem;
use crate::throttler::Throttler;

/// Runs lease renewal and throttle polling on a dedicated thread
///
/// Stops when [`shutdown`](Self::shutdown) is called or the housekeeper is
/// dropped.
#[derive(Debug)]
pub struct Housekeeper {
    shutdown: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Housekeeper {
    /// Start the housekeeping thread
    ///
    /// Intervals come from the lock system's configuration. Without a
    /// throttler only leases are renewed.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(system: &Arc<LockSystem>, throttler: Option<Arc<Throttler>>) -> std::io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let heartbeat = tick(system.config().heartbeat_interval());
        let poll = tick(system.config().throttle_poll_interval());
        let system = Arc::clone(system);

        let worker = std::thread::Builder::new()
            .name("coord-housekeeper".to_string())
            .spawn(move || {
                debug!("Housekeeper started");
                loop {
                    select! {
                        recv(heartbeat) -> _ => match system.renew_leases() {
                            Ok(renewed) => trace!("Renewed {renewed} leases"),
                            Err(e) => warn!("Lease renewal failed: {e}"),
                        },
                        recv(poll) -> _ => {
                            if let Some(throttler) = &throttler {
                                if let Err(e) = throttler.poll_all() {
                                    warn!("Throttle poll failed: {e}");
                                }
                            }
                        },
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                debug!("Housekeeper stopped");
            })?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            worker: Some(worker),
        })
    }

    /// Stop the thread and wait for it to finish
    pub fn shutdown(&mut self) {
        // Dropping the sender disconnects the channel, which wakes the select
        self.shutdown.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            error!("Housekeeper thread panicked");
        }
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinationConfig;
    use std::time::{Duration, Instant};

    #[test]
    fn test_shutdown_is_prompt() {
        let config = CoordinationConfig::builder()
            .in_process()
            .heartbeat_interval_ms(30_000)
            .lease_duration_ms(60_000)
            .build()
            .expect("valid config");
        let system = LockSystem::open(&config).expect("in-process backend");
        let mut housekeeper = Housekeeper::start(&system, None).expect("spawn");
        let start = Instant::now();
        housekeeper.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
