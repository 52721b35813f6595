//! Health monitor: periodically probes a set of supervisors and drives
//! automatic restart under a bounded-failure policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::supervisor::Supervisor;

/// Per-model liveness record, mutated only by the monitor thread.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub response_time_ms: u64,
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus {
            healthy: false,
            consecutive_failures: 0,
            last_error: None,
            response_time_ms: 0,
        }
    }
}

type FailureCallback = dyn Fn(&str, &HealthStatus) + Send + Sync;
type RestartCallback = dyn Fn(&str) + Send + Sync;

/// Configuration and runtime state for periodic liveness probing.
pub struct Monitor {
    targets: Vec<Arc<Supervisor>>,
    interval: Duration,
    max_failures: u32,
    auto_restart: bool,
    start_timeout: Duration,
    stop_timeout: Duration,
    status: Arc<Mutex<HashMap<String, HealthStatus>>>,
    stop_flag: Arc<AtomicBool>,
    wake: Arc<Condvar>,
    wake_lock: Arc<Mutex<()>>,
    on_failure: Option<Arc<FailureCallback>>,
    on_restart: Option<Arc<RestartCallback>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(targets: Vec<Arc<Supervisor>>) -> Self {
        Monitor {
            targets,
            interval: Duration::from_secs(30),
            max_failures: 3,
            auto_restart: true,
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(5),
            status: Arc::new(Mutex::new(HashMap::new())),
            stop_flag: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Condvar::new()),
            wake_lock: Arc::new(Mutex::new(())),
            on_failure: None,
            on_restart: None,
            thread: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn with_auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = auto_restart;
        self
    }

    /// Timeout passed to `Supervisor::restart`'s start half when an
    /// automatic restart is triggered.
    pub fn with_start_timeout(mut self, start_timeout: Duration) -> Self {
        self.start_timeout = start_timeout;
        self
    }

    /// Timeout passed to `Supervisor::restart`'s stop half when an
    /// automatic restart is triggered.
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn on_failure(mut self, f: impl Fn(&str, &HealthStatus) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Arc::new(f));
        self
    }

    pub fn on_restart(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_restart = Some(Arc::new(f));
        self
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().unwrap().is_some()
    }

    pub fn get_status(&self, name: &str) -> Option<HealthStatus> {
        self.status.lock().unwrap().get(name).cloned()
    }

    pub fn all_status(&self) -> HashMap<String, HealthStatus> {
        self.status.lock().unwrap().clone()
    }

    fn check_one(supervisor: &Supervisor) -> (bool, Duration) {
        let start = Instant::now();
        let healthy = supervisor.ping();
        (healthy, start.elapsed())
    }

    fn check_all(
        targets: &[Arc<Supervisor>],
        status: &Mutex<HashMap<String, HealthStatus>>,
        max_failures: u32,
        auto_restart: bool,
        start_timeout: Duration,
        stop_timeout: Duration,
        on_failure: &Option<Arc<FailureCallback>>,
        on_restart: &Option<Arc<RestartCallback>>,
    ) {
        for supervisor in targets {
            let name = supervisor.name().to_string();
            let (healthy, elapsed) = Self::check_one(supervisor);

            let mut crossed_threshold = false;
            {
                let mut guard = status.lock().unwrap();
                let entry = guard.entry(name.clone()).or_default();
                entry.response_time_ms = elapsed.as_millis() as u64;
                if healthy {
                    entry.consecutive_failures = 0;
                    entry.healthy = true;
                    entry.last_error = None;
                } else {
                    entry.consecutive_failures += 1;
                    entry.healthy = false;
                    entry.last_error = Some("ping failed or timed out".to_string());
                    crossed_threshold = entry.consecutive_failures >= max_failures;
                }
            }

            if !healthy {
                if let Some(cb) = on_failure {
                    let snapshot = status.lock().unwrap().get(&name).cloned().unwrap_or_default();
                    cb(&name, &snapshot);
                }
                if crossed_threshold && auto_restart {
                    match supervisor.restart(start_timeout, stop_timeout) {
                        Ok(()) => {
                            let mut guard = status.lock().unwrap();
                            if let Some(entry) = guard.get_mut(&name) {
                                entry.consecutive_failures = 0;
                                entry.healthy = true;
                            }
                            if let Some(cb) = on_restart {
                                cb(&name);
                            }
                        }
                        Err(e) => {
                            tracing::error!(model = %name, error = %e, "automatic restart failed");
                        }
                    }
                }
            }
        }
    }

    /// Spawn the background probing thread.
    pub fn start(&self) {
        if self.is_running() {
            return;
        }
        self.stop_flag.store(false, Ordering::SeqCst);

        let targets = self.targets.clone();
        let status = Arc::clone(&self.status);
        let stop_flag = Arc::clone(&self.stop_flag);
        let wake = Arc::clone(&self.wake);
        let wake_lock = Arc::clone(&self.wake_lock);
        let interval = self.interval;
        let max_failures = self.max_failures;
        let auto_restart = self.auto_restart;
        let start_timeout = self.start_timeout;
        let stop_timeout = self.stop_timeout;
        let on_failure = self.on_failure.clone();
        let on_restart = self.on_restart.clone();

        let handle = std::thread::Builder::new()
            .name("modelsup-health".to_string())
            .spawn(move || {
                loop {
                    Self::check_all(
                        &targets,
                        &status,
                        max_failures,
                        auto_restart,
                        start_timeout,
                        stop_timeout,
                        &on_failure,
                        &on_restart,
                    );
                    let guard = wake_lock.lock().unwrap();
                    let (_guard, _timeout_result) =
                        wake.wait_timeout(guard, interval).unwrap();
                    if stop_flag.load(Ordering::SeqCst) {
                        break;
                    }
                }
            })
            .expect("spawn health monitor thread");

        *self.thread.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self, _timeout: Duration) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.wake.notify_all();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop(Duration::from_secs(5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_defaults_to_unhealthy() {
        let status = HealthStatus::default();
        assert!(!status.healthy);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[test]
    fn monitor_starts_and_stops_cleanly_with_no_targets() {
        let monitor = Monitor::new(Vec::new()).with_interval(Duration::from_millis(20));
        monitor.start();
        assert!(monitor.is_running());
        monitor.stop(Duration::from_secs(1));
        assert!(!monitor.is_running());
    }
}
