//! Conditional transport-statistics sampler.
//!
//! One background thread, started only when perf metrics are enabled, that
//! periodically asks the backend to dump its counters while the link is
//! actually moving data. Idle ticks are silent.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::backend::TransferBackend;

/// A tick emits stats only if a transfer happened within this window.
pub(crate) const ACTIVITY_WINDOW_MS: i64 = 1000;

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Handle to the running sampler thread.
pub(crate) struct PerfSampler {
    running: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PerfSampler {
    /// Spawn the sampler over a live backend.
    ///
    /// `interval_ms` is read every tick, so the period can be adjusted
    /// while the sampler runs. `last_activity_ms` is the engine's
    /// data-plane activity timestamp.
    pub(crate) fn start<B: TransferBackend>(
        backend: Arc<B>,
        interval_ms: Arc<AtomicU64>,
        last_activity_ms: Arc<AtomicI64>,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name("astate-perf".into())
            .spawn(move || {
                tracing::info!("perf sampler started");
                while thread_running.load(Ordering::Acquire) {
                    let period = interval_ms.load(Ordering::Relaxed).max(1);
                    std::thread::sleep(Duration::from_millis(period));
                    if !thread_running.load(Ordering::Acquire) {
                        break;
                    }
                    let idle = wall_clock_ms() - last_activity_ms.load(Ordering::Relaxed);
                    if idle < ACTIVITY_WINDOW_MS {
                        backend.print_perf();
                    }
                }
                tracing::info!("perf sampler exiting");
            })
            .expect("failed to spawn perf sampler thread");
        Self {
            running,
            handle: Some(handle),
        }
    }

    /// Signal the loop and join the thread.
    pub(crate) fn stop(mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendConfig, TransferOp};
    use crate::error::Result;
    use crate::types::{TransferConf, TransferRequest, TransferStatus};

    struct CountingBackend {
        dumps: AtomicU64,
    }

    struct NoopOp;

    impl TransferOp for NoopOp {
        fn status(&self) -> TransferStatus {
            TransferStatus::Success
        }
    }

    impl TransferBackend for CountingBackend {
        type Op = NoopOp;

        fn setup(_config: BackendConfig) -> Result<Self> {
            Ok(Self {
                dumps: AtomicU64::new(0),
            })
        }
        fn instance_id(&self) -> u64 {
            1
        }
        fn config_mut(&mut self) -> &mut BackendConfig {
            unreachable!("not used in sampler tests")
        }
        fn setup_rpc_server(&mut self) -> Result<()> {
            Ok(())
        }
        fn query_instance_id(&self, _host: &str, _port: u16) -> Result<u64> {
            Ok(1)
        }
        fn register_ram(&self, _addr: usize, _len: usize, _numa: i32) -> Result<()> {
            Ok(())
        }
        fn register_vram(&self, _addr: usize, _len: usize, _gpu: i32) -> Result<()> {
            Ok(())
        }
        fn deregister(&self, _addr: usize, _len: usize) -> bool {
            false
        }
        fn exec_transfer(&self, _req: &TransferRequest, _conf: &TransferConf) -> Result<Self::Op> {
            Ok(NoopOp)
        }
        fn print_perf(&self) {
            self.dumps.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_sampler_dumps_while_active() {
        let backend = Arc::new(CountingBackend::setup(BackendConfig::default()).unwrap());
        let interval = Arc::new(AtomicU64::new(10));
        let last = Arc::new(AtomicI64::new(wall_clock_ms()));
        let sampler = PerfSampler::start(Arc::clone(&backend), interval, Arc::clone(&last));

        // Keep the link "active" for a few ticks.
        for _ in 0..5 {
            last.store(wall_clock_ms(), Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(15));
        }
        sampler.stop();
        assert!(backend.dumps.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_sampler_silent_when_idle() {
        let backend = Arc::new(CountingBackend::setup(BackendConfig::default()).unwrap());
        let interval = Arc::new(AtomicU64::new(10));
        // Last activity far in the past.
        let last = Arc::new(AtomicI64::new(wall_clock_ms() - 10_000));
        let sampler = PerfSampler::start(Arc::clone(&backend), interval, last);
        std::thread::sleep(Duration::from_millis(60));
        sampler.stop();
        assert_eq!(backend.dumps.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_stop_joins_promptly() {
        let backend = Arc::new(CountingBackend::setup(BackendConfig::default()).unwrap());
        let interval = Arc::new(AtomicU64::new(20));
        let last = Arc::new(AtomicI64::new(0));
        let sampler = PerfSampler::start(backend, interval, last);
        let start = std::time::Instant::now();
        sampler.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
