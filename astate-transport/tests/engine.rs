//! Engine lifecycle and data-plane tests against a scripted backend.
//!
//! The mock implements `TransferBackend` with per-test scripts selected
//! through a marker type, so each test gets an isolated recording of every
//! bind attempt, instance query, and transfer submission.

use std::collections::{HashSet, VecDeque};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use astate_transport::{
    BackendConfig, ExtendInfo, Options, ParallelConfig, Result, TransferBackend, TransferConf,
    TransferOp, TransferRequest, TransferStatus, TransportEngine, TransportError,
    BIND_PORT_MAX_RETRY, RDMA_PORT_START,
};

#[derive(Debug, Clone, Copy)]
enum ExecOutcome {
    Succeed,
    /// `exec_transfer` fails outright (the "null op handle" case).
    NullHandle,
    /// The op completes with a non-success status.
    Status(i32),
    /// A non-retryable failure out of the backend.
    NonRetryable,
}

#[derive(Default)]
struct Script {
    /// Fail this many leading `setup_rpc_server` calls.
    bind_fail_first: AtomicU32,
    /// Fail every `setup_rpc_server` call.
    bind_fail_all: std::sync::atomic::AtomicBool,
    /// Outcome per `exec_transfer` call; empty queue means success.
    exec_outcomes: Mutex<VecDeque<ExecOutcome>>,
    /// Fail this many leading `query_instance_id` calls.
    query_fail_first: AtomicU32,

    bind_attempts: Mutex<Vec<u16>>,
    query_count: AtomicU32,
    exec_count: AtomicU32,
    exec_times: Mutex<Vec<Instant>>,
    last_conf: Mutex<Option<TransferConf>>,
    last_request: Mutex<Option<TransferRequest>>,
    perf_dumps: AtomicU32,
    drops: AtomicU32,
    registered: Mutex<HashSet<(usize, usize)>>,
}

impl Script {
    fn exec_count(&self) -> u32 {
        self.exec_count.load(Ordering::SeqCst)
    }

    fn push_outcomes(&self, outcomes: &[ExecOutcome]) {
        self.exec_outcomes.lock().unwrap().extend(outcomes.iter().copied());
    }
}

trait ScriptSource: Send + Sync + 'static {
    fn script() -> &'static Script;
}

macro_rules! mock_script {
    ($name:ident) => {
        struct $name;
        impl ScriptSource for $name {
            fn script() -> &'static Script {
                static SCRIPT: OnceLock<Script> = OnceLock::new();
                SCRIPT.get_or_init(Script::default)
            }
        }
    };
}

struct MockOp {
    status: TransferStatus,
}

impl TransferOp for MockOp {
    fn status(&self) -> TransferStatus {
        self.status
    }
}

struct MockBackend<S: ScriptSource> {
    config: BackendConfig,
    _marker: PhantomData<S>,
}

impl<S: ScriptSource> TransferBackend for MockBackend<S> {
    type Op = MockOp;

    fn setup(config: BackendConfig) -> Result<Self> {
        Ok(Self {
            config,
            _marker: PhantomData,
        })
    }

    fn instance_id(&self) -> u64 {
        42
    }

    fn config_mut(&mut self) -> &mut BackendConfig {
        &mut self.config
    }

    fn setup_rpc_server(&mut self) -> Result<()> {
        let script = S::script();
        let port = self.config.rpc_listen_port;
        script.bind_attempts.lock().unwrap().push(port);
        let fail = script.bind_fail_all.load(Ordering::SeqCst)
            || script
                .bind_fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if fail {
            return Err(TransportError::Bind {
                port,
                reason: "scripted bind failure".into(),
            });
        }
        Ok(())
    }

    fn query_instance_id(&self, host: &str, port: u16) -> Result<u64> {
        let script = S::script();
        script.query_count.fetch_add(1, Ordering::SeqCst);
        let fail = script
            .query_fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(TransportError::instance_query(
                &astate_transport::RemoteAddress::new(host, port),
                "scripted query failure",
            ));
        }
        Ok(42)
    }

    fn register_ram(&self, addr: usize, len: usize, _numa: i32) -> Result<()> {
        S::script().registered.lock().unwrap().insert((addr, len));
        Ok(())
    }

    fn register_vram(&self, addr: usize, len: usize, _gpu: i32) -> Result<()> {
        S::script().registered.lock().unwrap().insert((addr, len));
        Ok(())
    }

    fn deregister(&self, addr: usize, len: usize) -> bool {
        S::script().registered.lock().unwrap().remove(&(addr, len))
    }

    fn exec_transfer(&self, req: &TransferRequest, conf: &TransferConf) -> Result<Self::Op> {
        let script = S::script();
        script.exec_count.fetch_add(1, Ordering::SeqCst);
        script.exec_times.lock().unwrap().push(Instant::now());
        *script.last_conf.lock().unwrap() = Some(*conf);
        *script.last_request.lock().unwrap() = Some(req.clone());

        let outcome = script
            .exec_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ExecOutcome::Succeed);
        match outcome {
            ExecOutcome::Succeed => Ok(MockOp {
                status: TransferStatus::Success,
            }),
            ExecOutcome::Status(code) => Ok(MockOp {
                status: TransferStatus::Failure(code),
            }),
            ExecOutcome::NullHandle => Err(TransportError::transfer(
                &req.remote,
                "scripted null op handle",
            )),
            ExecOutcome::NonRetryable => Err(TransportError::invalid_argument(
                "scripted non-retryable failure",
            )),
        }
    }

    fn print_perf(&self) {
        S::script().perf_dumps.fetch_add(1, Ordering::SeqCst);
    }
}

impl<S: ScriptSource> Drop for MockBackend<S> {
    fn drop(&mut self) {
        S::script().drops.fetch_add(1, Ordering::SeqCst);
    }
}

fn fixed_port_options(port: u16) -> Options {
    Options {
        local_port: port,
        fixed_port: true,
        ..Options::default()
    }
}

fn buffer(len: usize) -> Vec<u8> {
    vec![0u8; len]
}

// S1: fixed-port bring-up.
mock_script!(S1);
#[test]
fn test_fixed_port_bringup() {
    let mut engine = TransportEngine::<MockBackend<S1>>::new();
    assert!(engine.start(fixed_port_options(19001), ParallelConfig::new(0, 1)));
    assert!(engine.is_running());
    assert_eq!(engine.bind_port(), 19001);
    assert_eq!(S1::script().bind_attempts.lock().unwrap().as_slice(), &[19001]);
    engine.stop();
}

// S2: scan bring-up with the first port taken.
mock_script!(S2);
#[test]
fn test_scan_bringup_first_port_taken() {
    S2::script().bind_fail_first.store(1, Ordering::SeqCst);
    let mut engine = TransportEngine::<MockBackend<S2>>::new();
    assert!(engine.start(Options::default(), ParallelConfig::new(0, 1)));

    let attempts = S2::script().bind_attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1], attempts[0] + 1);
    assert_eq!(engine.bind_port(), attempts[1]);
    engine.stop();
}

// S3: scan exhaustion.
mock_script!(S3);
#[test]
fn test_scan_exhaustion_fails_start() {
    S3::script().bind_fail_all.store(true, Ordering::SeqCst);
    let mut engine = TransportEngine::<MockBackend<S3>>::new();
    assert!(!engine.start(Options::default(), ParallelConfig::new(0, 1)));
    assert!(!engine.is_running());
    assert_eq!(
        S3::script().bind_attempts.lock().unwrap().len(),
        BIND_PORT_MAX_RETRY as usize
    );
    // The failed start dropped the backend; no perf thread ever ran.
    assert_eq!(S3::script().perf_dumps.load(Ordering::SeqCst), 0);
    assert_eq!(S3::script().drops.load(Ordering::SeqCst), 1);
    // Stop after a failed start is a no-op.
    engine.stop();
    assert_eq!(S3::script().drops.load(Ordering::SeqCst), 1);
}

// Invariant 1: scan-mode bind port lies inside the advertised window.
mock_script!(ScanWindow);
#[test]
fn test_scan_port_within_window() {
    let mut engine = TransportEngine::<MockBackend<ScanWindow>>::new();
    assert!(engine.start(Options::default(), ParallelConfig::new(0, 1)));
    let port = engine.bind_port() as u32;
    assert!(port >= RDMA_PORT_START as u32);
    assert!(port < RDMA_PORT_START as u32 + 1000 + BIND_PORT_MAX_RETRY);
    engine.stop();
}

// S4: send happy path.
mock_script!(S4);
#[test]
fn test_send_happy_path() {
    let mut engine = TransportEngine::<MockBackend<S4>>::new();
    assert!(engine.start(fixed_port_options(19004), ParallelConfig::new(0, 1)));

    let buf = buffer(4 << 20);
    let addr = buf.as_ptr() as usize;
    assert!(engine.register_memory(addr, buf.len(), false, -1));

    let extend = ExtendInfo::from_remote_addr(0x7000_0000);
    assert!(engine.send(addr, buf.len(), "peer", 19001, &extend));

    let script = S4::script();
    assert_eq!(script.exec_count(), 1);
    assert_eq!(script.query_count.load(Ordering::SeqCst), 1);
    let req = script.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(req.remote_instance, 42);
    assert_eq!(req.remote_addr, 0x7000_0000);
    assert_eq!(req.length, buf.len());
    engine.stop();
}

// S5: receive retries then succeeds.
mock_script!(S5);
#[test]
fn test_receive_retries_then_succeeds() {
    S5::script().push_outcomes(&[ExecOutcome::NullHandle, ExecOutcome::NullHandle]);
    let mut opts = fixed_port_options(19005);
    opts.receive_retry_count = 3;
    opts.receive_retry_sleep_ms = 10;
    let mut engine = TransportEngine::<MockBackend<S5>>::new();
    assert!(engine.start(opts, ParallelConfig::new(0, 1)));

    let buf = buffer(1024);
    let addr = buf.as_ptr() as usize;
    let extend = ExtendInfo::from_remote_addr(0x9000);

    let started = Instant::now();
    assert!(engine.receive(addr, buf.len(), "peer", 19001, &extend));
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert_eq!(S5::script().exec_count(), 3);

    // Consecutive submissions are separated by the configured sleep.
    let times = S5::script().exec_times.lock().unwrap().clone();
    assert_eq!(times.len(), 3);
    assert!(times[1] - times[0] >= Duration::from_millis(10));
    assert!(times[2] - times[1] >= Duration::from_millis(10));
    engine.stop();
}

// S6: argument errors never reach the backend.
mock_script!(S6);
#[test]
fn test_argument_errors_not_submitted() {
    let mut engine = TransportEngine::<MockBackend<S6>>::new();
    assert!(engine.start(fixed_port_options(19006), ParallelConfig::new(0, 1)));

    let extend = ExtendInfo::from_remote_addr(0x9000);
    // Null local address.
    assert!(!engine.send(0, 64, "peer", 19001, &extend));
    // Zero length is an error, not a no-op success.
    let buf = buffer(64);
    assert!(!engine.send(buf.as_ptr() as usize, 0, "peer", 19001, &extend));
    // Missing remote address.
    assert!(!engine.send(buf.as_ptr() as usize, 64, "peer", 19001, &ExtendInfo::default()));

    let script = S6::script();
    assert_eq!(script.exec_count(), 0);
    assert_eq!(script.query_count.load(Ordering::SeqCst), 0);
    engine.stop();
}

// Invariant 7: a non-retryable backend failure is surfaced after exactly
// one submission.
mock_script!(NonRetry);
#[test]
fn test_non_retryable_failure_not_retried() {
    NonRetry::script().push_outcomes(&[ExecOutcome::NonRetryable]);
    let mut opts = fixed_port_options(19007);
    opts.send_retry_count = 5;
    let mut engine = TransportEngine::<MockBackend<NonRetry>>::new();
    assert!(engine.start(opts, ParallelConfig::new(0, 1)));

    let buf = buffer(64);
    let extend = ExtendInfo::from_remote_addr(0x9000);
    assert!(!engine.send(buf.as_ptr() as usize, buf.len(), "peer", 19001, &extend));
    assert_eq!(NonRetry::script().exec_count(), 1);
    engine.stop();
}

// A completed-with-failure status is retryable and exhausts the budget.
mock_script!(StatusFail);
#[test]
fn test_failure_status_exhausts_retries() {
    StatusFail::script().push_outcomes(&[
        ExecOutcome::Status(7),
        ExecOutcome::Status(7),
        ExecOutcome::Status(7),
    ]);
    let mut opts = fixed_port_options(19008);
    opts.send_retry_count = 3;
    opts.send_retry_sleep_ms = 1;
    let mut engine = TransportEngine::<MockBackend<StatusFail>>::new();
    assert!(engine.start(opts, ParallelConfig::new(0, 1)));

    let buf = buffer(64);
    let extend = ExtendInfo::from_remote_addr(0x9000);
    assert!(!engine.send(buf.as_ptr() as usize, buf.len(), "peer", 19001, &extend));
    assert_eq!(StatusFail::script().exec_count(), 3);
    engine.stop();
}

// Instance-id lookup failures are retried like any transient fault.
mock_script!(QueryFail);
#[test]
fn test_query_failure_retried() {
    QueryFail::script().query_fail_first.store(1, Ordering::SeqCst);
    let mut opts = fixed_port_options(19009);
    opts.send_retry_count = 3;
    opts.send_retry_sleep_ms = 1;
    let mut engine = TransportEngine::<MockBackend<QueryFail>>::new();
    assert!(engine.start(opts, ParallelConfig::new(0, 1)));

    let buf = buffer(64);
    let extend = ExtendInfo::from_remote_addr(0x9000);
    assert!(engine.send(buf.as_ptr() as usize, buf.len(), "peer", 19001, &extend));
    // First attempt died in the query, second attempt submitted.
    assert_eq!(QueryFail::script().query_count.load(Ordering::SeqCst), 2);
    assert_eq!(QueryFail::script().exec_count(), 1);
    engine.stop();
}

// Invariant 2: at most one successful deregistration per registration.
mock_script!(Dereg);
#[test]
fn test_deregister_once_semantics() {
    let mut engine = TransportEngine::<MockBackend<Dereg>>::new();
    assert!(engine.start(fixed_port_options(19010), ParallelConfig::new(0, 1)));

    let buf = buffer(256);
    let addr = buf.as_ptr() as usize;
    assert!(engine.register_memory(addr, buf.len(), false, -1));
    assert!(engine.deregister_memory(addr, buf.len()));
    assert!(!engine.deregister_memory(addr, buf.len()));
    // A region that was never registered deregisters as false.
    assert!(!engine.deregister_memory(addr + 1, buf.len()));
    engine.stop();
}

// Invariant 4: stop joins the sampler and releases the backend exactly once.
mock_script!(StopOnce);
#[test]
fn test_stop_releases_backend_once() {
    let mut opts = fixed_port_options(19011);
    opts.enable_perf_metrics = true;
    opts.perf_stats_interval_ms = 20;
    let mut engine = TransportEngine::<MockBackend<StopOnce>>::new();
    assert!(engine.start(opts, ParallelConfig::new(0, 1)));

    // Generate activity so the sampler has something to report.
    let buf = buffer(64);
    let extend = ExtendInfo::from_remote_addr(0x9000);
    assert!(engine.send(buf.as_ptr() as usize, buf.len(), "peer", 19001, &extend));
    std::thread::sleep(Duration::from_millis(120));

    let script = StopOnce::script();
    assert!(script.perf_dumps.load(Ordering::SeqCst) > 0);

    engine.stop();
    assert_eq!(script.drops.load(Ordering::SeqCst), 1);
    let dumps_after_stop = script.perf_dumps.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(script.perf_dumps.load(Ordering::SeqCst), dumps_after_stop);

    engine.stop();
    assert_eq!(script.drops.load(Ordering::SeqCst), 1);
}

// Invariant 5: perf disabled means no sampler at all.
mock_script!(PerfOff);
#[test]
fn test_perf_disabled_never_samples() {
    let mut opts = fixed_port_options(19012);
    opts.enable_perf_metrics = false;
    opts.perf_stats_interval_ms = 10;
    let mut engine = TransportEngine::<MockBackend<PerfOff>>::new();
    assert!(engine.start(opts, ParallelConfig::new(0, 1)));

    let buf = buffer(64);
    let extend = ExtendInfo::from_remote_addr(0x9000);
    assert!(engine.send(buf.as_ptr() as usize, buf.len(), "peer", 19001, &extend));
    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(PerfOff::script().perf_dumps.load(Ordering::SeqCst), 0);
    engine.stop();
}

// Timeouts flow into the backend conf verbatim, including -1 (infinite).
mock_script!(Timeouts);
#[test]
fn test_timeouts_propagate_verbatim() {
    let mut opts = fixed_port_options(19013);
    opts.write_timeout_ms = -1;
    opts.read_timeout_ms = 2500;
    let mut engine = TransportEngine::<MockBackend<Timeouts>>::new();
    assert!(engine.start(opts, ParallelConfig::new(0, 1)));
    assert_eq!(engine.write_timeout_ms(), -1);
    assert_eq!(engine.read_timeout_ms(), 2500);

    let buf = buffer(64);
    let addr = buf.as_ptr() as usize;
    let extend = ExtendInfo::from_remote_addr(0x9000);

    assert!(engine.send(addr, buf.len(), "peer", 19001, &extend));
    let conf = Timeouts::script().last_conf.lock().unwrap().unwrap();
    assert_eq!(conf.timeout_ms, -1);
    assert_eq!(conf.chunk_bytes, 1024 * 1024);
    assert_eq!(conf.num_pollers, 4);

    assert!(engine.receive(addr, buf.len(), "peer", 19001, &extend));
    let conf = Timeouts::script().last_conf.lock().unwrap().unwrap();
    assert_eq!(conf.timeout_ms, 2500);
    engine.stop();
}
