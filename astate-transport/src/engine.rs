//! The transport engine: lifecycle, control-plane bring-up, memory
//! registration, and the blocking one-sided data plane.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{BackendConfig, TransferBackend, TransferOp};
use crate::error::{Result, TransportError};
use crate::options::{Options, ParallelConfig};
use crate::perf::{wall_clock_ms, PerfSampler};
use crate::retry::{retry, CountingAndSleepRetry, CountingRetry};
use crate::topology::{
    active_cuda_device, cpu_affinity_string, numa_node_of_ib_device, pin_to_numa_node, GpuTopology,
};
use crate::types::{
    ExtendInfo, MemoryKind, OpCode, RemoteAddress, TransferConf, TransferRequest, TransferStatus,
};

/// First port of the scan-mode window.
pub const RDMA_PORT_START: u16 = 51010;
/// Ports tried per scan-mode bring-up before giving up.
pub const BIND_PORT_MAX_RETRY: u32 = 10;
/// Width of the random offset added to [`RDMA_PORT_START`] in scan mode.
const PORT_SCAN_WINDOW: u16 = 1000;

/// Completion-polling concurrency hint passed with every transfer.
const TRANSFER_NUM_POLLERS: usize = 4;
/// Transfer segmentation unit.
const TRANSFER_CHUNK_BYTES: usize = 1024 * 1024;

/// Pause after a successful start so the freshly bound listener is
/// reachable before peers resolve this instance.
const STARTUP_GRACE: Duration = Duration::from_millis(1000);

/// Completion callback for the async variants (not implemented in this
/// core; async semantics are layered above one-sided transfers).
pub type TransferCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// One-sided tensor transport over a pluggable verbs-level backend.
///
/// The backend is fixed at assembly time through the type parameter;
/// swapping verbs libraries touches no engine code.
pub struct TransportEngine<B: TransferBackend> {
    options: Options,
    backend: Option<Arc<B>>,
    perf: Option<PerfSampler>,
    is_running: AtomicBool,

    local_server_name: String,
    local_server_port: u16,

    /// NUMA node of the primary selected NIC; -1 when unknown.
    rdma_numa_node: i32,
    /// Selected NICs with their NUMA nodes, primary first.
    nic_nodes: Vec<(String, i32)>,

    registrations: Mutex<HashMap<(usize, usize), MemoryKind>>,

    last_activity_ms: Arc<AtomicI64>,
    perf_interval_ms: Arc<AtomicU64>,
}

impl<B: TransferBackend> TransportEngine<B> {
    pub fn new() -> Self {
        Self {
            options: Options::default(),
            backend: None,
            perf: None,
            is_running: AtomicBool::new(false),
            local_server_name: String::new(),
            local_server_port: 0,
            rdma_numa_node: -1,
            nic_nodes: Vec::new(),
            registrations: Mutex::new(HashMap::new()),
            last_activity_ms: Arc::new(AtomicI64::new(0)),
            perf_interval_ms: Arc::new(AtomicU64::new(500)),
        }
    }

    /// Bring the engine up: select devices, create the backend context,
    /// bind the control-plane listener, and start the perf sampler.
    ///
    /// Returns false on any setup failure; the engine is then inert and
    /// `stop` is a no-op.
    pub fn start(&mut self, options: Options, parallel: ParallelConfig) -> bool {
        if self.is_running.load(Ordering::Acquire) {
            tracing::warn!("start called on a running engine");
            return false;
        }

        self.local_server_name = gethostname::gethostname().to_string_lossy().into_owned();
        self.perf_interval_ms
            .store(options.perf_stats_interval_ms, Ordering::Relaxed);
        self.options = options;

        let device_pattern = self.select_rdma_devices(parallel.role_rank);

        let config = BackendConfig {
            num_pollers: self.options.num_pollers,
            device_pattern,
            ..BackendConfig::default()
        };
        tracing::info!(
            num_pollers = config.num_pollers,
            devices = config.device_pattern.as_deref().unwrap_or("<backend default>"),
            "setting up transfer backend"
        );

        let mut backend = match B::setup(config) {
            Ok(backend) => backend,
            Err(e) => {
                tracing::error!(error = %e, "backend setup failed");
                return false;
            }
        };
        tracing::info!(instance_id = backend.instance_id(), "backend context ready");

        if !self.setup_rpc_server(&mut backend) {
            return false;
        }

        let backend = Arc::new(backend);
        if self.options.enable_perf_metrics {
            self.perf = Some(PerfSampler::start(
                Arc::clone(&backend),
                Arc::clone(&self.perf_interval_ms),
                Arc::clone(&self.last_activity_ms),
            ));
            tracing::info!(
                interval_ms = self.perf_interval_ms.load(Ordering::Relaxed),
                "perf metrics enabled"
            );
        }

        self.backend = Some(backend);
        self.is_running.store(true, Ordering::Release);
        tracing::info!(
            server = %self.local_server_name,
            port = self.local_server_port,
            "transport engine started"
        );

        // The listener needs a beat before peers can resolve us.
        std::thread::sleep(STARTUP_GRACE);
        true
    }

    /// Tear the engine down. Idempotent; joins the perf sampler before the
    /// backend context is released.
    pub fn stop(&mut self) {
        if !self.is_running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(sampler) = self.perf.take() {
            sampler.stop();
            tracing::info!("perf sampler stopped");
        }
        self.backend.take();
        self.registrations
            .lock()
            .expect("registration table poisoned")
            .clear();
        tracing::info!("transport engine stopped");
    }

    /// One-sided WRITE of `length` bytes at `local_addr` into the peer's
    /// memory at the remote address carried by `extend`.
    pub fn send(
        &self,
        local_addr: usize,
        length: usize,
        remote_host: &str,
        remote_port: u16,
        extend: &ExtendInfo,
    ) -> bool {
        self.transfer(
            "send",
            OpCode::Write,
            local_addr,
            length,
            remote_host,
            remote_port,
            extend,
            self.options.send_retry_count,
            self.options.send_retry_sleep_ms,
            self.options.write_timeout_ms,
        )
    }

    /// One-sided READ of `length` bytes from the peer's memory at the
    /// remote address carried by `extend` into `local_addr`.
    pub fn receive(
        &self,
        local_addr: usize,
        length: usize,
        remote_host: &str,
        remote_port: u16,
        extend: &ExtendInfo,
    ) -> bool {
        self.transfer(
            "receive",
            OpCode::Read,
            local_addr,
            length,
            remote_host,
            remote_port,
            extend,
            self.options.receive_retry_count,
            self.options.receive_retry_sleep_ms,
            self.options.read_timeout_ms,
        )
    }

    /// Async variants are intentionally unimplemented: asynchrony is
    /// layered above one-sided transfers by the caller, not below them.
    pub fn async_send(
        &self,
        _local_addr: usize,
        _length: usize,
        _remote_host: &str,
        _remote_port: u16,
        _extend: &ExtendInfo,
        _callback: TransferCallback,
    ) -> Result<()> {
        Err(TransportError::NotImplemented("async_send"))
    }

    pub fn async_receive(
        &self,
        _local_addr: usize,
        _length: usize,
        _remote_host: &str,
        _remote_port: u16,
        _extend: &ExtendInfo,
        _callback: TransferCallback,
    ) -> Result<()> {
        Err(TransportError::NotImplemented("async_receive"))
    }

    /// Register a buffer with the selected devices.
    ///
    /// RAM registrations use the primary NIC's NUMA node; the caller's
    /// placement hint only matters for VRAM (GPU id).
    pub fn register_memory(
        &self,
        addr: usize,
        len: usize,
        is_vram: bool,
        gpu_or_numa: i32,
    ) -> bool {
        let Some(backend) = self.live_backend() else {
            tracing::error!("register_memory: context not initialized");
            return false;
        };
        let result = if is_vram {
            backend.register_vram(addr, len, gpu_or_numa)
        } else {
            backend.register_ram(addr, len, self.rdma_numa_node)
        };
        match result {
            Ok(()) => {
                let kind = if is_vram {
                    MemoryKind::Vram
                } else {
                    MemoryKind::Ram
                };
                self.registrations
                    .lock()
                    .expect("registration table poisoned")
                    .insert((addr, len), kind);
                true
            }
            Err(e) => {
                tracing::error!(
                    addr = %format_args!("{addr:#x}"),
                    len,
                    is_vram,
                    error = %e,
                    "memory registration failed"
                );
                false
            }
        }
    }

    /// Drop a registration. Returns false for unknown regions; never
    /// disturbs other registrations.
    pub fn deregister_memory(&self, addr: usize, len: usize) -> bool {
        let Some(backend) = self.live_backend() else {
            tracing::error!("deregister_memory: context not initialized");
            return false;
        };
        let ok = backend.deregister(addr, len);
        if ok {
            self.registrations
                .lock()
                .expect("registration table poisoned")
                .remove(&(addr, len));
        }
        tracing::info!(
            addr = %format_args!("{addr:#x}"),
            len,
            ok,
            "deregistered memory"
        );
        ok
    }

    /// Port the control-plane listener bound to. Meaningful only after a
    /// successful `start`.
    pub fn bind_port(&self) -> u16 {
        self.local_server_port
    }

    pub fn write_timeout_ms(&self) -> i64 {
        self.options.write_timeout_ms
    }

    pub fn read_timeout_ms(&self) -> i64 {
        self.options.read_timeout_ms
    }

    pub fn local_server_name(&self) -> &str {
        &self.local_server_name
    }

    pub fn meta_addr(&self) -> &str {
        &self.options.meta_service_address
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Selected NICs with their NUMA nodes, primary first. Empty when the
    /// backend runs on its default device choice.
    pub fn nic_numa_nodes(&self) -> &[(String, i32)] {
        &self.nic_nodes
    }

    /// Adjust the perf sampler period while running.
    pub fn set_perf_stats_interval_ms(&self, interval_ms: u64) {
        self.perf_interval_ms.store(interval_ms, Ordering::Relaxed);
    }

    fn live_backend(&self) -> Option<&Arc<B>> {
        self.backend.as_ref().filter(|_| self.is_running())
    }

    /// Choose this process's NICs and remember their NUMA placement.
    ///
    /// Returns the comma-separated device pattern for the backend, or
    /// `None` when nothing was selected (the backend then uses its own
    /// default; this is a warning, never fatal).
    fn select_rdma_devices(&mut self, role_rank: u32) -> Option<String> {
        let max = self.options.max_rdma_devices;
        let topology = match GpuTopology::probe_system() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "topology probe failed, using rank-based fallback");
                GpuTopology::default()
            }
        };

        let names = match active_cuda_device() {
            Some(gpu) => {
                tracing::info!(gpu, "selecting RDMA devices by GPU topology");
                topology.select_devices(gpu, max)
            }
            None => {
                tracing::info!(role_rank, "no active GPU, selecting RDMA devices by rank");
                topology.select_devices_by_rank(role_rank, max)
            }
        };

        if names.is_empty() {
            tracing::warn!("no RDMA devices selected, backend keeps its default configuration");
            self.rdma_numa_node = -1;
            self.nic_nodes.clear();
            return None;
        }

        self.nic_nodes = names
            .iter()
            .map(|name| (name.clone(), numa_node_of_ib_device(name)))
            .collect();
        self.rdma_numa_node = self.nic_nodes[0].1;
        tracing::info!(
            devices = %names.join(","),
            numa_node = self.rdma_numa_node,
            "selected RDMA devices"
        );

        if self.options.enable_numa_allocation {
            tracing::info!(cpu_mask = %cpu_affinity_string(), "affinity before NUMA pinning");
            match pin_to_numa_node(self.rdma_numa_node) {
                Ok(()) => {
                    tracing::info!(cpu_mask = %cpu_affinity_string(), "affinity after NUMA pinning");
                }
                Err(e) => {
                    tracing::warn!(
                        node = self.rdma_numa_node,
                        error = %e,
                        "NUMA pinning failed, continuing unpinned"
                    );
                }
            }
        }

        Some(names.join(","))
    }

    /// Bind the control-plane listener, either on the fixed configured
    /// port or by scanning a randomized window.
    fn setup_rpc_server(&mut self, backend: &mut B) -> bool {
        if self.options.fixed_port {
            let port = self.options.local_port;
            backend.config_mut().rpc_listen_port = port;
            if let Err(e) = backend.setup_rpc_server() {
                tracing::error!(port, error = %e, "control-plane listener bring-up failed");
                return false;
            }
            self.local_server_port = port;
        } else if !self.setup_rpc_server_with_retry(backend) {
            tracing::error!("control-plane listener bring-up failed after port scan");
            return false;
        }
        tracing::info!(port = self.local_server_port, "control-plane listener up");
        true
    }

    fn setup_rpc_server_with_retry(&mut self, backend: &mut B) -> bool {
        use rand::Rng;
        let offset: u16 = rand::thread_rng().gen_range(0..=PORT_SCAN_WINDOW);
        let base_port = RDMA_PORT_START + offset;
        tracing::info!(base_port, offset, "scanning for a free control-plane port");

        let mut attempt = 0u32;
        let result = retry(
            "rpc server setup",
            &CountingRetry::new(BIND_PORT_MAX_RETRY),
            || {
                let port = base_port + attempt as u16;
                attempt += 1;
                backend.config_mut().rpc_listen_port = port;
                tracing::info!(
                    attempt,
                    max_attempts = BIND_PORT_MAX_RETRY,
                    port,
                    "binding control-plane listener"
                );
                backend.setup_rpc_server().map(|()| port)
            },
        );

        match result {
            Ok(port) => {
                self.local_server_port = port;
                true
            }
            Err(e) => {
                tracing::error!(
                    base_port,
                    attempts = attempt,
                    error = %e,
                    "exhausted control-plane port window"
                );
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn transfer(
        &self,
        what: &str,
        opcode: OpCode,
        local_addr: usize,
        length: usize,
        remote_host: &str,
        remote_port: u16,
        extend: &ExtendInfo,
        retry_count: u32,
        retry_sleep_ms: u64,
        timeout_ms: i64,
    ) -> bool {
        let remote = RemoteAddress::new(remote_host, remote_port);

        // Argument checks, in contract order; violations never reach the
        // backend and are never retried.
        let Some(backend) = self.live_backend() else {
            tracing::error!(op = what, remote = %remote, "context not initialized");
            return false;
        };
        if local_addr == 0 || length == 0 {
            tracing::error!(op = what, remote = %remote, "local buffer is null or empty");
            return false;
        }
        let Some(remote_addr) = extend.remote_addr() else {
            tracing::error!(op = what, remote = %remote, "extend info carries no remote address");
            return false;
        };

        self.last_activity_ms
            .store(wall_clock_ms(), Ordering::Relaxed);

        let conf = TransferConf {
            num_pollers: TRANSFER_NUM_POLLERS,
            chunk_bytes: TRANSFER_CHUNK_BYTES,
            timeout_ms,
        };
        let policy = CountingAndSleepRetry::new(retry_count, retry_sleep_ms);
        let result = retry(what, &policy, || {
            let remote_instance = backend.query_instance_id(&remote.host, remote.port)?;
            let request = TransferRequest {
                opcode,
                local_addr,
                length,
                remote_addr,
                remote_instance,
                remote: remote.clone(),
            };
            let op = backend.exec_transfer(&request, &conf)?;
            match op.status() {
                TransferStatus::Success => Ok(()),
                TransferStatus::Failure(code) => Err(TransportError::transfer(
                    &remote,
                    format!(
                        "completed with status {code} (laddr={local_addr:#x} raddr={remote_addr:#x} len={length})"
                    ),
                )),
            }
        });

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(op = what, remote = %remote, error = %e, "transfer failed");
                false
            }
        }
    }
}

impl<B: TransferBackend> Default for TransportEngine<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: TransferBackend> Drop for TransportEngine<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
