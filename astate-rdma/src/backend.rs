//! `TransferBackend` implementation over ibverbs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use astate_transport::{
    BackendConfig, MemoryKind, OpCode, RemoteAddress, Result, TransferBackend, TransferConf,
    TransferOp, TransferRequest, TransferStatus, TransportError,
};

use crate::context::DeviceContext;
use crate::control::{self, ControlPlane};
use crate::mr::MrRegistry;
use crate::qp::{ConnectedQp, PreparedQp};

#[derive(Default)]
pub(crate) struct Counters {
    transfers: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    failures: AtomicU64,
}

/// State shared between the data path and the control-plane listener.
///
/// Field order matters for teardown: memory regions deregister and queue
/// pairs destroy before the protection domain and device close.
pub(crate) struct RdmaShared {
    pub(crate) instance_id: u64,
    pub(crate) num_pollers: usize,
    pub(crate) registry: MrRegistry,
    pub(crate) server_qps: Mutex<Vec<ConnectedQp>>,
    pub(crate) counters: Counters,
    pub(crate) device: DeviceContext,
}

/// One established peer link; posting is serialized per queue pair.
type PeerLink = Arc<Mutex<ConnectedQp>>;

/// ibverbs implementation of [`TransferBackend`].
pub struct IbverbsBackend {
    // Dropped first so the listener stops before shared state unwinds.
    control: Option<ControlPlane>,
    links: Mutex<HashMap<(String, u16), PeerLink>>,
    shared: Arc<RdmaShared>,
    config: BackendConfig,
}

/// Completed RDMA transfer.
pub struct IbvOp {
    status: TransferStatus,
}

impl TransferOp for IbvOp {
    fn status(&self) -> TransferStatus {
        self.status
    }
}

impl IbverbsBackend {
    /// Fetch or establish the queue pair to `remote`.
    fn link_to(&self, remote: &RemoteAddress, conf: &TransferConf) -> Result<PeerLink> {
        let key = (remote.host.clone(), remote.port);
        if let Some(link) = self.links.lock().expect("link table poisoned").get(&key) {
            return Ok(Arc::clone(link));
        }

        let prepared = PreparedQp::create(&self.shared.device, conf.num_pollers as u32)
            .map_err(|e| TransportError::transfer(remote, e.to_string()))?;
        let local_ep = prepared.endpoint();
        let remote_ep = control::exchange_qp_endpoint(&remote.host, remote.port, local_ep)
            .map_err(|e| TransportError::transfer(remote, format!("endpoint exchange: {e}")))?
            .ok_or_else(|| TransportError::transfer(remote, "peer rejected queue pair"))?;
        let connected = prepared
            .complete(remote_ep)
            .map_err(|e| TransportError::transfer(remote, e.to_string()))?;

        let link = Arc::new(Mutex::new(connected));
        self.links
            .lock()
            .expect("link table poisoned")
            .insert(key, Arc::clone(&link));
        tracing::info!(remote = %remote, qp_num = local_ep.qp_num, "established RDMA link");
        Ok(link)
    }

    /// A failed queue pair transitions to the error state; evict it so the
    /// next attempt reconnects.
    fn evict_link(&self, remote: &RemoteAddress) {
        self.links
            .lock()
            .expect("link table poisoned")
            .remove(&(remote.host.clone(), remote.port));
    }
}

impl TransferBackend for IbverbsBackend {
    type Op = IbvOp;

    fn setup(config: BackendConfig) -> Result<Self> {
        if let Err(e) = std::fs::create_dir_all(&config.log.dir) {
            tracing::warn!(dir = %config.log.dir.display(), error = %e, "cannot create backend log dir");
        }
        let device = DeviceContext::open(config.device_pattern.as_deref())?;
        let shared = Arc::new(RdmaShared {
            instance_id: rand::random(),
            num_pollers: config.num_pollers,
            registry: MrRegistry::default(),
            server_qps: Mutex::new(Vec::new()),
            counters: Counters::default(),
            device,
        });
        tracing::info!(
            instance_id = shared.instance_id,
            device = shared.device.device_name(),
            "ibverbs backend ready"
        );
        Ok(Self {
            control: None,
            links: Mutex::new(HashMap::new()),
            shared,
            config,
        })
    }

    fn instance_id(&self) -> u64 {
        self.shared.instance_id
    }

    fn config_mut(&mut self) -> &mut BackendConfig {
        &mut self.config
    }

    fn setup_rpc_server(&mut self) -> Result<()> {
        let control = ControlPlane::bind(self.config.rpc_listen_port, Arc::clone(&self.shared))?;
        self.control = Some(control);
        Ok(())
    }

    fn query_instance_id(&self, host: &str, port: u16) -> Result<u64> {
        control::query_instance_id(host, port).map_err(|e| {
            TransportError::instance_query(&RemoteAddress::new(host, port), e.to_string())
        })
    }

    fn register_ram(&self, addr: usize, len: usize, numa_node: i32) -> Result<()> {
        self.shared
            .registry
            .register(&self.shared.device, addr, len, MemoryKind::Ram)?;
        tracing::debug!(
            addr = %format_args!("{addr:#x}"),
            len,
            numa_node,
            "registered RAM region with NIC"
        );
        Ok(())
    }

    fn register_vram(&self, addr: usize, len: usize, gpu_id: i32) -> Result<()> {
        self.shared
            .registry
            .register(&self.shared.device, addr, len, MemoryKind::Vram)?;
        tracing::debug!(
            addr = %format_args!("{addr:#x}"),
            len,
            gpu_id,
            "registered VRAM region with NIC"
        );
        Ok(())
    }

    fn deregister(&self, addr: usize, len: usize) -> bool {
        self.shared.registry.deregister(addr, len)
    }

    fn exec_transfer(&self, req: &TransferRequest, conf: &TransferConf) -> Result<Self::Op> {
        let lkey = self
            .shared
            .registry
            .lkey_covering(req.local_addr as u64, req.length as u64)
            .ok_or_else(|| {
                TransportError::transfer(
                    &req.remote,
                    format!(
                        "local range {:#x}+{} is not registered",
                        req.local_addr, req.length
                    ),
                )
            })?;

        let rkey = control::query_remote_rkey(
            &req.remote.host,
            req.remote.port,
            req.remote_addr,
            req.length as u64,
        )
        .map_err(|e| TransportError::transfer(&req.remote, format!("rkey lookup: {e}")))?
        .ok_or_else(|| {
            TransportError::transfer(
                &req.remote,
                format!(
                    "remote range {:#x}+{} is not registered",
                    req.remote_addr, req.length
                ),
            )
        })?;

        let link = self.link_to(&req.remote, conf)?;
        self.shared
            .counters
            .transfers
            .fetch_add(1, Ordering::Relaxed);

        let result = link
            .lock()
            .expect("queue pair poisoned")
            .execute(
                req.opcode,
                req.local_addr as u64,
                lkey,
                req.remote_addr,
                rkey,
                req.length,
                conf,
            );

        match result {
            Ok(()) => {
                let counter = match req.opcode {
                    OpCode::Write => &self.shared.counters.bytes_written,
                    OpCode::Read => &self.shared.counters.bytes_read,
                };
                counter.fetch_add(req.length as u64, Ordering::Relaxed);
                Ok(IbvOp {
                    status: TransferStatus::Success,
                })
            }
            Err(e) => {
                self.shared.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.evict_link(&req.remote);
                Err(TransportError::transfer(&req.remote, e.to_string()))
            }
        }
    }

    fn print_perf(&self) {
        let c = &self.shared.counters;
        tracing::info!(
            instance_id = self.shared.instance_id,
            device = self.shared.device.device_name(),
            transfers = c.transfers.load(Ordering::Relaxed),
            bytes_written = c.bytes_written.load(Ordering::Relaxed),
            bytes_read = c.bytes_read.load(Ordering::Relaxed),
            failures = c.failures.load(Ordering::Relaxed),
            ram_regions = self.shared.registry.count_by_kind(MemoryKind::Ram),
            vram_regions = self.shared.registry.count_by_kind(MemoryKind::Vram),
            links = self.links.lock().expect("link table poisoned").len(),
            server_qps = self.shared.server_qps.lock().expect("server QP list poisoned").len(),
            "RDMA transfer stats"
        );
    }
}
