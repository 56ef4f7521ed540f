//! The verbs-level capability surface the engine drives.
//!
//! The engine never touches a concrete RDMA library; it is generic over
//! [`TransferBackend`], and the backend is chosen at assembly time by
//! picking the type parameter. Two implementations exist: the in-crate
//! [`socket::SocketBackend`] (plain TCP emulation of one-sided transfers,
//! no special hardware) and the `astate-rdma` crate's ibverbs backend.

pub mod socket;

use std::path::PathBuf;

use crate::error::Result;
use crate::types::{TransferConf, TransferRequest, TransferStatus};

/// File-logging knobs forwarded to the backend library.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub file_name: String,
    pub max_file_bytes: u64,
    pub max_files: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/tmp/astate"),
            file_name: format!("utrans-{}", std::process::id()),
            max_file_bytes: 1024 * 1024 * 1024,
            max_files: 16,
        }
    }
}

/// Configuration handed to [`TransferBackend::setup`].
///
/// `rpc_listen_port` may be rewritten through
/// [`TransferBackend::config_mut`] between `setup` and each
/// [`TransferBackend::setup_rpc_server`] attempt; everything else is fixed
/// once the context exists.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub log: LogConfig,
    pub num_pollers: usize,
    /// Comma-separated NIC names the backend may use; `None` leaves the
    /// backend on its own default device choice.
    pub device_pattern: Option<String>,
    pub rpc_listen_port: u16,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            num_pollers: 4,
            device_pattern: None,
            rpc_listen_port: 0,
        }
    }
}

/// Handle to one submitted transfer.
///
/// Dropping the handle releases whatever the backend allocated for the
/// operation, so every exit path of the caller releases exactly once.
pub trait TransferOp {
    /// Completion status of the operation. The backends here block inside
    /// `exec_transfer` until completion or timeout, so this never observes
    /// an in-flight operation.
    fn status(&self) -> TransferStatus;
}

/// Capability surface of a verbs-level transfer library.
///
/// Implementations are expected to be internally thread-safe on the data
/// path: `exec_transfer`, registration, and queries may be called from
/// multiple threads without external serialization.
pub trait TransferBackend: Send + Sync + Sized + 'static {
    type Op: TransferOp;

    /// Create the backend context. Called exactly once per engine start.
    fn setup(config: BackendConfig) -> Result<Self>;

    /// The opaque id peers use to address this instance.
    fn instance_id(&self) -> u64;

    /// Mutable view of the config, used to set the listener port before
    /// each `setup_rpc_server` attempt.
    fn config_mut(&mut self) -> &mut BackendConfig;

    /// Bring up the control-plane listener on `config.rpc_listen_port`.
    fn setup_rpc_server(&mut self) -> Result<()>;

    /// Resolve the instance id of the peer listening at `host:port`.
    fn query_instance_id(&self, host: &str, port: u16) -> Result<u64>;

    /// Register a host-memory region on the selected devices.
    fn register_ram(&self, addr: usize, len: usize, numa_node: i32) -> Result<()>;

    /// Register a device-memory region for GPU `gpu_id`.
    fn register_vram(&self, addr: usize, len: usize, gpu_id: i32) -> Result<()>;

    /// Drop a registration. Returns false for unknown regions.
    fn deregister(&self, addr: usize, len: usize) -> bool;

    /// Execute one one-sided transfer, blocking until completion or
    /// timeout. `Err` means the operation could not be submitted or
    /// completed; `Ok` carries the handle whose status must be inspected.
    fn exec_transfer(&self, req: &TransferRequest, conf: &TransferConf) -> Result<Self::Op>;

    /// Emit transport counters to the log.
    fn print_perf(&self);
}
