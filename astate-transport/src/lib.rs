//! One-sided tensor transport for AState.
//!
//! This crate moves large tensor buffers (weights, KV caches) between
//! training and inference processes with one-sided READ/WRITE semantics:
//! the engine registers caller-owned memory, resolves peers through a
//! lightweight control plane, and executes transfers against an opaque
//! remote virtual address with bounded retries and per-direction timeouts.
//!
//! The verbs-level library is abstracted behind [`TransferBackend`];
//! assembling the engine against a different backend is a type-parameter
//! choice, not a code change. The in-crate [`SocketBackend`] emulates the
//! capability surface over plain TCP for hardware-less environments; the
//! `astate-rdma` crate provides the ibverbs implementation.
//!
//! ```no_run
//! use astate_transport::{Options, ParallelConfig, SocketEngine};
//!
//! let mut engine = SocketEngine::new();
//! let mut opts = Options::default();
//! opts.fixed_port = true;
//! opts.local_port = 19001;
//! assert!(engine.start(opts, ParallelConfig::new(0, 1)));
//!
//! let buf = vec![0u8; 4 << 20];
//! assert!(engine.register_memory(buf.as_ptr() as usize, buf.len(), false, -1));
//! // ... send / receive against peers ...
//! engine.stop();
//! ```

pub mod backend;
pub mod engine;
pub mod error;
pub mod options;
pub mod perf;
pub mod retry;
pub mod topology;
pub mod types;

pub use backend::socket::SocketBackend;
pub use backend::{BackendConfig, LogConfig, TransferBackend, TransferOp};
pub use engine::{TransportEngine, BIND_PORT_MAX_RETRY, RDMA_PORT_START};
pub use error::{Result, TransportError};
pub use options::{Options, ParallelConfig};
pub use retry::{retry, CountingAndSleepRetry, CountingRetry, RetryPolicy};
pub use types::{
    ExtendInfo, ExtendValue, MemoryKind, OpCode, RemoteAddress, TransferConf, TransferRequest,
    TransferStatus,
};

/// Engine assembled against the TCP emulation backend.
pub type SocketEngine = TransportEngine<SocketBackend>;
