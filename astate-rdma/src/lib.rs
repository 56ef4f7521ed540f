//! ibverbs implementation of the AState transfer backend.
//!
//! This crate plugs real RDMA hardware into `astate-transport`: memory
//! regions are registered with the NIC, peers exchange queue-pair endpoints
//! and memory keys over a small TCP control plane, and transfers execute as
//! one-sided RDMA READ/WRITE on reliable-connected queue pairs.
//!
//! Uses raw `ibverbs-sys` FFI (no safe wrapper). Assemble the engine with
//! `TransportEngine<IbverbsBackend>`; no engine code changes relative to
//! the socket backend.

// RDMA requires frequent unsafe blocks against the verbs FFI surface.
#![allow(clippy::missing_safety_doc)]

mod backend;
mod context;
mod control;
mod mr;
mod qp;

pub use backend::{IbvOp, IbverbsBackend};
pub use context::DeviceContext;
pub use qp::QpEndpoint;

use astate_transport::TransportEngine;

/// Engine assembled against real RDMA hardware.
pub type RdmaEngine = TransportEngine<IbverbsBackend>;
