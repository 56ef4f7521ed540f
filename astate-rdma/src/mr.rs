//! NIC memory-region registration and lookup.

use std::collections::HashMap;
use std::os::raw::c_int;
use std::sync::Mutex;

use astate_transport::{MemoryKind, Result, TransportError};

use crate::context::DeviceContext;

/// One region registered with the NIC.
///
/// The storage belongs to the caller; this handle only keeps the NIC
/// mapping alive and is deregistered on drop.
pub(crate) struct RegisteredMr {
    mr: *mut ibverbs_sys::ibv_mr,
    addr: usize,
    len: usize,
    kind: MemoryKind,
}

unsafe impl Send for RegisteredMr {}
unsafe impl Sync for RegisteredMr {}

impl RegisteredMr {
    pub(crate) fn lkey(&self) -> u32 {
        unsafe { (*self.mr).lkey }
    }

    pub(crate) fn rkey(&self) -> u32 {
        unsafe { (*self.mr).rkey }
    }

    fn covers(&self, addr: u64, len: u64) -> bool {
        let start = self.addr as u64;
        let end = start + self.len as u64;
        addr >= start && addr.saturating_add(len) <= end
    }
}

impl Drop for RegisteredMr {
    fn drop(&mut self) {
        unsafe {
            if !self.mr.is_null() {
                ibverbs_sys::ibv_dereg_mr(self.mr);
            }
        }
    }
}

/// Registration table keyed by `{addr, len}`.
#[derive(Default)]
pub(crate) struct MrRegistry {
    regions: Mutex<HashMap<(usize, usize), RegisteredMr>>,
}

impl MrRegistry {
    /// Register `[addr, addr+len)` with the NIC for local and remote
    /// one-sided access.
    pub(crate) fn register(
        &self,
        device: &DeviceContext,
        addr: usize,
        len: usize,
        kind: MemoryKind,
    ) -> Result<()> {
        if addr == 0 || len == 0 {
            return Err(TransportError::Registration { addr, len });
        }

        let access = ibverbs_sys::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibverbs_sys::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ibverbs_sys::ibv_access_flags::IBV_ACCESS_REMOTE_READ;

        // SAFETY: the caller guarantees the buffer outlives its
        // registration; VRAM pointers additionally require GPUDirect
        // support in the kernel (nvidia-peermem).
        let mr = unsafe {
            ibverbs_sys::ibv_reg_mr(device.pd, addr as *mut _, len, access.0 as c_int)
        };
        if mr.is_null() {
            return Err(TransportError::Registration { addr, len });
        }

        let registered = RegisteredMr {
            mr,
            addr,
            len,
            kind,
        };
        self.regions
            .lock()
            .expect("MR registry poisoned")
            .insert((addr, len), registered);
        Ok(())
    }

    /// Drop the registration for exactly `{addr, len}`.
    pub(crate) fn deregister(&self, addr: usize, len: usize) -> bool {
        self.regions
            .lock()
            .expect("MR registry poisoned")
            .remove(&(addr, len))
            .is_some()
    }

    /// Local key of the region covering `[addr, addr+len)`.
    pub(crate) fn lkey_covering(&self, addr: u64, len: u64) -> Option<u32> {
        let regions = self.regions.lock().expect("MR registry poisoned");
        regions.values().find(|r| r.covers(addr, len)).map(|r| r.lkey())
    }

    /// Remote key of the region covering `[addr, addr+len)`; served to
    /// peers through the control plane.
    pub(crate) fn rkey_covering(&self, addr: u64, len: u64) -> Option<u32> {
        let regions = self.regions.lock().expect("MR registry poisoned");
        regions.values().find(|r| r.covers(addr, len)).map(|r| r.rkey())
    }

    pub(crate) fn count_by_kind(&self, kind: MemoryKind) -> usize {
        self.regions
            .lock()
            .expect("MR registry poisoned")
            .values()
            .filter(|r| r.kind == kind)
            .count()
    }
}
