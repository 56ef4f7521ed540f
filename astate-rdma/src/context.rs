//! Shared per-device verbs resources: device context and protection domain.

use std::ffi::CStr;
use std::os::raw::c_int;

use astate_transport::{Result, TransportError};

/// Open device context plus its protection domain.
///
/// All queue pairs and memory regions of one backend instance hang off this
/// context. Declared `Send + Sync` because libibverbs guarantees its
/// handles are safe to use from multiple threads.
pub struct DeviceContext {
    pub(crate) ctx: *mut ibverbs_sys::ibv_context,
    pub(crate) pd: *mut ibverbs_sys::ibv_pd,
    pub(crate) gid: [u8; 16],
    device_name: String,
}

unsafe impl Send for DeviceContext {}
unsafe impl Sync for DeviceContext {}

impl DeviceContext {
    /// Open the first device matching `pattern` (comma-separated NIC
    /// names), or the first device present when no pattern is given.
    pub fn open(pattern: Option<&str>) -> Result<Self> {
        let wanted: Vec<&str> = pattern
            .map(|p| p.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        unsafe {
            let mut num_devices: c_int = 0;
            let dev_list = ibverbs_sys::ibv_get_device_list(&mut num_devices);
            if dev_list.is_null() || num_devices == 0 {
                return Err(TransportError::BackendSetup("no RDMA devices found".into()));
            }

            let mut chosen = None;
            for i in 0..num_devices as usize {
                let dev = *dev_list.add(i);
                let name_ptr = ibverbs_sys::ibv_get_device_name(dev);
                if name_ptr.is_null() {
                    continue;
                }
                let name = CStr::from_ptr(name_ptr).to_string_lossy().into_owned();
                if wanted.is_empty() || wanted.iter().any(|w| *w == name) {
                    chosen = Some((dev, name));
                    break;
                }
            }

            let Some((dev, device_name)) = chosen else {
                ibverbs_sys::ibv_free_device_list(dev_list);
                return Err(TransportError::BackendSetup(format!(
                    "no RDMA device matches pattern {:?}",
                    pattern.unwrap_or("")
                )));
            };

            let ctx = ibverbs_sys::ibv_open_device(dev);
            ibverbs_sys::ibv_free_device_list(dev_list);
            if ctx.is_null() {
                return Err(TransportError::BackendSetup(format!(
                    "ibv_open_device failed for {device_name}"
                )));
            }

            let pd = ibverbs_sys::ibv_alloc_pd(ctx);
            if pd.is_null() {
                ibverbs_sys::ibv_close_device(ctx);
                return Err(TransportError::BackendSetup(format!(
                    "ibv_alloc_pd failed for {device_name}"
                )));
            }

            // GID-based addressing works for both InfiniBand and RoCE.
            let mut gid: ibverbs_sys::ibv_gid = std::mem::zeroed();
            let rc = ibverbs_sys::ibv_query_gid(ctx, 1, 0, &mut gid);
            if rc != 0 {
                ibverbs_sys::ibv_dealloc_pd(pd);
                ibverbs_sys::ibv_close_device(ctx);
                return Err(TransportError::BackendSetup(format!(
                    "ibv_query_gid failed for {device_name} (rc={rc})"
                )));
            }

            tracing::info!(device = %device_name, "opened RDMA device");
            Ok(Self {
                ctx,
                pd,
                gid: gid.raw,
                device_name,
            })
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            if !self.pd.is_null() {
                ibverbs_sys::ibv_dealloc_pd(self.pd);
            }
            if !self.ctx.is_null() {
                ibverbs_sys::ibv_close_device(self.ctx);
            }
        }
        tracing::debug!(device = %self.device_name, "closed RDMA device");
    }
}
