//! Reliable-connected queue pairs and one-sided READ/WRITE execution.
//!
//! Two-phase construction mirrors the usual verbs flow:
//! 1. [`PreparedQp::create`] builds a QP in INIT state with its local endpoint.
//! 2. Peers exchange [`QpEndpoint`] over the control plane.
//! 3. [`PreparedQp::complete`] handshakes through RTR to RTS.

use std::os::raw::c_int;
use std::ptr;
use std::time::{Duration, Instant};

use astate_transport::{OpCode, Result, TransferConf, TransportError};
use ibverbs_sys::{
    ibv_access_flags, ibv_qp_attr_mask, ibv_qp_state, ibv_qp_type, ibv_send_flags, ibv_wr_opcode,
};

use crate::context::DeviceContext;

/// Endpoint data exchanged between peers to connect a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpEndpoint {
    pub qp_num: u32,
    pub gid: [u8; 16],
}

pub(crate) const ENDPOINT_WIRE_SIZE: usize = 20;

impl QpEndpoint {
    pub(crate) fn to_bytes(self) -> [u8; ENDPOINT_WIRE_SIZE] {
        let mut buf = [0u8; ENDPOINT_WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.qp_num.to_le_bytes());
        buf[4..20].copy_from_slice(&self.gid);
        buf
    }

    pub(crate) fn from_bytes(buf: &[u8; ENDPOINT_WIRE_SIZE]) -> Self {
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&buf[4..20]);
        Self {
            qp_num: u32::from_le_bytes(buf[0..4].try_into().expect("endpoint header")),
            gid,
        }
    }
}

/// A queue pair in INIT state, awaiting the peer's endpoint.
pub(crate) struct PreparedQp {
    qp: *mut ibverbs_sys::ibv_qp,
    cq: *mut ibverbs_sys::ibv_cq,
    local_ep: QpEndpoint,
}

unsafe impl Send for PreparedQp {}

impl PreparedQp {
    pub(crate) fn create(device: &DeviceContext, max_outstanding: u32) -> Result<Self> {
        unsafe {
            let cq = ibverbs_sys::ibv_create_cq(device.ctx, 256, ptr::null_mut(), ptr::null_mut(), 0);
            if cq.is_null() {
                return Err(TransportError::BackendSetup("ibv_create_cq failed".into()));
            }

            let mut qp_init_attr: ibverbs_sys::ibv_qp_init_attr = std::mem::zeroed();
            qp_init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
            qp_init_attr.send_cq = cq;
            qp_init_attr.recv_cq = cq;
            qp_init_attr.cap.max_send_wr = max_outstanding.max(1) * 2;
            qp_init_attr.cap.max_recv_wr = 1;
            qp_init_attr.cap.max_send_sge = 1;
            qp_init_attr.cap.max_recv_sge = 1;

            let qp = ibverbs_sys::ibv_create_qp(device.pd, &mut qp_init_attr);
            if qp.is_null() {
                ibverbs_sys::ibv_destroy_cq(cq);
                return Err(TransportError::BackendSetup("ibv_create_qp failed".into()));
            }

            // Move to INIT with one-sided access enabled.
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
            attr.pkey_index = 0;
            attr.port_num = 1;
            attr.qp_access_flags = (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
                | ibv_access_flags::IBV_ACCESS_REMOTE_READ)
                .0;

            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                | ibv_qp_attr_mask::IBV_QP_PORT
                | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;

            let rc = ibverbs_sys::ibv_modify_qp(qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                ibverbs_sys::ibv_destroy_qp(qp);
                ibverbs_sys::ibv_destroy_cq(cq);
                return Err(TransportError::BackendSetup(format!(
                    "ibv_modify_qp to INIT failed (rc={rc})"
                )));
            }

            let local_ep = QpEndpoint {
                qp_num: (*qp).qp_num,
                gid: device.gid,
            };

            Ok(Self { qp, cq, local_ep })
        }
    }

    pub(crate) fn endpoint(&self) -> QpEndpoint {
        self.local_ep
    }

    /// Complete the handshake: INIT -> RTR -> RTS.
    pub(crate) fn complete(mut self, remote: QpEndpoint) -> Result<ConnectedQp> {
        unsafe {
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
            attr.path_mtu = ibverbs_sys::IBV_MTU_4096;
            attr.dest_qp_num = remote.qp_num;
            attr.rq_psn = 0;
            attr.max_dest_rd_atomic = 4;
            attr.min_rnr_timer = 12;

            attr.ah_attr.is_global = 1;
            attr.ah_attr.grh.dgid.raw = remote.gid;
            attr.ah_attr.grh.sgid_index = 0;
            attr.ah_attr.grh.hop_limit = 64;
            attr.ah_attr.grh.traffic_class = 0;
            // GID routing covers both IB and RoCE; LID stays unset.
            attr.ah_attr.dlid = 0;
            attr.ah_attr.sl = 0;
            attr.ah_attr.src_path_bits = 0;
            attr.ah_attr.port_num = 1;

            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_AV
                | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;

            let rc = ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(TransportError::BackendSetup(format!(
                    "ibv_modify_qp to RTR failed (rc={rc})"
                )));
            }

            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
            attr.sq_psn = 0;
            attr.timeout = 14;
            attr.retry_cnt = 7;
            attr.rnr_retry = 7;
            attr.max_rd_atomic = 4;

            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;

            let rc = ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(TransportError::BackendSetup(format!(
                    "ibv_modify_qp to RTS failed (rc={rc})"
                )));
            }

            let qp = self.qp;
            let cq = self.cq;
            self.qp = ptr::null_mut();
            self.cq = ptr::null_mut();
            Ok(ConnectedQp { qp, cq })
        }
    }
}

impl Drop for PreparedQp {
    fn drop(&mut self) {
        unsafe {
            if !self.qp.is_null() {
                ibverbs_sys::ibv_destroy_qp(self.qp);
            }
            if !self.cq.is_null() {
                ibverbs_sys::ibv_destroy_cq(self.cq);
            }
        }
    }
}

/// A fully connected RC queue pair.
pub(crate) struct ConnectedQp {
    qp: *mut ibverbs_sys::ibv_qp,
    cq: *mut ibverbs_sys::ibv_cq,
}

unsafe impl Send for ConnectedQp {}

impl ConnectedQp {
    /// Execute one one-sided transfer, chunked and pipelined.
    ///
    /// Keeps up to `conf.num_pollers` work requests outstanding and polls
    /// the CQ for each completion. A negative `conf.timeout_ms` waits
    /// forever, otherwise the whole transfer shares one deadline.
    pub(crate) fn execute(
        &mut self,
        opcode: OpCode,
        local_addr: u64,
        lkey: u32,
        remote_addr: u64,
        rkey: u32,
        length: usize,
        conf: &TransferConf,
    ) -> Result<()> {
        let deadline = (conf.timeout_ms >= 0)
            .then(|| Instant::now() + Duration::from_millis(conf.timeout_ms as u64));
        let chunk = conf.chunk_bytes.max(1);
        let window = conf.num_pollers.max(1);

        let mut next = 0usize;
        let mut outstanding = 0usize;
        while next < length || outstanding > 0 {
            while outstanding < window && next < length {
                let n = chunk.min(length - next);
                self.post(opcode, local_addr + next as u64, lkey, remote_addr + next as u64, rkey, n)?;
                next += n;
                outstanding += 1;
            }
            self.poll_one(deadline)?;
            outstanding -= 1;
        }
        Ok(())
    }

    fn post(
        &mut self,
        opcode: OpCode,
        local_addr: u64,
        lkey: u32,
        remote_addr: u64,
        rkey: u32,
        len: usize,
    ) -> Result<()> {
        unsafe {
            let mut sge: ibverbs_sys::ibv_sge = std::mem::zeroed();
            sge.addr = local_addr;
            sge.length = len as u32;
            sge.lkey = lkey;

            let mut wr: ibverbs_sys::ibv_send_wr = std::mem::zeroed();
            wr.wr_id = remote_addr;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            wr.opcode = match opcode {
                OpCode::Write => ibv_wr_opcode::IBV_WR_RDMA_WRITE,
                OpCode::Read => ibv_wr_opcode::IBV_WR_RDMA_READ,
            };
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            wr.wr.rdma.remote_addr = remote_addr;
            wr.wr.rdma.rkey = rkey;

            let mut bad_wr: *mut ibverbs_sys::ibv_send_wr = ptr::null_mut();
            let ctx = (*self.qp).context;
            let ops = &mut (*ctx).ops;
            let rc = ops.post_send.as_mut().expect("post_send missing")(
                self.qp,
                &mut wr as *mut _,
                &mut bad_wr as *mut _,
            );
            if rc != 0 {
                return Err(TransportError::Io(std::io::Error::other(format!(
                    "post_send failed (rc={rc})"
                ))));
            }
        }
        Ok(())
    }

    /// Poll the CQ for one completion with tiered backoff.
    fn poll_one(&mut self, deadline: Option<Instant>) -> Result<()> {
        let mut iter = 0u32;
        loop {
            unsafe {
                let mut wc = ibverbs_sys::ibv_wc::default();
                let ctx = (*self.cq).context;
                let ops = &mut (*ctx).ops;
                let n = ops.poll_cq.as_mut().expect("poll_cq missing")(
                    self.cq,
                    1,
                    &mut wc as *mut _,
                );
                if n < 0 {
                    return Err(TransportError::Io(std::io::Error::other("poll_cq failed")));
                }
                if n > 0 {
                    if let Some((status, vendor_err)) = wc.error() {
                        return Err(TransportError::Io(std::io::Error::other(format!(
                            "work completion failed (status={status:?}, vendor_err={vendor_err}, wr_id={:#x})",
                            wc.wr_id()
                        ))));
                    }
                    return Ok(());
                }
            }
            if let Some(deadline) = deadline {
                if Instant::now() > deadline {
                    return Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "CQ poll timed out",
                    )));
                }
            }
            if iter < 1000 {
                std::hint::spin_loop();
            } else if iter < 5000 {
                std::thread::sleep(Duration::from_micros(10));
            } else {
                std::thread::sleep(Duration::from_micros(100));
            }
            iter = iter.saturating_add(1);
        }
    }
}

impl Drop for ConnectedQp {
    fn drop(&mut self) {
        unsafe {
            if !self.qp.is_null() {
                ibverbs_sys::ibv_destroy_qp(self.qp);
            }
            if !self.cq.is_null() {
                ibverbs_sys::ibv_destroy_cq(self.cq);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_wire_roundtrip() {
        let ep = QpEndpoint {
            qp_num: 0x0102_0304,
            gid: [7u8; 16],
        };
        let bytes = ep.to_bytes();
        assert_eq!(QpEndpoint::from_bytes(&bytes), ep);
    }
}
