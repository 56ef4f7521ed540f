//! TCP control plane: instance-id resolution, memory-key lookup, and
//! queue-pair endpoint exchange.
//!
//! One request per frame, little-endian:
//!
//! ```text
//! [0x01] QUERY_INSTANCE                      -> [inst: u64]
//! [0x02] QUERY_MR [addr: u64][len: u64]      -> [status: u8][rkey: u32]
//! [0x03] CONNECT_QP [endpoint: 20 bytes]     -> [status: u8][endpoint: 20 bytes]
//! ```

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use astate_transport::{Result, TransportError};

use crate::backend::RdmaShared;
use crate::qp::{PreparedQp, QpEndpoint, ENDPOINT_WIRE_SIZE};

const OP_QUERY_INSTANCE: u8 = 0x01;
const OP_QUERY_MR: u8 = 0x02;
const OP_CONNECT_QP: u8 = 0x03;

const STATUS_OK: u8 = 0;
const STATUS_FAILED: u8 = 1;

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Listener half of the control plane.
pub(crate) struct ControlPlane {
    running: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ControlPlane {
    pub(crate) fn bind(port: u16, shared: Arc<RdmaShared>) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).map_err(|e| TransportError::Bind {
            port,
            reason: e.to_string(),
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| TransportError::Bind {
                port,
                reason: e.to_string(),
            })?;

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name(format!("astate-rdma-ctl-{port}"))
            .spawn(move || serve(listener, shared, thread_running))
            .map_err(|e| TransportError::Bind {
                port,
                reason: e.to_string(),
            })?;

        tracing::info!(port, "RDMA control plane bound");
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve(listener: TcpListener, shared: Arc<RdmaShared>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, &shared) {
                        tracing::debug!(peer = %peer, error = %e, "control connection closed");
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                tracing::warn!(error = %e, "control plane accept failed");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn handle_connection(mut stream: TcpStream, shared: &RdmaShared) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    loop {
        let mut op = [0u8; 1];
        if let Err(e) = stream.read_exact(&mut op) {
            return if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Ok(())
            } else {
                Err(e)
            };
        }
        match op[0] {
            OP_QUERY_INSTANCE => {
                stream.write_all(&shared.instance_id.to_le_bytes())?;
            }
            OP_QUERY_MR => {
                let mut buf = [0u8; 16];
                stream.read_exact(&mut buf)?;
                let addr = u64::from_le_bytes(buf[0..8].try_into().unwrap());
                let len = u64::from_le_bytes(buf[8..16].try_into().unwrap());
                match shared.registry.rkey_covering(addr, len) {
                    Some(rkey) => {
                        stream.write_all(&[STATUS_OK])?;
                        stream.write_all(&rkey.to_le_bytes())?;
                    }
                    None => {
                        stream.write_all(&[STATUS_FAILED])?;
                        stream.write_all(&0u32.to_le_bytes())?;
                    }
                }
            }
            OP_CONNECT_QP => {
                let mut buf = [0u8; ENDPOINT_WIRE_SIZE];
                stream.read_exact(&mut buf)?;
                let client_ep = QpEndpoint::from_bytes(&buf);
                match accept_qp(shared, client_ep) {
                    Ok(server_ep) => {
                        stream.write_all(&[STATUS_OK])?;
                        stream.write_all(&server_ep.to_bytes())?;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "queue pair accept failed");
                        stream.write_all(&[STATUS_FAILED])?;
                        stream.write_all(&[0u8; ENDPOINT_WIRE_SIZE])?;
                    }
                }
            }
            other => {
                return Err(std::io::Error::other(format!("unknown opcode {other:#x}")));
            }
        }
        stream.flush()?;
    }
}

/// Build the server-side QP for an incoming connect request and keep it
/// alive until the backend is released.
fn accept_qp(shared: &RdmaShared, client_ep: QpEndpoint) -> Result<QpEndpoint> {
    let prepared = PreparedQp::create(&shared.device, shared.num_pollers as u32)?;
    let server_ep = prepared.endpoint();
    let connected = prepared.complete(client_ep)?;
    shared
        .server_qps
        .lock()
        .expect("server QP list poisoned")
        .push(connected);
    Ok(server_ep)
}

fn connect(host: &str, port: u16) -> std::io::Result<TcpStream> {
    let addr: SocketAddr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::other(format!("cannot resolve {host}")))?;
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    Ok(stream)
}

pub(crate) fn query_instance_id(host: &str, port: u16) -> std::io::Result<u64> {
    let mut stream = connect(host, port)?;
    stream.write_all(&[OP_QUERY_INSTANCE])?;
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn query_remote_rkey(
    host: &str,
    port: u16,
    addr: u64,
    len: u64,
) -> std::io::Result<Option<u32>> {
    let mut stream = connect(host, port)?;
    stream.write_all(&[OP_QUERY_MR])?;
    stream.write_all(&addr.to_le_bytes())?;
    stream.write_all(&len.to_le_bytes())?;
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf)?;
    if buf[0] != STATUS_OK {
        return Ok(None);
    }
    Ok(Some(u32::from_le_bytes(buf[1..5].try_into().unwrap())))
}

pub(crate) fn exchange_qp_endpoint(
    host: &str,
    port: u16,
    local_ep: QpEndpoint,
) -> std::io::Result<Option<QpEndpoint>> {
    let mut stream = connect(host, port)?;
    stream.write_all(&[OP_CONNECT_QP])?;
    stream.write_all(&local_ep.to_bytes())?;
    let mut status = [0u8; 1];
    stream.read_exact(&mut status)?;
    let mut buf = [0u8; ENDPOINT_WIRE_SIZE];
    stream.read_exact(&mut buf)?;
    if status[0] != STATUS_OK {
        return Ok(None);
    }
    Ok(Some(QpEndpoint::from_bytes(&buf)))
}
