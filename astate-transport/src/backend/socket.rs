//! TCP emulation of the verbs capability surface.
//!
//! `SocketBackend` implements one-sided READ/WRITE semantics over plain
//! sockets: the peer's listener copies bytes directly into or out of its
//! registered regions, so callers see the same addressing model as the
//! ibverbs backend without RDMA hardware. Integration tests and
//! hardware-less deployments assemble the engine against this backend.
//!
//! Wire format (little-endian), one request per frame:
//!
//! ```text
//! [op: u8] QUERY_INSTANCE                      -> [inst: u64]
//! [op: u8] WRITE [inst: u64][raddr: u64][len: u64][payload] -> [status: u8]
//! [op: u8] READ  [inst: u64][raddr: u64][len: u64]          -> [status: u8][payload]
//! ```

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{BackendConfig, TransferBackend, TransferOp};
use crate::error::{Result, TransportError};
use crate::types::{MemoryKind, OpCode, TransferConf, TransferRequest, TransferStatus};

const OP_QUERY_INSTANCE: u8 = 0x01;
const OP_WRITE: u8 = 0x02;
const OP_READ: u8 = 0x03;

const STATUS_OK: u8 = 0;
const STATUS_PROTECTION: u8 = 1;
const STATUS_WRONG_INSTANCE: u8 = 2;

/// Poll period of the accept loop while waiting for connections.
const ACCEPT_POLL: Duration = Duration::from_millis(10);
/// Connect timeout for outbound control/data connections.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct Region {
    addr: usize,
    len: usize,
    kind: MemoryKind,
}

#[derive(Default)]
struct Counters {
    transfers: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    failures: AtomicU64,
}

struct Shared {
    instance_id: u64,
    regions: Mutex<HashMap<(usize, usize), Region>>,
    counters: Counters,
}

impl Shared {
    /// Whether `[addr, addr+len)` lies inside one registered host region.
    ///
    /// VRAM registrations are tracked for interface parity but the socket
    /// data path cannot dereference device pointers, so they never satisfy
    /// an address check here.
    fn covers(&self, addr: u64, len: u64) -> bool {
        let regions = self.regions.lock().expect("region registry poisoned");
        regions.values().any(|r| {
            let start = r.addr as u64;
            let end = start + r.len as u64;
            r.kind == MemoryKind::Ram && addr >= start && addr.saturating_add(len) <= end
        })
    }
}

/// TCP implementation of [`TransferBackend`].
pub struct SocketBackend {
    config: BackendConfig,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    listener_thread: Option<std::thread::JoinHandle<()>>,
}

impl SocketBackend {
    fn serve(
        listener: TcpListener,
        shared: Arc<Shared>,
        running: Arc<AtomicBool>,
    ) {
        while running.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let shared = Arc::clone(&shared);
                    std::thread::spawn(move || {
                        if let Err(e) = handle_connection(stream, &shared) {
                            tracing::debug!(peer = %peer, error = %e, "connection handler exited");
                        }
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed on transfer listener");
                    std::thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }

    fn connect(&self, host: &str, port: u16, timeout_ms: i64) -> Result<TcpStream> {
        let addr = resolve(host, port)?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        let io_timeout = if timeout_ms < 0 {
            None
        } else {
            Some(Duration::from_millis(timeout_ms as u64))
        };
        stream.set_read_timeout(io_timeout)?;
        stream.set_write_timeout(io_timeout)?;
        Ok(stream)
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| TransportError::Io(std::io::Error::other(format!("cannot resolve {host}"))))
}

fn handle_connection(mut stream: TcpStream, shared: &Shared) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    loop {
        let mut op = [0u8; 1];
        if let Err(e) = stream.read_exact(&mut op) {
            // Peer closing between requests is the normal end of a session.
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
            OP_WRITE => {
                let (inst, raddr, len) = read_op_header(&mut stream)?;
                let mut payload = vec![0u8; len as usize];
                stream.read_exact(&mut payload)?;
                let status = if inst != shared.instance_id {
                    STATUS_WRONG_INSTANCE
                } else if !shared.covers(raddr, len) {
                    STATUS_PROTECTION
                } else {
                    // SAFETY: the range was validated against a registered
                    // region whose storage the caller keeps alive for the
                    // duration of the registration.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            payload.as_ptr(),
                            raddr as *mut u8,
                            len as usize,
                        );
                    }
                    shared
                        .counters
                        .bytes_written
                        .fetch_add(len, Ordering::Relaxed);
                    STATUS_OK
                };
                stream.write_all(&[status])?;
            }
            OP_READ => {
                let (inst, raddr, len) = read_op_header(&mut stream)?;
                if inst != shared.instance_id {
                    stream.write_all(&[STATUS_WRONG_INSTANCE])?;
                } else if !shared.covers(raddr, len) {
                    stream.write_all(&[STATUS_PROTECTION])?;
                } else {
                    // SAFETY: as above; the registered range outlives the op.
                    let data = unsafe {
                        std::slice::from_raw_parts(raddr as *const u8, len as usize)
                    };
                    stream.write_all(&[STATUS_OK])?;
                    stream.write_all(data)?;
                    shared.counters.bytes_read.fetch_add(len, Ordering::Relaxed);
                }
            }
            other => {
                return Err(std::io::Error::other(format!("unknown opcode {other:#x}")));
            }
        }
        stream.flush()?;
    }
}

fn read_op_header(stream: &mut TcpStream) -> std::io::Result<(u64, u64, u64)> {
    let mut buf = [0u8; 24];
    stream.read_exact(&mut buf)?;
    let inst = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let raddr = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let len = u64::from_le_bytes(buf[16..24].try_into().unwrap());
    Ok((inst, raddr, len))
}

/// Completed socket transfer.
pub struct SocketOp {
    status: TransferStatus,
}

impl TransferOp for SocketOp {
    fn status(&self) -> TransferStatus {
        self.status
    }
}

impl TransferBackend for SocketBackend {
    type Op = SocketOp;

    fn setup(config: BackendConfig) -> Result<Self> {
        if let Err(e) = std::fs::create_dir_all(&config.log.dir) {
            tracing::warn!(dir = %config.log.dir.display(), error = %e, "cannot create backend log dir");
        }
        let shared = Arc::new(Shared {
            instance_id: rand::random(),
            regions: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        });
        tracing::info!(instance_id = shared.instance_id, "socket transfer backend ready");
        Ok(Self {
            config,
            shared,
            running: Arc::new(AtomicBool::new(false)),
            listener_thread: None,
        })
    }

    fn instance_id(&self) -> u64 {
        self.shared.instance_id
    }

    fn config_mut(&mut self) -> &mut BackendConfig {
        &mut self.config
    }

    fn setup_rpc_server(&mut self) -> Result<()> {
        let port = self.config.rpc_listen_port;
        let listener = TcpListener::bind(("0.0.0.0", port)).map_err(|e| TransportError::Bind {
            port,
            reason: e.to_string(),
        })?;
        listener.set_nonblocking(true).map_err(|e| TransportError::Bind {
            port,
            reason: e.to_string(),
        })?;

        self.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        self.listener_thread = Some(
            std::thread::Builder::new()
                .name(format!("astate-listener-{port}"))
                .spawn(move || SocketBackend::serve(listener, shared, running))
                .map_err(|e| TransportError::Bind {
                    port,
                    reason: e.to_string(),
                })?,
        );
        tracing::info!(port, "transfer listener bound");
        Ok(())
    }

    fn query_instance_id(&self, host: &str, port: u16) -> Result<u64> {
        let remote = crate::types::RemoteAddress::new(host, port);
        let mut stream = self
            .connect(host, port, -1)
            .map_err(|e| TransportError::instance_query(&remote, e.to_string()))?;
        stream
            .write_all(&[OP_QUERY_INSTANCE])
            .map_err(|e| TransportError::instance_query(&remote, e.to_string()))?;
        let mut buf = [0u8; 8];
        stream
            .read_exact(&mut buf)
            .map_err(|e| TransportError::instance_query(&remote, e.to_string()))?;
        Ok(u64::from_le_bytes(buf))
    }

    fn register_ram(&self, addr: usize, len: usize, numa_node: i32) -> Result<()> {
        if addr == 0 || len == 0 {
            return Err(TransportError::Registration { addr, len });
        }
        let mut regions = self.shared.regions.lock().expect("region registry poisoned");
        regions.insert(
            (addr, len),
            Region {
                addr,
                len,
                kind: MemoryKind::Ram,
            },
        );
        tracing::debug!(addr = %format_args!("{addr:#x}"), len, numa_node, "registered RAM region");
        Ok(())
    }

    fn register_vram(&self, addr: usize, len: usize, gpu_id: i32) -> Result<()> {
        if addr == 0 || len == 0 {
            return Err(TransportError::Registration { addr, len });
        }
        let mut regions = self.shared.regions.lock().expect("region registry poisoned");
        regions.insert(
            (addr, len),
            Region {
                addr,
                len,
                kind: MemoryKind::Vram,
            },
        );
        tracing::debug!(addr = %format_args!("{addr:#x}"), len, gpu_id, "registered VRAM region");
        Ok(())
    }

    fn deregister(&self, addr: usize, len: usize) -> bool {
        let mut regions = self.shared.regions.lock().expect("region registry poisoned");
        regions.remove(&(addr, len)).is_some()
    }

    fn exec_transfer(&self, req: &TransferRequest, conf: &TransferConf) -> Result<Self::Op> {
        // The local side of a one-sided op must be registered too.
        if !self.shared.covers(req.local_addr as u64, req.length as u64) {
            return Err(TransportError::transfer(
                &req.remote,
                format!(
                    "local range {:#x}+{} is not registered",
                    req.local_addr, req.length
                ),
            ));
        }

        let mut stream = self
            .connect(&req.remote.host, req.remote.port, conf.timeout_ms)
            .map_err(|e| TransportError::transfer(&req.remote, e.to_string()))?;

        self.shared.counters.transfers.fetch_add(1, Ordering::Relaxed);

        let chunk = conf.chunk_bytes.max(1);
        let mut offset = 0usize;
        while offset < req.length {
            let n = chunk.min(req.length - offset);
            let status = match req.opcode {
                OpCode::Write => self.write_chunk(&mut stream, req, offset, n),
                OpCode::Read => self.read_chunk(&mut stream, req, offset, n),
            }
            .map_err(|e| {
                self.shared.counters.failures.fetch_add(1, Ordering::Relaxed);
                TransportError::transfer(&req.remote, e.to_string())
            })?;
            if status != STATUS_OK {
                self.shared.counters.failures.fetch_add(1, Ordering::Relaxed);
                return Ok(SocketOp {
                    status: TransferStatus::Failure(status as i32),
                });
            }
            offset += n;
        }

        Ok(SocketOp {
            status: TransferStatus::Success,
        })
    }

    fn print_perf(&self) {
        let c = &self.shared.counters;
        tracing::info!(
            instance_id = self.shared.instance_id,
            transfers = c.transfers.load(Ordering::Relaxed),
            bytes_written = c.bytes_written.load(Ordering::Relaxed),
            bytes_read = c.bytes_read.load(Ordering::Relaxed),
            failures = c.failures.load(Ordering::Relaxed),
            "transfer backend stats"
        );
    }
}

impl SocketBackend {
    fn write_chunk(
        &self,
        stream: &mut TcpStream,
        req: &TransferRequest,
        offset: usize,
        n: usize,
    ) -> std::io::Result<u8> {
        // SAFETY: exec_transfer validated [local_addr, local_addr+length)
        // against the local registration table.
        let data = unsafe {
            std::slice::from_raw_parts((req.local_addr + offset) as *const u8, n)
        };
        stream.write_all(&[OP_WRITE])?;
        stream.write_all(&req.remote_instance.to_le_bytes())?;
        stream.write_all(&(req.remote_addr + offset as u64).to_le_bytes())?;
        stream.write_all(&(n as u64).to_le_bytes())?;
        stream.write_all(data)?;
        stream.flush()?;
        let mut status = [0u8; 1];
        stream.read_exact(&mut status)?;
        Ok(status[0])
    }

    fn read_chunk(
        &self,
        stream: &mut TcpStream,
        req: &TransferRequest,
        offset: usize,
        n: usize,
    ) -> std::io::Result<u8> {
        stream.write_all(&[OP_READ])?;
        stream.write_all(&req.remote_instance.to_le_bytes())?;
        stream.write_all(&(req.remote_addr + offset as u64).to_le_bytes())?;
        stream.write_all(&(n as u64).to_le_bytes())?;
        stream.flush()?;
        let mut status = [0u8; 1];
        stream.read_exact(&mut status)?;
        if status[0] != STATUS_OK {
            return Ok(status[0]);
        }
        // SAFETY: as in write_chunk, the destination range is registered.
        let dst = unsafe {
            std::slice::from_raw_parts_mut((req.local_addr + offset) as *mut u8, n)
        };
        stream.read_exact(dst)?;
        Ok(STATUS_OK)
    }
}

impl Drop for SocketBackend {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.listener_thread.take() {
            let _ = handle.join();
        }
        tracing::debug!(instance_id = self.shared.instance_id, "socket backend released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covers_respects_bounds() {
        let shared = Shared {
            instance_id: 1,
            regions: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        };
        shared.regions.lock().unwrap().insert(
            (0x1000, 0x100),
            Region {
                addr: 0x1000,
                len: 0x100,
                kind: MemoryKind::Ram,
            },
        );
        assert!(shared.covers(0x1000, 0x100));
        assert!(shared.covers(0x1080, 0x80));
        assert!(!shared.covers(0x1080, 0x81));
        assert!(!shared.covers(0xfff, 0x10));
        assert!(!shared.covers(0x2000, 1));
    }

    #[test]
    fn test_register_rejects_null_and_empty() {
        let backend = SocketBackend::setup(BackendConfig::default()).unwrap();
        assert!(backend.register_ram(0, 64, -1).is_err());
        let buf = vec![0u8; 64];
        assert!(backend.register_ram(buf.as_ptr() as usize, 0, -1).is_err());
        assert!(backend.register_ram(buf.as_ptr() as usize, 64, -1).is_ok());
    }

    #[test]
    fn test_vram_region_not_host_addressable() {
        let backend = SocketBackend::setup(BackendConfig::default()).unwrap();
        let buf = vec![0u8; 64];
        let addr = buf.as_ptr() as usize;
        assert!(backend.register_vram(addr, 64, 0).is_ok());
        // Registered for bookkeeping, but the socket data path cannot
        // serve device memory.
        assert!(!backend.shared.covers(addr as u64, 64));
        assert!(backend.deregister(addr, 64));
    }

    #[test]
    fn test_deregister_unknown_region_is_false() {
        let backend = SocketBackend::setup(BackendConfig::default()).unwrap();
        let buf = vec![0u8; 64];
        let addr = buf.as_ptr() as usize;
        assert!(!backend.deregister(addr, 64));
        backend.register_ram(addr, 64, -1).unwrap();
        assert!(backend.deregister(addr, 64));
        assert!(!backend.deregister(addr, 64));
    }
}
