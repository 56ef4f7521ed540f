//! Value types shared between the engine and its backends.

/// Control-plane endpoint of a peer transport instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteAddress {
    pub host: String,
    pub port: u16,
}

impl RemoteAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Kind of memory backing a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Ram,
    Vram,
}

/// One-sided operation direction.
///
/// `Write` pushes local bytes into the remote region; `Read` pulls remote
/// bytes into the local region. Neither requires CPU participation at the
/// peer once the request is on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Read,
    Write,
}

/// A single one-sided transfer, consumed within one engine call.
///
/// Addresses are opaque to the transport: `local_addr` must point at a
/// registered local region and `remote_addr` is a virtual address already
/// resolved by the caller against the peer's registered memory.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub opcode: OpCode,
    pub local_addr: usize,
    pub length: usize,
    pub remote_addr: u64,
    pub remote_instance: u64,
    pub remote: RemoteAddress,
}

/// Per-transfer execution knobs handed to the backend.
#[derive(Debug, Clone, Copy)]
pub struct TransferConf {
    pub num_pollers: usize,
    pub chunk_bytes: usize,
    /// Per-direction timeout in milliseconds; -1 means wait forever.
    pub timeout_ms: i64,
}

/// Outcome reported by a backend transfer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    Failure(i32),
}

/// One element of the extend-info carrier.
///
/// Variants other than `RemoteAddr` are reserved for upper layers and are
/// ignored by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtendValue {
    /// Remote virtual address of the peer-side buffer.
    RemoteAddr(u64),
    /// Opaque payload reserved for layers above the transport.
    Opaque(Vec<u8>),
}

/// Ordered, heterogeneous per-call metadata attached to `send`/`receive`.
///
/// The transport requires element 0 to be [`ExtendValue::RemoteAddr`];
/// everything after it passes through untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtendInfo(Vec<ExtendValue>);

impl ExtendInfo {
    /// Build the minimal carrier for a one-sided transfer.
    pub fn from_remote_addr(remote_addr: u64) -> Self {
        Self(vec![ExtendValue::RemoteAddr(remote_addr)])
    }

    /// The remote virtual address, if element 0 carries one.
    pub fn remote_addr(&self) -> Option<u64> {
        match self.0.first() {
            Some(ExtendValue::RemoteAddr(addr)) => Some(*addr),
            _ => None,
        }
    }

    pub fn push(&mut self, value: ExtendValue) {
        self.0.push(value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_address_equality() {
        let a = RemoteAddress::new("host-a", 19001);
        let b = RemoteAddress::new("host-a", 19001);
        let c = RemoteAddress::new("host-a", 19002);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "host-a:19001");
    }

    #[test]
    fn test_extend_info_remote_addr() {
        let info = ExtendInfo::from_remote_addr(0xdead_beef);
        assert_eq!(info.remote_addr(), Some(0xdead_beef));
        assert_eq!(info.len(), 1);
    }

    #[test]
    fn test_extend_info_rejects_wrong_head() {
        let mut info = ExtendInfo::default();
        assert_eq!(info.remote_addr(), None);
        info.push(ExtendValue::Opaque(vec![1, 2, 3]));
        assert_eq!(info.remote_addr(), None);
    }

    #[test]
    fn test_extend_info_extra_elements_pass_through() {
        let mut info = ExtendInfo::from_remote_addr(42);
        info.push(ExtendValue::Opaque(vec![9]));
        assert_eq!(info.remote_addr(), Some(42));
        assert_eq!(info.len(), 2);
    }
}
