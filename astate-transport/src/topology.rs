//! NIC/GPU topology probing and RDMA device selection.
//!
//! All queries are backed by sysfs/procfs. Every reader takes the tree root
//! as a parameter so tests can point them at a synthetic hierarchy; the
//! `*_system` constructors use the real paths.
//!
//! Probe failure is never fatal to the engine: a broken or absent topology
//! degrades to rank-based selection, and an empty selection leaves the
//! backend on its default device choice.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{Result, TransportError};

const IB_CLASS_DIR: &str = "/sys/class/infiniband";
const PCI_DEVICES_DIR: &str = "/sys/bus/pci/devices";
const NVIDIA_GPU_PROC_DIR: &str = "/proc/driver/nvidia/gpus";
const NUMA_NODE_DIR: &str = "/sys/devices/system/node";

/// NUMA node of an InfiniBand device, from
/// `/sys/class/infiniband/<dev>/device/numa_node`.
///
/// Missing or unreadable entries yield -1 (unknown), matching the kernel's
/// own "no affinity" value.
pub fn numa_node_of_ib_device(dev: &str) -> i32 {
    numa_node_of_ib_device_in(Path::new(IB_CLASS_DIR), dev)
}

pub fn numa_node_of_ib_device_in(ib_dir: &Path, dev: &str) -> i32 {
    let path = ib_dir.join(dev).join("device").join("numa_node");
    match fs::read_to_string(&path) {
        Ok(text) => text.trim().parse().unwrap_or(-1),
        Err(_) => -1,
    }
}

/// One RDMA NIC with its position in the PCI hierarchy.
#[derive(Debug, Clone)]
struct NicDevice {
    name: String,
    /// Canonical sysfs path of the underlying PCI function.
    pci_path: Vec<String>,
}

/// GPU/NIC placement map for topology-aware device selection.
///
/// Owned by the engine (not a process-wide singleton); construct once per
/// `start` and drop with the engine.
#[derive(Debug, Default)]
pub struct GpuTopology {
    nics: Vec<NicDevice>,
    /// GPU index -> canonical sysfs path of the GPU's PCI function.
    gpus: HashMap<i32, Vec<String>>,
}

impl GpuTopology {
    /// Probe the live system.
    pub fn probe_system() -> Result<Self> {
        Self::probe(
            Path::new(IB_CLASS_DIR),
            Path::new(PCI_DEVICES_DIR),
            Path::new(NVIDIA_GPU_PROC_DIR),
        )
    }

    /// Probe a topology rooted at the given directories.
    pub fn probe(ib_dir: &Path, pci_dir: &Path, gpu_proc_dir: &Path) -> Result<Self> {
        let mut nics = Vec::new();
        if ib_dir.exists() {
            let mut entries: Vec<_> = fs::read_dir(ib_dir)
                .map_err(TransportError::Io)?
                .filter_map(|e| e.ok())
                .collect();
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                let name = entry.file_name().to_string_lossy().into_owned();
                let device_link = entry.path().join("device");
                match fs::canonicalize(&device_link) {
                    Ok(real) => nics.push(NicDevice {
                        name,
                        pci_path: path_components(&real),
                    }),
                    Err(e) => {
                        tracing::debug!(nic = %name, error = %e, "skipping NIC without PCI path");
                    }
                }
            }
        }

        let mut gpus = HashMap::new();
        if gpu_proc_dir.exists() {
            for entry in fs::read_dir(gpu_proc_dir).map_err(TransportError::Io)? {
                let entry = entry.map_err(TransportError::Io)?;
                let pci_addr = entry.file_name().to_string_lossy().to_lowercase();
                let info = entry.path().join("information");
                let Ok(content) = fs::read_to_string(&info) else {
                    continue;
                };
                let Some(minor) = parse_device_minor(&content) else {
                    continue;
                };
                let pci_entry = pci_dir.join(&pci_addr);
                let real = fs::canonicalize(&pci_entry).unwrap_or(pci_entry);
                gpus.insert(minor, path_components(&real));
            }
        }

        tracing::debug!(nics = nics.len(), gpus = gpus.len(), "probed PCI topology");
        Ok(Self { nics, gpus })
    }

    /// Whether the probe found any RDMA NIC at all.
    pub fn has_devices(&self) -> bool {
        !self.nics.is_empty()
    }

    /// The `max` NIC names closest to GPU `gpu` in the PCI hierarchy.
    ///
    /// Distance is the hop count through the deepest common ancestor of the
    /// two sysfs device paths; NICs under the same root port as the GPU
    /// therefore sort ahead of NICs behind another root complex. Unknown
    /// GPUs degrade to the name-sorted prefix.
    pub fn select_devices(&self, gpu: i32, max: usize) -> Vec<String> {
        if self.nics.is_empty() || max == 0 {
            return Vec::new();
        }
        let Some(gpu_path) = self.gpus.get(&gpu) else {
            tracing::debug!(gpu, "GPU not present in topology, selecting by name order");
            return self.nics.iter().take(max).map(|n| n.name.clone()).collect();
        };

        let mut ranked: Vec<(usize, &NicDevice)> = self
            .nics
            .iter()
            .map(|nic| (path_distance(gpu_path, &nic.pci_path), nic))
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));
        ranked
            .into_iter()
            .take(max)
            .map(|(_, nic)| nic.name.clone())
            .collect()
    }

    /// Deterministic rank-based partition of NICs for GPU-less processes.
    ///
    /// Equal ranks always yield equal selections; distinct ranks on the same
    /// host start at distinct NICs whenever the NIC count allows.
    pub fn select_devices_by_rank(&self, rank: u32, max: usize) -> Vec<String> {
        let n = self.nics.len();
        if n == 0 || max == 0 {
            return Vec::new();
        }
        let start = rank as usize % n;
        (0..max.min(n))
            .map(|i| self.nics[(start + i) % n].name.clone())
            .collect()
    }
}

fn parse_device_minor(information: &str) -> Option<i32> {
    for line in information.lines() {
        if let Some(rest) = line.strip_prefix("Device Minor:") {
            return rest.trim().parse().ok();
        }
    }
    None
}

fn path_components(path: &Path) -> Vec<String> {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect()
}

/// Hop count between two sysfs device paths through their deepest common
/// ancestor.
fn path_distance(a: &[String], b: &[String]) -> usize {
    let common = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
    (a.len() - common) + (b.len() - common)
}

/// Pin the calling thread's CPU affinity and memory policy to `node`.
///
/// Reads the node's cpulist from sysfs, restricts scheduling to those CPUs,
/// and binds the mempolicy so subsequent allocations land on the node.
pub fn pin_to_numa_node(node: i32) -> Result<()> {
    pin_to_numa_node_in(Path::new(NUMA_NODE_DIR), node)
}

pub fn pin_to_numa_node_in(numa_dir: &Path, node: i32) -> Result<()> {
    if node < 0 {
        return Err(TransportError::invalid_argument(format!(
            "cannot pin to unknown NUMA node {node}"
        )));
    }

    let cpulist_path = numa_dir.join(format!("node{node}")).join("cpulist");
    let cpulist = fs::read_to_string(&cpulist_path).map_err(TransportError::Io)?;
    let cpus = parse_cpu_list(&cpulist)?;
    if cpus.is_empty() {
        return Err(TransportError::invalid_argument(format!(
            "NUMA node {node} has an empty cpulist"
        )));
    }

    let mut set = nix::sched::CpuSet::new();
    for cpu in &cpus {
        set.set(*cpu)
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    }
    nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

    bind_memory_to_node(node)?;
    tracing::info!(node, cpus = cpus.len(), "pinned thread and mempolicy to NUMA node");
    Ok(())
}

/// `set_mempolicy(MPOL_BIND, ...)` for a single node.
fn bind_memory_to_node(node: i32) -> std::io::Result<()> {
    const MPOL_BIND: libc::c_long = 2;
    let mut mask = [0u64; 16];
    let idx = node as usize;
    mask[idx / 64] |= 1u64 << (idx % 64);
    // SAFETY: mask outlives the call and maxnode matches its bit length.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_set_mempolicy,
            MPOL_BIND,
            mask.as_ptr(),
            (mask.len() * 64) as libc::c_long,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Compact rendering of the calling thread's CPU affinity, e.g. `0-3,8`.
pub fn cpu_affinity_string() -> String {
    let Ok(set) = nix::sched::sched_getaffinity(nix::unistd::Pid::from_raw(0)) else {
        return String::from("unknown");
    };
    let mut cpus = Vec::new();
    for cpu in 0..nix::sched::CpuSet::count() {
        if set.is_set(cpu).unwrap_or(false) {
            cpus.push(cpu);
        }
    }
    format_cpu_ranges(&cpus)
}

fn format_cpu_ranges(cpus: &[usize]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < cpus.len() {
        let start = cpus[i];
        let mut end = start;
        while i + 1 < cpus.len() && cpus[i + 1] == end + 1 {
            i += 1;
            end = cpus[i];
        }
        if !out.is_empty() {
            out.push(',');
        }
        if start == end {
            out.push_str(&start.to_string());
        } else {
            out.push_str(&format!("{start}-{end}"));
        }
        i += 1;
    }
    out
}

/// Parse a kernel cpulist such as `0-3,8-11,16`.
fn parse_cpu_list(list: &str) -> Result<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',') {
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().map_err(|_| {
                    TransportError::invalid_argument(format!("bad cpulist range: {part}"))
                })?;
                let hi: usize = hi.trim().parse().map_err(|_| {
                    TransportError::invalid_argument(format!("bad cpulist range: {part}"))
                })?;
                cpus.extend(lo..=hi);
            }
            None => {
                let cpu: usize = part.trim().parse().map_err(|_| {
                    TransportError::invalid_argument(format!("bad cpulist entry: {part}"))
                })?;
                cpus.push(cpu);
            }
        }
    }
    Ok(cpus)
}

/// Index of the CUDA device bound to the calling thread, if any.
#[cfg(feature = "cuda")]
pub fn active_cuda_device() -> Option<i32> {
    use cudarc::driver::result;
    if result::init().is_err() {
        return None;
    }
    match result::ctx::get_device() {
        Ok(dev) => {
            let dev = dev as i32;
            (dev >= 0).then_some(dev)
        }
        Err(_) => None,
    }
}

#[cfg(not(feature = "cuda"))]
pub fn active_cuda_device() -> Option<i32> {
    None
}
