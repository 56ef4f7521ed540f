//! Engine configuration.
//!
//! All values have defaults. Override by constructing `Options` directly or
//! via [`Options::from_env`], which recognizes the `TRANSFER_ENGINE_*` and
//! `TRANSPORT_*` environment variables.

/// Configuration snapshot for the transport engine.
///
/// Constructed before [`crate::TransportEngine::start`] and immutable
/// afterwards; only the perf-stats interval is advertised as tunable at
/// runtime (the engine copies it into an atomic).
#[derive(Debug, Clone)]
pub struct Options {
    /// Metadata service address, stored for the layers above the transport.
    pub meta_service_address: String,

    /// Listener port used verbatim when `fixed_port` is set.
    pub local_port: u16,

    /// Bind the control-plane listener to `local_port` instead of scanning
    /// a randomized window.
    pub fixed_port: bool,

    /// Timeout for one-sided READ operations in ms; -1 means wait forever.
    pub read_timeout_ms: i64,

    /// Timeout for one-sided WRITE operations in ms; -1 means wait forever.
    pub write_timeout_ms: i64,

    /// Completion-poller count handed to the backend.
    pub num_pollers: usize,

    /// Upper bound on the number of RDMA NICs selected for this process.
    pub max_rdma_devices: usize,

    /// Pin the calling thread and its allocations to the primary NIC's
    /// NUMA node during `start`.
    pub enable_numa_allocation: bool,

    /// Start the background perf sampler.
    pub enable_perf_metrics: bool,

    /// Perf sampler period in ms.
    pub perf_stats_interval_ms: u64,

    pub send_retry_count: u32,
    pub send_retry_sleep_ms: u64,
    pub receive_retry_count: u32,
    pub receive_retry_sleep_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            meta_service_address: String::new(),
            local_port: 0,
            fixed_port: false,
            read_timeout_ms: -1,
            write_timeout_ms: -1,
            num_pollers: 4,
            max_rdma_devices: 1,
            enable_numa_allocation: false,
            enable_perf_metrics: false,
            perf_stats_interval_ms: 500,
            send_retry_count: 3,
            send_retry_sleep_ms: 100,
            receive_retry_count: 3,
            receive_retry_sleep_ms: 100,
        }
    }
}

impl Options {
    /// Load options from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `TRANSFER_ENGINE_META_SERVICE_ADDRESS`
    /// - `TRANSFER_ENGINE_LOCAL_PORT`
    /// - `TRANSFER_ENGINE_SERVICE_FIXED_PORT`
    /// - `TRANSFER_ENGINE_READ_TIMEOUT_MS` / `TRANSFER_ENGINE_WRITE_TIMEOUT_MS`
    /// - `TRANSFER_ENGINE_RDMA_NUM_POLLERS`
    /// - `TRANSFER_ENGINE_MAX_RDMA_DEVICES`
    /// - `TRANSFER_ENGINE_ENABLE_NUMA_ALLOCATION`
    /// - `TRANSFER_ENGINE_ENABLE_PERF_METRICS`
    /// - `TRANSFER_ENGINE_PERF_STATS_INTERVAL_MS`
    /// - `TRANSPORT_SEND_RETRY_COUNT` / `TRANSPORT_RECEIVE_RETRY_COUNT`
    /// - `TRANSPORT_SEND_RETRY_SLEEP_MS` / `TRANSPORT_RECEIVE_RETRY_SLEEP_MS`
    pub fn from_env() -> Self {
        let mut opts = Self::default();

        if let Ok(v) = std::env::var("TRANSFER_ENGINE_META_SERVICE_ADDRESS") {
            opts.meta_service_address = v;
        }
        if let Some(v) = parse_env("TRANSFER_ENGINE_LOCAL_PORT") {
            opts.local_port = v;
        }
        if let Some(v) = parse_bool_env("TRANSFER_ENGINE_SERVICE_FIXED_PORT") {
            opts.fixed_port = v;
        }
        if let Some(v) = parse_env("TRANSFER_ENGINE_READ_TIMEOUT_MS") {
            opts.read_timeout_ms = v;
        }
        if let Some(v) = parse_env("TRANSFER_ENGINE_WRITE_TIMEOUT_MS") {
            opts.write_timeout_ms = v;
        }
        if let Some(v) = parse_env("TRANSFER_ENGINE_RDMA_NUM_POLLERS") {
            opts.num_pollers = v;
        }
        if let Some(v) = parse_env("TRANSFER_ENGINE_MAX_RDMA_DEVICES") {
            opts.max_rdma_devices = v;
        }
        if let Some(v) = parse_bool_env("TRANSFER_ENGINE_ENABLE_NUMA_ALLOCATION") {
            opts.enable_numa_allocation = v;
        }
        if let Some(v) = parse_bool_env("TRANSFER_ENGINE_ENABLE_PERF_METRICS") {
            opts.enable_perf_metrics = v;
        }
        if let Some(v) = parse_env("TRANSFER_ENGINE_PERF_STATS_INTERVAL_MS") {
            opts.perf_stats_interval_ms = v;
        }
        if let Some(v) = parse_env("TRANSPORT_SEND_RETRY_COUNT") {
            opts.send_retry_count = v;
        }
        if let Some(v) = parse_env("TRANSPORT_SEND_RETRY_SLEEP_MS") {
            opts.send_retry_sleep_ms = v;
        }
        if let Some(v) = parse_env("TRANSPORT_RECEIVE_RETRY_COUNT") {
            opts.receive_retry_count = v;
        }
        if let Some(v) = parse_env("TRANSPORT_RECEIVE_RETRY_SLEEP_MS") {
            opts.receive_retry_sleep_ms = v;
        }

        opts
    }
}

/// Role placement of this process within its parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelConfig {
    pub role_rank: u32,
    pub role_size: u32,
}

impl ParallelConfig {
    pub fn new(role_rank: u32, role_size: u32) -> Self {
        Self {
            role_rank,
            role_size,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn parse_bool_env(key: &str) -> Option<bool> {
    let v = std::env::var(key).ok()?;
    match v.trim() {
        "1" | "true" | "TRUE" | "True" => Some(true),
        "0" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Options::default();
        assert_eq!(opts.read_timeout_ms, -1);
        assert_eq!(opts.write_timeout_ms, -1);
        assert!(!opts.fixed_port);
        assert_eq!(opts.perf_stats_interval_ms, 500);
        assert!(!opts.enable_perf_metrics);
    }

    #[test]
    fn test_from_env_overrides() {
        // Process-global env: use keys no other test touches.
        std::env::set_var("TRANSFER_ENGINE_LOCAL_PORT", "19001");
        std::env::set_var("TRANSFER_ENGINE_SERVICE_FIXED_PORT", "true");
        std::env::set_var("TRANSPORT_SEND_RETRY_COUNT", " 5 ");
        let opts = Options::from_env();
        std::env::remove_var("TRANSFER_ENGINE_LOCAL_PORT");
        std::env::remove_var("TRANSFER_ENGINE_SERVICE_FIXED_PORT");
        std::env::remove_var("TRANSPORT_SEND_RETRY_COUNT");

        assert_eq!(opts.local_port, 19001);
        assert!(opts.fixed_port);
        assert_eq!(opts.send_retry_count, 5);
    }

    #[test]
    fn test_parse_bool_variants() {
        std::env::set_var("TRANSFER_ENGINE_ENABLE_PERF_METRICS", "0");
        assert_eq!(parse_bool_env("TRANSFER_ENGINE_ENABLE_PERF_METRICS"), Some(false));
        std::env::set_var("TRANSFER_ENGINE_ENABLE_PERF_METRICS", "bogus");
        assert_eq!(parse_bool_env("TRANSFER_ENGINE_ENABLE_PERF_METRICS"), None);
        std::env::remove_var("TRANSFER_ENGINE_ENABLE_PERF_METRICS");
    }
}
