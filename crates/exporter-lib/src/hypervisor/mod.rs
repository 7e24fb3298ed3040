//! Management API abstraction
//!
//! The collection engine talks to the hypervisor only through the traits in
//! this module. The real backend ([`libvirt`], behind the `libvirt` feature)
//! wraps the libvirt C library; the test suites use the in-memory backend in
//! [`crate::testing`].
//!
//! All calls on [`Connection`] and [`Domain`] are blocking. Callers in async
//! context run them on the blocking thread pool.

pub mod descriptor;

#[cfg(feature = "libvirt")]
pub mod libvirt;

use crate::error::ApiResult;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// Opens connections to a hypervisor URI
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &str) -> ApiResult<Arc<dyn Connection>>;
}

/// An open management connection
pub trait Connection: Send + Sync {
    fn uri(&self) -> &str;

    /// Cheap liveness probe
    fn is_alive(&self) -> ApiResult<bool>;

    fn close(&self) -> ApiResult<()>;

    /// All domains, active and inactive
    fn list_all_domains(&self) -> ApiResult<Vec<Box<dyn Domain>>>;

    fn hostname(&self) -> ApiResult<String>;

    /// Driver name, e.g. `QEMU`
    fn driver_type(&self) -> ApiResult<String>;

    /// Library version encoded as `major * 1_000_000 + minor * 1_000 + release`
    fn lib_version(&self) -> ApiResult<u64>;

    /// Hypervisor version, same encoding as [`Connection::lib_version`]
    fn hypervisor_version(&self) -> ApiResult<u64>;

    fn node_info(&self) -> ApiResult<NodeInfo>;

    /// Free host memory in bytes
    fn free_memory(&self) -> ApiResult<u64>;

    fn num_active_domains(&self) -> ApiResult<u32>;

    fn num_inactive_domains(&self) -> ApiResult<u32>;

    /// Host capabilities XML
    fn capabilities(&self) -> ApiResult<String>;

    fn storage_pools(&self) -> ApiResult<Vec<StoragePoolInfo>>;

    fn networks(&self) -> ApiResult<Vec<NetworkInfo>>;

    fn host_interfaces(&self) -> ApiResult<Vec<HostInterfaceStats>>;
}

/// Handle to one domain
///
/// The backend releases the underlying API handle when the value is dropped.
pub trait Domain: Send + Sync {
    fn name(&self) -> ApiResult<String>;

    fn uuid(&self) -> ApiResult<String>;

    fn info(&self) -> ApiResult<DomainInfo>;

    fn is_persistent(&self) -> ApiResult<bool>;

    fn autostart(&self) -> ApiResult<bool>;

    fn has_managed_save(&self) -> ApiResult<bool>;

    /// Boot time as unix seconds
    fn boot_time(&self) -> ApiResult<i64>;

    fn max_vcpus(&self) -> ApiResult<u32>;

    fn current_vcpus(&self) -> ApiResult<u32>;

    fn scheduler_type(&self) -> ApiResult<String>;

    /// Guest CPU time split into user and system time
    fn cpu_stats(&self) -> ApiResult<CpuStats>;

    fn memory_stats(&self) -> ApiResult<Vec<MemoryStat>>;

    fn block_stats(&self, device: &str) -> ApiResult<BlockStats>;

    fn block_info(&self, device: &str) -> ApiResult<BlockInfo>;

    fn interface_stats(&self, interface: &str) -> ApiResult<InterfaceStats>;

    /// Domain XML descriptor
    fn xml_desc(&self) -> ApiResult<String>;

    fn snapshot_count(&self) -> ApiResult<u32>;

    fn job_info(&self) -> ApiResult<JobInfo>;
}

/// Domain lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl DomainState {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Running,
            2 => Self::Blocked,
            3 => Self::Paused,
            4 => Self::Shutdown,
            5 => Self::Shutoff,
            6 => Self::Crashed,
            7 => Self::PmSuspended,
            _ => Self::NoState,
        }
    }

    /// Numeric code as exported in `libvirt_vm_state`
    pub fn code(self) -> u32 {
        match self {
            Self::NoState => 0,
            Self::Running => 1,
            Self::Blocked => 2,
            Self::Paused => 3,
            Self::Shutdown => 4,
            Self::Shutoff => 5,
            Self::Crashed => 6,
            Self::PmSuspended => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoState => "nostate",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
            Self::Shutdown => "shutdown",
            Self::Shutoff => "shutoff",
            Self::Crashed => "crashed",
            Self::PmSuspended => "pmsuspended",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainInfo {
    pub state: DomainState,
    pub max_memory_kib: u64,
    pub memory_kib: u64,
    pub vcpus: u32,
    /// Cumulative CPU time in nanoseconds
    pub cpu_time_ns: u64,
}

/// Cumulative CPU time split, in nanoseconds. Zero means not reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuStats {
    pub user_time_ns: u64,
    pub system_time_ns: u64,
}

/// Balloon driver statistic tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryStatTag {
    SwapIn,
    SwapOut,
    MajorFault,
    MinorFault,
    Unused,
    Available,
    ActualBalloon,
    Rss,
    Usable,
    LastUpdate,
    DiskCaches,
    Unknown(u32),
}

impl MemoryStatTag {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::SwapIn,
            1 => Self::SwapOut,
            2 => Self::MajorFault,
            3 => Self::MinorFault,
            4 => Self::Unused,
            5 => Self::Available,
            6 => Self::ActualBalloon,
            7 => Self::Rss,
            8 => Self::Usable,
            9 => Self::LastUpdate,
            10 => Self::DiskCaches,
            other => Self::Unknown(other),
        }
    }
}

/// One balloon statistic. Sizes are in KiB, faults are counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStat {
    pub tag: MemoryStatTag,
    pub value: u64,
}

/// Block device counters. A value of -1 means the hypervisor does not
/// support that field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockStats {
    pub rd_req: i64,
    pub rd_bytes: i64,
    pub wr_req: i64,
    pub wr_bytes: i64,
    pub errs: i64,
}

/// Block device sizes in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockInfo {
    pub capacity: u64,
    pub allocation: u64,
    pub physical: u64,
}

/// Interface counters. A value of -1 means unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceStats {
    pub rx_bytes: i64,
    pub rx_packets: i64,
    pub rx_errs: i64,
    pub rx_drop: i64,
    pub tx_bytes: i64,
    pub tx_packets: i64,
    pub tx_errs: i64,
    pub tx_drop: i64,
}

/// Background job kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    None,
    Bounded,
    Unbounded,
    Completed,
    Failed,
    Cancelled,
}

impl JobType {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Bounded,
            2 => Self::Unbounded,
            3 => Self::Completed,
            4 => Self::Failed,
            5 => Self::Cancelled,
            _ => Self::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bounded => "bounded",
            Self::Unbounded => "unbounded",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Bounded | Self::Unbounded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobInfo {
    pub job_type: JobType,
    pub data_total: u64,
    pub data_processed: u64,
    pub data_remaining: u64,
}

impl Default for JobInfo {
    fn default() -> Self {
        Self {
            job_type: JobType::None,
            data_total: 0,
            data_processed: 0,
            data_remaining: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeInfo {
    pub model: String,
    pub memory_kib: u64,
    pub cpus: u32,
    pub mhz: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePoolInfo {
    pub name: String,
    /// Pool type from the pool descriptor, e.g. `dir` or `logical`
    pub pool_type: String,
    pub state: String,
    pub capacity: u64,
    pub allocation: u64,
    pub available: u64,
    pub volumes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub name: String,
    pub bridge: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostInterfaceStats {
    pub name: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

/// Storage pool state names by numeric code
pub fn pool_state_name(code: u32) -> &'static str {
    match code {
        0 => "inactive",
        1 => "building",
        2 => "running",
        3 => "degraded",
        4 => "inaccessible",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_state_codes() {
        for code in 0..8 {
            assert_eq!(DomainState::from_code(code).code(), code);
        }
        assert_eq!(DomainState::from_code(42), DomainState::NoState);
        assert_eq!(DomainState::Running.as_str(), "running");
    }

    #[test]
    fn test_memory_stat_tags() {
        assert_eq!(MemoryStatTag::from_code(7), MemoryStatTag::Rss);
        assert_eq!(MemoryStatTag::from_code(10), MemoryStatTag::DiskCaches);
        assert_eq!(MemoryStatTag::from_code(99), MemoryStatTag::Unknown(99));
    }

    #[test]
    fn test_job_type() {
        assert!(JobType::from_code(1).is_active());
        assert!(!JobType::from_code(3).is_active());
        assert_eq!(JobType::from_code(-1), JobType::None);
    }
}
