//! In-memory management API for tests
//!
//! [`FakeHypervisor`] implements [`Connector`], [`Connection`] and [`Domain`]
//! over scripted domain specs, with knobs for the failure modes the engine
//! has to survive: refused connects, dropped connections, failing or slow
//! calls, domains that stop mid-scrape. It also counts connects, closes and
//! domain handle releases so tests can check resource discipline.

use crate::error::{ApiError, ApiErrorCode, ApiResult};
use crate::hypervisor::{
    BlockInfo, BlockStats, Connection, Connector, CpuStats, Domain, DomainInfo, DomainState,
    HostInterfaceStats, InterfaceStats, JobInfo, MemoryStat, MemoryStatTag, NetworkInfo,
    NodeInfo, StoragePoolInfo,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How the fake answers descriptor requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeDescriptor {
    /// Built from the declared disks and interfaces
    Generated,
    /// Returned verbatim
    Custom(String),
    /// Descriptor call fails
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct FakeDisk {
    pub name: String,
    pub stats: BlockStats,
    pub info: Option<BlockInfo>,
}

/// Scripted state of one domain
#[derive(Debug, Clone)]
pub struct FakeDomainSpec {
    pub name: String,
    pub uuid: String,
    pub info: DomainInfo,
    pub persistent: bool,
    pub autostart: bool,
    pub managed_save: bool,
    pub boot_time: Option<i64>,
    pub max_vcpus: u32,
    pub current_vcpus: u32,
    pub scheduler: String,
    pub cpu_stats: CpuStats,
    pub memory_stats: Vec<MemoryStat>,
    pub disks: Vec<FakeDisk>,
    pub interfaces: Vec<(String, InterfaceStats)>,
    pub hostdevs: Vec<String>,
    pub tpm: bool,
    pub rng: bool,
    pub descriptor: FakeDescriptor,
    pub snapshots: u32,
    pub job: JobInfo,
    /// Operations that fail with a generic error
    pub failing: HashSet<&'static str>,
    /// Detailed queries fail as if the domain stopped after the state check
    pub stops_mid_scrape: bool,
    /// Added to every detailed query
    pub delay: Option<Duration>,
    /// Name lookup fails
    pub unnamed: bool,
}

impl FakeDomainSpec {
    pub fn running(name: &str) -> Self {
        Self {
            name: name.to_string(),
            uuid: uuid_for(name),
            info: DomainInfo {
                state: DomainState::Running,
                max_memory_kib: 2_097_152,
                memory_kib: 2_097_152,
                vcpus: 2,
                cpu_time_ns: 1_500_000_000,
            },
            persistent: true,
            autostart: false,
            managed_save: false,
            boot_time: Some(1_700_000_000),
            max_vcpus: 4,
            current_vcpus: 2,
            scheduler: "posix".to_string(),
            cpu_stats: CpuStats {
                user_time_ns: 900_000_000,
                system_time_ns: 300_000_000,
            },
            memory_stats: vec![
                MemoryStat {
                    tag: MemoryStatTag::ActualBalloon,
                    value: 2_097_152,
                },
                MemoryStat {
                    tag: MemoryStatTag::Rss,
                    value: 1_048_576,
                },
                MemoryStat {
                    tag: MemoryStatTag::Unused,
                    value: 524_288,
                },
                MemoryStat {
                    tag: MemoryStatTag::Available,
                    value: 2_000_000,
                },
                MemoryStat {
                    tag: MemoryStatTag::MajorFault,
                    value: 12,
                },
            ],
            disks: Vec::new(),
            interfaces: Vec::new(),
            hostdevs: Vec::new(),
            tpm: false,
            rng: false,
            descriptor: FakeDescriptor::Generated,
            snapshots: 0,
            job: JobInfo::default(),
            failing: HashSet::new(),
            stops_mid_scrape: false,
            delay: None,
            unnamed: false,
        }
    }

    pub fn stopped(name: &str) -> Self {
        let mut spec = Self::running(name);
        spec.info.state = DomainState::Shutoff;
        spec.info.memory_kib = 0;
        spec.info.cpu_time_ns = 0;
        spec.current_vcpus = 0;
        spec.boot_time = None;
        spec
    }

    pub fn with_state(mut self, state: DomainState) -> Self {
        self.info.state = state;
        self
    }

    pub fn with_disk(mut self, name: &str, stats: BlockStats) -> Self {
        self.disks.push(FakeDisk {
            name: name.to_string(),
            stats,
            info: Some(BlockInfo {
                capacity: 10 * 1024 * 1024 * 1024,
                allocation: 2 * 1024 * 1024 * 1024,
                physical: 2 * 1024 * 1024 * 1024,
            }),
        });
        self
    }

    pub fn with_interface(mut self, name: &str, stats: InterfaceStats) -> Self {
        self.interfaces.push((name.to_string(), stats));
        self
    }

    pub fn with_memory_stats(mut self, stats: Vec<MemoryStat>) -> Self {
        self.memory_stats = stats;
        self
    }

    pub fn with_descriptor(mut self, xml: &str) -> Self {
        self.descriptor = FakeDescriptor::Custom(xml.to_string());
        self
    }

    pub fn without_descriptor(mut self) -> Self {
        self.descriptor = FakeDescriptor::Unavailable;
        self
    }

    pub fn with_hostdev(mut self, hostdev_type: &str) -> Self {
        self.hostdevs.push(hostdev_type.to_string());
        self
    }

    pub fn with_tpm(mut self) -> Self {
        self.tpm = true;
        self
    }

    pub fn with_rng(mut self) -> Self {
        self.rng = true;
        self
    }

    pub fn with_snapshots(mut self, count: u32) -> Self {
        self.snapshots = count;
        self
    }

    pub fn with_job(mut self, job: JobInfo) -> Self {
        self.job = job;
        self
    }

    pub fn failing(mut self, operation: &'static str) -> Self {
        self.failing.insert(operation);
        self
    }

    pub fn stopping_mid_scrape(mut self) -> Self {
        self.stops_mid_scrape = true;
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn unnamed(mut self) -> Self {
        self.unnamed = true;
        self
    }

    fn generated_xml(&self) -> String {
        let mut xml = format!(
            "<domain type='kvm'><name>{}</name><uuid>{}</uuid><devices>",
            self.name, self.uuid
        );
        for disk in &self.disks {
            let _ = write!(
                xml,
                "<disk type='file' device='disk'><target dev='{}' bus='virtio'/></disk>",
                disk.name
            );
        }
        for (iface, _) in &self.interfaces {
            let _ = write!(
                xml,
                "<interface type='network'><target dev='{iface}'/></interface>"
            );
        }
        if self.tpm {
            xml.push_str("<tpm model='tpm-crb'/>");
        }
        for kind in &self.hostdevs {
            let _ = write!(xml, "<hostdev mode='subsystem' type='{kind}'/>");
        }
        if self.rng {
            xml.push_str("<rng model='virtio'/>");
        }
        xml.push_str("</devices></domain>");
        xml
    }
}

/// Host-level answers
#[derive(Debug, Clone)]
pub struct FakeHost {
    pub hostname: String,
    pub driver: String,
    pub lib_version: u64,
    pub hypervisor_version: u64,
    pub node: NodeInfo,
    pub free_memory: u64,
    pub capabilities: String,
    pub pools: Vec<StoragePoolInfo>,
    pub networks: Vec<NetworkInfo>,
    pub interfaces: Vec<HostInterfaceStats>,
    pub failing: HashSet<&'static str>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            hostname: "hv01".to_string(),
            driver: "QEMU".to_string(),
            lib_version: 9_000_000,
            hypervisor_version: 8_002_001,
            node: NodeInfo {
                model: "x86_64".to_string(),
                memory_kib: 16_384_000,
                cpus: 8,
                mhz: 2400,
            },
            free_memory: 8 * 1024 * 1024 * 1024,
            capabilities: "<capabilities><host><cpu><arch>x86_64</arch>\
                           <model>Skylake</model></cpu></host></capabilities>"
                .to_string(),
            pools: vec![StoragePoolInfo {
                name: "default".to_string(),
                pool_type: "dir".to_string(),
                state: "running".to_string(),
                capacity: 100 * 1024 * 1024 * 1024,
                allocation: 40 * 1024 * 1024 * 1024,
                available: 60 * 1024 * 1024 * 1024,
                volumes: 3,
            }],
            networks: vec![NetworkInfo {
                name: "default".to_string(),
                bridge: "virbr0".to_string(),
                active: true,
            }],
            interfaces: vec![HostInterfaceStats {
                name: "eth0".to_string(),
                rx_bytes: 1000,
                rx_packets: 10,
                tx_bytes: 2000,
                tx_packets: 20,
            }],
            failing: HashSet::new(),
        }
    }
}

#[derive(Default)]
struct Inner {
    domains: Mutex<Vec<FakeDomainSpec>>,
    host: Mutex<FakeHost>,
    enumeration_error: Mutex<Option<ApiError>>,
    epoch: AtomicU64,
    connect_failures: AtomicU32,
    connects: AtomicU32,
    closes: AtomicU32,
    handles_created: AtomicUsize,
    handles_released: AtomicUsize,
    host_calls: AtomicUsize,
    probes: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Scriptable hypervisor shared by all connections it hands out
#[derive(Clone, Default)]
pub struct FakeHypervisor {
    inner: Arc<Inner>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domains(domains: Vec<FakeDomainSpec>) -> Self {
        let hv = Self::new();
        *lock(&hv.inner.domains) = domains;
        hv
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            inner: self.inner.clone(),
        })
    }

    pub fn add_domain(&self, spec: FakeDomainSpec) {
        lock(&self.inner.domains).push(spec);
    }

    pub fn remove_domain(&self, name: &str) {
        lock(&self.inner.domains).retain(|d| d.name != name);
    }

    pub fn update_domain(&self, name: &str, f: impl FnOnce(&mut FakeDomainSpec)) {
        if let Some(spec) = lock(&self.inner.domains).iter_mut().find(|d| d.name == name) {
            f(spec);
        }
    }

    pub fn update_host(&self, f: impl FnOnce(&mut FakeHost)) {
        f(&mut lock(&self.inner.host));
    }

    /// Refuse the next `count` connect calls
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Kill every connection handed out so far
    pub fn drop_connections(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn fail_enumeration(&self, error: Option<ApiError>) {
        *lock(&self.inner.enumeration_error) = error;
    }

    pub fn connect_count(&self) -> u32 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u32 {
        self.inner.closes.load(Ordering::SeqCst)
    }

    pub fn handles_created(&self) -> usize {
        self.inner.handles_created.load(Ordering::SeqCst)
    }

    pub fn handles_released(&self) -> usize {
        self.inner.handles_released.load(Ordering::SeqCst)
    }

    /// Number of host-level API calls (hostname, node info, pools, ...)
    pub fn host_calls(&self) -> usize {
        self.inner.host_calls.load(Ordering::SeqCst)
    }

    /// Devices probed with stats calls, as `domain:device`
    pub fn probes(&self) -> Vec<String> {
        lock(&self.inner.probes).clone()
    }
}

struct FakeConnector {
    inner: Arc<Inner>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, uri: &str) -> ApiResult<Arc<dyn Connection>> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .inner
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ApiError::no_connection(format!(
                "Failed to connect socket for {uri}: Connection refused"
            )));
        }

        Ok(Arc::new(FakeConnection {
            uri: uri.to_string(),
            epoch: self.inner.epoch.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
            inner: self.inner.clone(),
        }))
    }
}

struct FakeConnection {
    uri: String,
    epoch: u64,
    closed: AtomicBool,
    inner: Arc<Inner>,
}

impl FakeConnection {
    fn check_open(&self) -> ApiResult<()> {
        let stale = self.inner.epoch.load(Ordering::SeqCst) != self.epoch;
        if self.closed.load(Ordering::SeqCst) || stale {
            return Err(ApiError::no_connection("client socket is closed"));
        }
        Ok(())
    }

    fn host_call<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&FakeHost) -> T,
    ) -> ApiResult<T> {
        self.check_open()?;
        self.inner.host_calls.fetch_add(1, Ordering::SeqCst);
        let host = lock(&self.inner.host);
        if host.failing.contains(operation) {
            return Err(ApiError::other(format!("{operation}: internal error")));
        }
        Ok(f(&host))
    }
}

impl Connection for FakeConnection {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn is_alive(&self) -> ApiResult<bool> {
        Ok(self.check_open().is_ok())
    }

    fn close(&self) -> ApiResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn list_all_domains(&self) -> ApiResult<Vec<Box<dyn Domain>>> {
        self.check_open()?;
        if let Some(err) = lock(&self.inner.enumeration_error).clone() {
            return Err(err);
        }
        let specs = lock(&self.inner.domains).clone();
        Ok(specs
            .into_iter()
            .map(|spec| {
                self.inner.handles_created.fetch_add(1, Ordering::SeqCst);
                Box::new(FakeDomain {
                    spec,
                    inner: self.inner.clone(),
                }) as Box<dyn Domain>
            })
            .collect())
    }

    fn hostname(&self) -> ApiResult<String> {
        self.host_call("hostname", |h| h.hostname.clone())
    }

    fn driver_type(&self) -> ApiResult<String> {
        self.host_call("driver_type", |h| h.driver.clone())
    }

    fn lib_version(&self) -> ApiResult<u64> {
        self.host_call("lib_version", |h| h.lib_version)
    }

    fn hypervisor_version(&self) -> ApiResult<u64> {
        self.host_call("hypervisor_version", |h| h.hypervisor_version)
    }

    fn node_info(&self) -> ApiResult<NodeInfo> {
        self.host_call("node_info", |h| h.node.clone())
    }

    fn free_memory(&self) -> ApiResult<u64> {
        self.host_call("free_memory", |h| h.free_memory)
    }

    fn num_active_domains(&self) -> ApiResult<u32> {
        self.check_open()?;
        let count = lock(&self.inner.domains)
            .iter()
            .filter(|d| d.info.state == DomainState::Running)
            .count();
        Ok(count as u32)
    }

    fn num_inactive_domains(&self) -> ApiResult<u32> {
        self.check_open()?;
        let count = lock(&self.inner.domains)
            .iter()
            .filter(|d| d.info.state != DomainState::Running)
            .count();
        Ok(count as u32)
    }

    fn capabilities(&self) -> ApiResult<String> {
        self.host_call("capabilities", |h| h.capabilities.clone())
    }

    fn storage_pools(&self) -> ApiResult<Vec<StoragePoolInfo>> {
        self.host_call("storage_pools", |h| h.pools.clone())
    }

    fn networks(&self) -> ApiResult<Vec<NetworkInfo>> {
        self.host_call("networks", |h| h.networks.clone())
    }

    fn host_interfaces(&self) -> ApiResult<Vec<HostInterfaceStats>> {
        self.host_call("host_interfaces", |h| h.interfaces.clone())
    }
}

struct FakeDomain {
    spec: FakeDomainSpec,
    inner: Arc<Inner>,
}

impl Drop for FakeDomain {
    fn drop(&mut self) {
        self.inner.handles_released.fetch_add(1, Ordering::SeqCst);
    }
}

impl FakeDomain {
    /// Common gate for detailed queries
    fn query(&self, operation: &'static str) -> ApiResult<()> {
        if let Some(delay) = self.spec.delay {
            std::thread::sleep(delay);
        }
        if self.spec.stops_mid_scrape {
            return Err(ApiError::operation_invalid("domain is not running"));
        }
        if self.spec.failing.contains(operation) {
            return Err(ApiError::other(format!("{operation}: internal error")));
        }
        Ok(())
    }

    fn record_probe(&self, device: &str) {
        lock(&self.inner.probes).push(format!("{}:{device}", self.spec.name));
    }
}

impl Domain for FakeDomain {
    fn name(&self) -> ApiResult<String> {
        if self.spec.unnamed {
            return Err(ApiError::new(ApiErrorCode::NoDomain, "domain not found"));
        }
        Ok(self.spec.name.clone())
    }

    fn uuid(&self) -> ApiResult<String> {
        Ok(self.spec.uuid.clone())
    }

    fn info(&self) -> ApiResult<DomainInfo> {
        if self.spec.failing.contains("info") {
            return Err(ApiError::other("info: internal error"));
        }
        Ok(self.spec.info)
    }

    fn is_persistent(&self) -> ApiResult<bool> {
        if self.spec.failing.contains("is_persistent") {
            return Err(ApiError::other("is_persistent: internal error"));
        }
        Ok(self.spec.persistent)
    }

    fn autostart(&self) -> ApiResult<bool> {
        if self.spec.failing.contains("autostart") {
            return Err(ApiError::other("autostart: internal error"));
        }
        Ok(self.spec.autostart)
    }

    fn has_managed_save(&self) -> ApiResult<bool> {
        Ok(self.spec.managed_save)
    }

    fn boot_time(&self) -> ApiResult<i64> {
        self.query("boot_time")?;
        self.spec
            .boot_time
            .ok_or_else(|| ApiError::no_support("boot time unavailable"))
    }

    fn max_vcpus(&self) -> ApiResult<u32> {
        self.query("max_vcpus")?;
        Ok(self.spec.max_vcpus)
    }

    fn current_vcpus(&self) -> ApiResult<u32> {
        self.query("current_vcpus")?;
        Ok(self.spec.current_vcpus)
    }

    fn scheduler_type(&self) -> ApiResult<String> {
        self.query("scheduler_type")?;
        Ok(self.spec.scheduler.clone())
    }

    fn cpu_stats(&self) -> ApiResult<CpuStats> {
        self.query("cpu_stats")?;
        Ok(self.spec.cpu_stats)
    }

    fn memory_stats(&self) -> ApiResult<Vec<MemoryStat>> {
        self.query("memory_stats")?;
        Ok(self.spec.memory_stats.clone())
    }

    fn block_stats(&self, device: &str) -> ApiResult<BlockStats> {
        self.query("block_stats")?;
        self.record_probe(device);
        self.spec
            .disks
            .iter()
            .find(|d| d.name == device)
            .map(|d| d.stats)
            .ok_or_else(|| {
                ApiError::new(
                    ApiErrorCode::InvalidArgument,
                    format!("invalid argument: invalid path: {device}"),
                )
            })
    }

    fn block_info(&self, device: &str) -> ApiResult<BlockInfo> {
        self.query("block_info")?;
        self.spec
            .disks
            .iter()
            .find(|d| d.name == device)
            .and_then(|d| d.info)
            .ok_or_else(|| ApiError::no_support(format!("no block info for {device}")))
    }

    fn interface_stats(&self, interface: &str) -> ApiResult<InterfaceStats> {
        self.query("interface_stats")?;
        self.record_probe(interface);
        self.spec
            .interfaces
            .iter()
            .find(|(name, _)| name == interface)
            .map(|(_, stats)| *stats)
            .ok_or_else(|| {
                ApiError::new(
                    ApiErrorCode::InvalidArgument,
                    format!(
                        "invalid argument: invalid path, '{interface}' is not a known interface"
                    ),
                )
            })
    }

    fn xml_desc(&self) -> ApiResult<String> {
        self.query("xml_desc")?;
        match &self.spec.descriptor {
            FakeDescriptor::Generated => Ok(self.spec.generated_xml()),
            FakeDescriptor::Custom(xml) => Ok(xml.clone()),
            FakeDescriptor::Unavailable => Err(ApiError::other("descriptor unavailable")),
        }
    }

    fn snapshot_count(&self) -> ApiResult<u32> {
        self.query("snapshot_count")?;
        Ok(self.spec.snapshots)
    }

    fn job_info(&self) -> ApiResult<JobInfo> {
        self.query("job_info")?;
        Ok(self.spec.job)
    }
}

/// Stable, name-derived UUID for scripted domains
pub fn uuid_for(name: &str) -> String {
    // FNV-1a
    let hash = name
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
            (acc ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
        });
    format!(
        "{:08x}-{:04x}-4{:03x}-8{:03x}-{:012x}",
        (hash >> 32) as u32,
        (hash >> 16) as u16,
        hash as u16 & 0x0fff,
        (hash >> 4) as u16 & 0x0fff,
        hash & 0xffff_ffff_ffff
    )
}
