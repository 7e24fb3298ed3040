//! libvirt backend
//!
//! Thin adapter from the `virt` bindings to the [`Connection`] and [`Domain`]
//! traits. Every call blocks on the libvirt C library.

use super::descriptor::PoolDescriptor;
use super::{
    pool_state_name, BlockInfo, BlockStats, Connection, Connector, CpuStats, Domain, DomainInfo,
    DomainState, HostInterfaceStats, InterfaceStats, JobInfo, JobType, MemoryStat,
    MemoryStatTag, NetworkInfo, NodeInfo, StoragePoolInfo,
};
use crate::error::{ApiError, ApiErrorCode, ApiResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;
use virt::connect::Connect;
use virt::domain::JobStats;
use virt::error::ErrorNumber;
use virt::sys;

/// Directory where the QEMU driver keeps per-domain pid files
const QEMU_RUN_DIR: &str = "/run/libvirt/qemu";

const SYSFS_NET: &str = "/sys/class/net";

impl From<virt::error::Error> for ApiError {
    fn from(err: virt::error::Error) -> Self {
        let code = match err.code() {
            ErrorNumber::OperationInvalid => ApiErrorCode::OperationInvalid,
            ErrorNumber::NoDomain => ApiErrorCode::NoDomain,
            ErrorNumber::NoSupport => ApiErrorCode::NoSupport,
            ErrorNumber::InvalidArg => ApiErrorCode::InvalidArgument,
            ErrorNumber::InvalidConn | ErrorNumber::NoConnect => ApiErrorCode::NoConnection,
            _ => ApiErrorCode::Other,
        };
        ApiError::new(code, err.to_string())
    }
}

/// Opens libvirt connections on the blocking pool
#[derive(Debug, Default, Clone)]
pub struct LibvirtConnector;

#[async_trait]
impl Connector for LibvirtConnector {
    async fn connect(&self, uri: &str) -> ApiResult<Arc<dyn Connection>> {
        let uri = uri.to_string();
        let joined = tokio::task::spawn_blocking(move || {
            let conn = Connect::open(Some(&uri))?;
            Ok::<_, ApiError>(Arc::new(LibvirtConnection::new(uri, conn)) as Arc<dyn Connection>)
        })
        .await;

        joined.map_err(|e| ApiError::no_connection(format!("connect task failed: {e}")))?
    }
}

pub struct LibvirtConnection {
    uri: String,
    local: bool,
    // `None` once closed
    conn: RwLock<Option<Connect>>,
}

impl LibvirtConnection {
    fn new(uri: String, conn: Connect) -> Self {
        let local = is_local_uri(&uri);
        Self {
            uri,
            local,
            conn: RwLock::new(Some(conn)),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connect) -> ApiResult<T>) -> ApiResult<T> {
        let guard = self
            .conn
            .read()
            .map_err(|_| ApiError::no_connection("connection lock poisoned"))?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(ApiError::no_connection("connection is closed")),
        }
    }
}

impl Connection for LibvirtConnection {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn is_alive(&self) -> ApiResult<bool> {
        self.with_conn(|c| Ok(c.is_alive()?))
    }

    fn close(&self) -> ApiResult<()> {
        let mut guard = self
            .conn
            .write()
            .map_err(|_| ApiError::no_connection("connection lock poisoned"))?;
        if let Some(mut conn) = guard.take() {
            conn.close()?;
        }
        Ok(())
    }

    fn list_all_domains(&self) -> ApiResult<Vec<Box<dyn Domain>>> {
        let local = self.local;
        self.with_conn(|c| {
            let flags =
                sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;
            let domains = c.list_all_domains(flags)?;
            Ok(domains
                .into_iter()
                .map(|dom| Box::new(LibvirtDomain { dom, local }) as Box<dyn Domain>)
                .collect())
        })
    }

    fn hostname(&self) -> ApiResult<String> {
        self.with_conn(|c| Ok(c.get_hostname()?))
    }

    fn driver_type(&self) -> ApiResult<String> {
        self.with_conn(|c| Ok(c.get_type()?))
    }

    fn lib_version(&self) -> ApiResult<u64> {
        self.with_conn(|c| Ok(u64::from(c.get_lib_version()?)))
    }

    fn hypervisor_version(&self) -> ApiResult<u64> {
        self.with_conn(|c| Ok(u64::from(c.get_hyp_version()?)))
    }

    fn node_info(&self) -> ApiResult<NodeInfo> {
        self.with_conn(|c| {
            let info = c.get_node_info()?;
            Ok(NodeInfo {
                model: info.model,
                memory_kib: info.memory,
                cpus: info.cpus,
                mhz: info.mhz,
            })
        })
    }

    fn free_memory(&self) -> ApiResult<u64> {
        self.with_conn(|c| Ok(c.get_free_memory()?))
    }

    fn num_active_domains(&self) -> ApiResult<u32> {
        self.with_conn(|c| Ok(c.num_of_domains()?))
    }

    fn num_inactive_domains(&self) -> ApiResult<u32> {
        self.with_conn(|c| Ok(c.num_of_defined_domains()?))
    }

    fn capabilities(&self) -> ApiResult<String> {
        self.with_conn(|c| Ok(c.get_capabilities()?))
    }

    fn storage_pools(&self) -> ApiResult<Vec<StoragePoolInfo>> {
        self.with_conn(|c| {
            let pools = c.list_all_storage_pools(0)?;
            let mut out = Vec::with_capacity(pools.len());
            for pool in pools {
                let name = pool.get_name()?;
                let info = pool.get_info()?;
                let volumes = pool.num_of_volumes().unwrap_or(0);
                let pool_type = pool
                    .get_xml_desc(0)
                    .map_err(ApiError::from)
                    .and_then(|xml| PoolDescriptor::parse(&xml))
                    .map(|d| d.pool_type)
                    .unwrap_or_default();
                out.push(StoragePoolInfo {
                    name,
                    pool_type,
                    state: pool_state_name(info.state).to_string(),
                    capacity: info.capacity,
                    allocation: info.allocation,
                    available: info.available,
                    volumes,
                });
            }
            Ok(out)
        })
    }

    fn networks(&self) -> ApiResult<Vec<NetworkInfo>> {
        self.with_conn(|c| {
            let networks = c.list_all_networks(0)?;
            let mut out = Vec::with_capacity(networks.len());
            for net in networks {
                out.push(NetworkInfo {
                    name: net.get_name()?,
                    bridge: net.get_bridge_name().unwrap_or_default(),
                    active: net.is_active()?,
                });
            }
            Ok(out)
        })
    }

    fn host_interfaces(&self) -> ApiResult<Vec<HostInterfaceStats>> {
        if !self.local {
            return Err(ApiError::no_support(
                "host interface counters are only available on local connections",
            ));
        }
        self.with_conn(|c| {
            let interfaces = c.list_all_interfaces(sys::VIR_CONNECT_LIST_INTERFACES_ACTIVE)?;
            let mut out = Vec::with_capacity(interfaces.len());
            for iface in interfaces {
                let name = iface.get_name()?;
                let stats_dir = Path::new(SYSFS_NET).join(&name).join("statistics");
                out.push(HostInterfaceStats {
                    rx_bytes: read_counter(&stats_dir, "rx_bytes"),
                    rx_packets: read_counter(&stats_dir, "rx_packets"),
                    tx_bytes: read_counter(&stats_dir, "tx_bytes"),
                    tx_packets: read_counter(&stats_dir, "tx_packets"),
                    name,
                });
            }
            Ok(out)
        })
    }
}

pub struct LibvirtDomain {
    dom: virt::domain::Domain,
    local: bool,
}

impl Domain for LibvirtDomain {
    fn name(&self) -> ApiResult<String> {
        Ok(self.dom.get_name()?)
    }

    fn uuid(&self) -> ApiResult<String> {
        Ok(self.dom.get_uuid_string()?)
    }

    fn info(&self) -> ApiResult<DomainInfo> {
        let info = self.dom.get_info()?;
        Ok(DomainInfo {
            state: DomainState::from_code(info.state as u32),
            max_memory_kib: info.max_mem,
            memory_kib: info.memory,
            vcpus: info.nr_virt_cpu,
            cpu_time_ns: info.cpu_time,
        })
    }

    fn is_persistent(&self) -> ApiResult<bool> {
        Ok(self.dom.is_persistent()?)
    }

    fn autostart(&self) -> ApiResult<bool> {
        Ok(self.dom.get_autostart()?)
    }

    fn has_managed_save(&self) -> ApiResult<bool> {
        Ok(self.dom.has_managed_save(0)?)
    }

    fn boot_time(&self) -> ApiResult<i64> {
        if !self.local {
            return Err(ApiError::no_support("boot time requires a local connection"));
        }
        let name = self.dom.get_name()?;
        let pid_file = PathBuf::from(QEMU_RUN_DIR).join(format!("{name}.pid"));
        let modified = std::fs::metadata(&pid_file)
            .and_then(|m| m.modified())
            .map_err(|e| ApiError::no_support(format!("{}: {e}", pid_file.display())))?;
        Ok(chrono::DateTime::<chrono::Utc>::from(modified).timestamp())
    }

    fn max_vcpus(&self) -> ApiResult<u32> {
        Ok(self.dom.get_max_vcpus()? as u32)
    }

    fn current_vcpus(&self) -> ApiResult<u32> {
        Ok(self.dom.get_vcpus_flags(sys::VIR_DOMAIN_VCPU_LIVE)?)
    }

    fn scheduler_type(&self) -> ApiResult<String> {
        Ok(self.dom.get_scheduler_type()?.0)
    }

    fn cpu_stats(&self) -> ApiResult<CpuStats> {
        // the bindings expose no typed-parameter CPU stats call
        Err(ApiError::no_support("per-domain CPU time split is not available"))
    }

    fn memory_stats(&self) -> ApiResult<Vec<MemoryStat>> {
        let stats = self.dom.memory_stats(0)?;
        Ok(stats
            .into_iter()
            .map(|s| MemoryStat {
                tag: MemoryStatTag::from_code(s.tag),
                value: s.val,
            })
            .collect())
    }

    fn block_stats(&self, device: &str) -> ApiResult<BlockStats> {
        let stats = self.dom.get_block_stats(device)?;
        Ok(BlockStats {
            rd_req: stats.rd_req,
            rd_bytes: stats.rd_bytes,
            wr_req: stats.wr_req,
            wr_bytes: stats.wr_bytes,
            errs: stats.errs,
        })
    }

    fn block_info(&self, device: &str) -> ApiResult<BlockInfo> {
        let info = self.dom.get_block_info(device, 0)?;
        Ok(BlockInfo {
            capacity: info.capacity,
            allocation: info.allocation,
            physical: info.physical,
        })
    }

    fn interface_stats(&self, interface: &str) -> ApiResult<InterfaceStats> {
        let stats = self.dom.interface_stats(interface)?;
        Ok(InterfaceStats {
            rx_bytes: stats.rx_bytes,
            rx_packets: stats.rx_packets,
            rx_errs: stats.rx_errs,
            rx_drop: stats.rx_drop,
            tx_bytes: stats.tx_bytes,
            tx_packets: stats.tx_packets,
            tx_errs: stats.tx_errs,
            tx_drop: stats.tx_drop,
        })
    }

    fn xml_desc(&self) -> ApiResult<String> {
        Ok(self.dom.get_xml_desc(0)?)
    }

    fn snapshot_count(&self) -> ApiResult<u32> {
        Ok(self.dom.list_all_snapshots(0)?.len() as u32)
    }

    fn job_info(&self) -> ApiResult<JobInfo> {
        Ok(JobInfo::from(self.dom.get_job_info()?))
    }
}

// fields the driver does not report count as 0
impl From<JobStats> for JobInfo {
    fn from(job: JobStats) -> Self {
        JobInfo {
            job_type: JobType::from_code(job.r#type),
            data_total: job.data_total.unwrap_or(0),
            data_processed: job.data_processed.unwrap_or(0),
            data_remaining: job.data_remaining.unwrap_or(0),
        }
    }
}

/// Whether the URI addresses the hypervisor on this host
pub fn is_local_uri(uri: &str) -> bool {
    match url::Url::parse(uri) {
        Ok(parsed) => parsed.host_str().map_or(true, str::is_empty),
        Err(e) => {
            debug!(uri, error = %e, "Could not parse connection URI, assuming remote");
            false
        }
    }
}

fn read_counter(dir: &Path, name: &str) -> u64 {
    std::fs::read_to_string(dir.join(name))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_uri_detection() {
        assert!(is_local_uri("qemu:///system"));
        assert!(is_local_uri("qemu:///session"));
        assert!(!is_local_uri("qemu+ssh://root@hv01/system"));
        assert!(!is_local_uri("qemu+tcp://10.0.0.5/system"));
    }

    #[test]
    fn test_job_info_missing_fields_are_zero() {
        let job = JobInfo::from(JobStats {
            r#type: 2,
            data_total: Some(4096),
            ..JobStats::default()
        });
        assert_eq!(job.job_type, JobType::Unbounded);
        assert_eq!(job.data_total, 4096);
        assert_eq!(job.data_processed, 0);
        assert_eq!(job.data_remaining, 0);

        let idle = JobInfo::from(JobStats::default());
        assert!(!idle.job_type.is_active());
        assert_eq!(idle.data_total, 0);
    }
}
