//! Domain enumeration
//!
//! [`list_domains`] snapshots every domain the hypervisor knows about at the
//! start of a scrape. Each [`DomainHandle`] caches its name and UUID, and
//! memoizes the state record and the parsed descriptor for the duration of
//! the scrape, so collectors sharing a domain do not repeat those calls.
//!
//! Handles are released when the last reference is dropped, which happens
//! once every collector unit of the scrape has finished with them.

use crate::connection::Session;
use crate::error::{ApiError, ApiResult, ScrapeError};
use crate::hypervisor::descriptor::DomainDescriptor;
use crate::hypervisor::{Domain, DomainInfo, DomainState};
use crate::observability::ExporterState;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Label names shared by all per-domain metric families
pub const DOMAIN_LABELS: &[&str] = &["domain", "uuid"];

/// One domain visible in the current scrape
pub struct DomainHandle {
    name: String,
    uuid: String,
    api: Box<dyn Domain>,
    info: OnceLock<ApiResult<DomainInfo>>,
    descriptor: OnceLock<ApiResult<Arc<DomainDescriptor>>>,
    state: Arc<ExporterState>,
}

impl std::fmt::Debug for DomainHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainHandle")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .finish()
    }
}

impl DomainHandle {
    pub fn new(api: Box<dyn Domain>, state: Arc<ExporterState>) -> ApiResult<Self> {
        let name = api.name()?;
        let uuid = api.uuid()?;
        Ok(Self {
            name,
            uuid,
            api,
            info: OnceLock::new(),
            descriptor: OnceLock::new(),
            state,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// `[name, uuid]`, in [`DOMAIN_LABELS`] order
    pub fn labels(&self) -> [&str; 2] {
        [&self.name, &self.uuid]
    }

    /// Raw API handle for collector-specific queries
    pub fn api(&self) -> &dyn Domain {
        self.api.as_ref()
    }

    /// State record, fetched at most once per scrape
    pub fn info(&self) -> ApiResult<DomainInfo> {
        self.info.get_or_init(|| self.api.info()).clone()
    }

    /// Whether detailed statistics should be collected
    pub fn is_running(&self) -> ApiResult<bool> {
        Ok(self.info()?.state == DomainState::Running)
    }

    /// Parsed descriptor, fetched and parsed at most once per scrape
    pub fn descriptor(&self) -> ApiResult<Arc<DomainDescriptor>> {
        let mut fetched = false;
        let result = self.descriptor.get_or_init(|| {
            fetched = true;
            self.api
                .xml_desc()
                .and_then(|xml| DomainDescriptor::parse(&xml))
                .map(Arc::new)
        });

        if fetched {
            self.state.record_cache_miss();
        } else {
            self.state.record_cache_hit();
        }
        result.clone()
    }
}

/// All domains of one scrape, in the order the hypervisor listed them
#[derive(Debug, Default)]
pub struct DomainSet {
    domains: Vec<Arc<DomainHandle>>,
}

impl DomainSet {
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DomainHandle>> {
        self.domains.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<DomainHandle>> {
        self.domains.iter().find(|d| d.name() == name)
    }
}

/// Enumerate active and inactive domains. Blocks on the API.
///
/// Domains whose name or UUID cannot be read are skipped; their handles are
/// released immediately.
pub fn list_domains(
    session: &Session,
    state: Arc<ExporterState>,
) -> Result<DomainSet, ScrapeError> {
    let raw = session
        .connection()
        .list_all_domains()
        .map_err(ScrapeError::EnumerationFailed)?;

    let mut domains = Vec::with_capacity(raw.len());
    for api in raw {
        match DomainHandle::new(api, state.clone()) {
            Ok(handle) => domains.push(Arc::new(handle)),
            Err(e) => log_skipped(&e),
        }
    }

    debug!(count = domains.len(), "Enumerated domains");
    Ok(DomainSet { domains })
}

fn log_skipped(err: &ApiError) {
    if err.is_domain_gone() {
        debug!(error = %err, "Domain vanished during enumeration");
    } else {
        warn!(error = %err, "Skipping domain without readable identity");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::Connector;
    use crate::testing::{FakeDomainSpec, FakeHypervisor};

    async fn session_for(hv: &FakeHypervisor) -> Session {
        let conn = hv.connector().connect("test:///default").await.unwrap();
        Session::new(conn, 1)
    }

    #[tokio::test]
    async fn test_list_domains_keeps_order_and_identity() {
        let hv = FakeHypervisor::with_domains(vec![
            FakeDomainSpec::running("alpha"),
            FakeDomainSpec::stopped("beta"),
        ]);
        let session = session_for(&hv).await;

        let set = list_domains(&session, Arc::new(ExporterState::new())).unwrap();
        let names: Vec<_> = set.iter().map(|d| d.name().to_string()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        let alpha = set.get("alpha").unwrap();
        assert_eq!(alpha.uuid(), crate::testing::uuid_for("alpha"));
        assert!(alpha.is_running().unwrap());
        assert!(!set.get("beta").unwrap().is_running().unwrap());
    }

    #[tokio::test]
    async fn test_unnamed_domain_is_skipped_and_released() {
        let hv = FakeHypervisor::with_domains(vec![
            FakeDomainSpec::running("alpha"),
            FakeDomainSpec::running("ghost").unnamed(),
        ]);
        let session = session_for(&hv).await;

        let set = list_domains(&session, Arc::new(ExporterState::new())).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(hv.handles_released(), 1);

        drop(set);
        assert_eq!(hv.handles_created(), 2);
        assert_eq!(hv.handles_released(), 2);
    }

    #[tokio::test]
    async fn test_descriptor_is_memoized() {
        let hv = FakeHypervisor::with_domains(vec![FakeDomainSpec::running("alpha")
            .with_disk("vda", Default::default())]);
        let session = session_for(&hv).await;
        let state = Arc::new(ExporterState::new());

        let set = list_domains(&session, state.clone()).unwrap();
        let alpha = set.get("alpha").unwrap();
        let first = alpha.descriptor().unwrap();
        let second = alpha.descriptor().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.disk_targets(), vec!["vda"]);
        let snap = state.snapshot();
        assert_eq!(snap.cache_misses_total, 1);
        assert_eq!(snap.cache_hits_total, 1);
    }

    #[tokio::test]
    async fn test_enumeration_failure() {
        let hv = FakeHypervisor::new();
        hv.fail_enumeration(Some(ApiError::other("rpc timeout")));
        let session = session_for(&hv).await;

        let err = list_domains(&session, Arc::new(ExporterState::new())).unwrap_err();
        assert!(matches!(err, ScrapeError::EnumerationFailed(_)));
    }
}
