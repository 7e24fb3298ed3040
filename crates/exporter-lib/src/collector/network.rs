//! Network interface collector (running domains only)

use super::{discover_interfaces, log_skip, require_running, supported, Collector};
use crate::connection::Session;
use crate::domain::DomainHandle;
use crate::error::CollectorError;
use crate::models::{MetricDesc, MetricRecord};

const LABELS: &[&str] = &["domain", "uuid", "interface"];

static RX_BYTES: MetricDesc = MetricDesc::counter(
    "libvirt_vm_network_receive_bytes_total",
    "Bytes received on the interface",
    LABELS,
);
static RX_PACKETS: MetricDesc = MetricDesc::counter(
    "libvirt_vm_network_receive_packets_total",
    "Packets received on the interface",
    LABELS,
);
static RX_ERRORS: MetricDesc = MetricDesc::counter(
    "libvirt_vm_network_receive_errors_total",
    "Receive errors on the interface",
    LABELS,
);
static RX_DROPS: MetricDesc = MetricDesc::counter(
    "libvirt_vm_network_receive_drops_total",
    "Received packets dropped on the interface",
    LABELS,
);
static TX_BYTES: MetricDesc = MetricDesc::counter(
    "libvirt_vm_network_transmit_bytes_total",
    "Bytes transmitted on the interface",
    LABELS,
);
static TX_PACKETS: MetricDesc = MetricDesc::counter(
    "libvirt_vm_network_transmit_packets_total",
    "Packets transmitted on the interface",
    LABELS,
);
static TX_ERRORS: MetricDesc = MetricDesc::counter(
    "libvirt_vm_network_transmit_errors_total",
    "Transmit errors on the interface",
    LABELS,
);
static TX_DROPS: MetricDesc = MetricDesc::counter(
    "libvirt_vm_network_transmit_drops_total",
    "Transmitted packets dropped on the interface",
    LABELS,
);

static DESCRIPTORS: &[&MetricDesc] = &[
    &RX_BYTES,
    &RX_PACKETS,
    &RX_ERRORS,
    &RX_DROPS,
    &TX_BYTES,
    &TX_PACKETS,
    &TX_ERRORS,
    &TX_DROPS,
];

pub struct NetworkCollector;

impl Collector for NetworkCollector {
    fn name(&self) -> &'static str {
        "network"
    }

    fn describe(&self) -> &'static [&'static MetricDesc] {
        DESCRIPTORS
    }

    fn collect(
        &self,
        _session: &Session,
        domain: Option<&DomainHandle>,
    ) -> Result<Vec<MetricRecord>, CollectorError> {
        let Some(domain) = domain else {
            return Ok(Vec::new());
        };
        if !require_running(domain)? {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for interface in discover_interfaces(domain) {
            let stats = match domain.api().interface_stats(&interface) {
                Ok(stats) => stats,
                Err(e) => {
                    log_skip(domain, self.name(), "get interface stats", &e);
                    continue;
                }
            };

            let labels = [domain.name(), domain.uuid(), interface.as_str()];
            let counters = [
                (&RX_BYTES, stats.rx_bytes),
                (&RX_PACKETS, stats.rx_packets),
                (&RX_ERRORS, stats.rx_errs),
                (&RX_DROPS, stats.rx_drop),
                (&TX_BYTES, stats.tx_bytes),
                (&TX_PACKETS, stats.tx_packets),
                (&TX_ERRORS, stats.tx_errs),
                (&TX_DROPS, stats.tx_drop),
            ];
            for (desc, raw) in counters {
                if let Some(value) = supported(raw) {
                    records.push(desc.record(&labels, value));
                }
            }
        }

        Ok(records)
    }
}
